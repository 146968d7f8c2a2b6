use std::fmt;

use thiserror::Error;

/// The TLS 1.3 handshake engine driving a connection's cryptographic handshake
///
/// Only consulted by the front-end; the [`Channel`](crate::Channel) feeds it handshake data.
/// Implementations synchronize internally, since the handle is shared with the channel.
pub trait HandshakeLayer: Send + Sync + fmt::Debug {
    /// Whether the cryptographic handshake has completed
    fn is_handshake_complete(&self) -> bool;

    /// Derive keying material from this connection's TLS session secrets.
    ///
    /// When both peers call this method with the same `label` and `context`
    /// arguments and `output` buffers of equal length, they will get the
    /// same sequence of bytes in `output`.
    ///
    /// See [RFC5705](https://tools.ietf.org/html/rfc5705) for more information.
    fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> Result<(), ExportKeyingMaterialError>;
}

/// Error returned by [`HandshakeLayer::export_keying_material`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExportKeyingMaterialError {
    /// The handshake has not produced session secrets yet
    #[error("handshake not complete")]
    HandshakeIncomplete,
    /// The requested output length is not supported
    #[error("requested output length not supported")]
    InvalidLength,
}
