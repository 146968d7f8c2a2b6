use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
    config::NowFn,
    endpoint::NetEndpoint,
    stream_map::{Dir, Side, StreamError, StreamId, StreamMap},
    tls::HandshakeLayer,
};

/// Event loop performing a connection's network I/O and timer processing
///
/// A reactor never blocks; the connection decides when and how to wait for it.
pub trait Reactor: Send {
    /// Perform all I/O and timer work that is currently possible
    fn tick(&mut self) -> Result<(), ChannelError>;

    /// When the reactor next needs to be ticked regardless of I/O readiness
    fn tick_deadline(&self) -> Option<Instant>;

    /// Whether the reactor wants to be ticked when the read endpoint becomes readable
    fn net_read_desired(&self) -> bool;

    /// Whether the reactor wants to be ticked when the write endpoint becomes writable
    fn net_write_desired(&self) -> bool;
}

/// Protocol state machine of one QUIC connection
///
/// Owns the connection's [`Reactor`] and [`StreamMap`]. Dropping the channel tears both down.
pub trait Channel: Send {
    /// Begin the handshake
    fn start(&mut self) -> Result<(), ChannelError>;

    /// Adopt a new read endpoint
    fn set_net_rbio(
        &mut self,
        endpoint: Option<Arc<dyn NetEndpoint>>,
    ) -> Result<(), ChannelError>;

    /// Adopt a new write endpoint
    fn set_net_wbio(
        &mut self,
        endpoint: Option<Arc<dyn NetEndpoint>>,
    ) -> Result<(), ChannelError>;

    /// Configure the initial destination address
    fn set_peer_addr(&mut self, addr: Option<SocketAddr>) -> Result<(), ChannelError>;

    /// Whether the handshake has completed
    fn is_handshake_complete(&self) -> bool;

    /// Whether the connection is established or establishing and not terminating
    fn is_active(&self) -> bool;

    /// Whether the connection has fully terminated
    fn is_terminated(&self) -> bool;

    /// Whether the connection is terminating or has terminated
    fn is_term_any(&self) -> bool;

    /// Begin an immediate close carrying `app_error_code`
    fn local_close(&mut self, app_error_code: u64);

    /// The event loop driving this channel
    fn reactor(&mut self) -> &mut dyn Reactor;

    /// The connection's streams
    fn stream_map(&mut self) -> &mut StreamMap;

    /// Round trip time statistics
    fn rtt_info(&self) -> RttInfo;

    /// Open a locally-initiated stream
    fn new_stream_local(&mut self, dir: Dir) -> Result<StreamId, ChannelError>;

    /// Process `datagram` as if it had been received from `peer` at `local`
    fn inject_datagram(
        &mut self,
        datagram: &[u8],
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(), ChannelError>;
}

/// Round trip time statistics of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttInfo {
    /// Exponentially weighted moving average of round trip samples
    pub smoothed_rtt: Duration,
}

/// Everything a [`ChannelFactory`] is given to build a channel
#[derive(Clone)]
pub struct ChannelArgs {
    /// Whether the channel acts as client or server
    pub side: Side,
    /// The handshake layer the channel feeds
    pub tls: Arc<dyn HandshakeLayer>,
    /// Clock override, if the connection was configured with one
    pub now: Option<NowFn>,
}

/// Builds the [`Channel`] of each new connection
pub trait ChannelFactory: Send + Sync {
    /// Construct a channel
    fn new_channel(&self, args: ChannelArgs) -> Result<Box<dyn Channel>, ChannelError>;
}

impl<F> ChannelFactory for F
where
    F: Fn(ChannelArgs) -> Result<Box<dyn Channel>, ChannelError> + Send + Sync,
{
    fn new_channel(&self, args: ChannelArgs) -> Result<Box<dyn Channel>, ChannelError> {
        self(args)
    }
}

/// Failures reported by a [`Channel`] or its [`Reactor`]
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel cannot use the endpoint it was given
    #[error("network endpoint rejected")]
    EndpointRejected,
    /// The peer does not allow opening more streams
    #[error("stream limit reached")]
    StreamLimit,
    /// The operation requires a running channel
    #[error("channel not running")]
    NotRunning,
    /// Network I/O failed
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A stream buffer or flow controller rejected an operation
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Any other failure
    #[error("{0}")]
    Other(String),
}
