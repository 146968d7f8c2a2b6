use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
    sync::Arc,
    time::Instant,
};

use crate::{channel::ChannelFactory, tls::HandshakeLayer, ChannelError};

/// Clock used in place of [`Instant::now`] when a time override is configured
pub type NowFn = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Creates the handshake layer owned by each new connection
pub trait HandshakeFactory: Send + Sync {
    /// Construct the handshake layer for one client connection
    fn new_handshake_layer(&self) -> Result<Arc<dyn HandshakeLayer>, ChannelError>;
}

impl<F> HandshakeFactory for F
where
    F: Fn() -> Result<Arc<dyn HandshakeLayer>, ChannelError> + Send + Sync,
{
    fn new_handshake_layer(&self) -> Result<Arc<dyn HandshakeLayer>, ChannelError> {
        self()
    }
}

/// Write behaviour of a stream
///
/// Combine flags with `|`. Connections hold a default mode which new streams inherit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mode(u32);

impl Mode {
    /// Writes return as soon as any data has been buffered, reporting a partial count
    ///
    /// When unset, non-blocking writes are all-or-nothing: a write that cannot be buffered
    /// entirely fails with [`Error::WantWrite`](crate::Error::WantWrite) and must be retried
    /// with the same buffer and length until it completes.
    pub const ENABLE_PARTIAL_WRITE: Self = Self(0x1);
    /// All-or-nothing writes may be retried from a relocated buffer with the same contents
    pub const ACCEPT_MOVING_WRITE_BUFFER: Self = Self(0x2);

    /// No flags set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw flag bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set in `self`
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every flag in `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear every flag in `other`
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for Mode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::ENABLE_PARTIAL_WRITE) {
            set.entry(&"ENABLE_PARTIAL_WRITE");
        }
        if self.contains(Self::ACCEPT_MOVING_WRITE_BUFFER) {
            set.entry(&"ACCEPT_MOVING_WRITE_BUFFER");
        }
        set.finish()
    }
}

/// Options for [`QuicObject::shutdown`](crate::QuicObject::shutdown)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownFlags {
    /// Do not wait for the connection to terminate, even in blocking mode
    pub rapid: bool,
}

/// Arguments transmitted to the peer when shutting down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownArgs {
    /// Application error code carried by the CONNECTION_CLOSE frame
    pub quic_error_code: u64,
}

/// Parameters shared by the connections created from it
///
/// Default values should be suitable for most internet applications.
#[derive(Clone)]
pub struct Context {
    pub(crate) channel_factory: Arc<dyn ChannelFactory>,
    pub(crate) handshake_factory: Arc<dyn HandshakeFactory>,
    pub(crate) mode: Mode,
    pub(crate) thread_assisted: bool,
    pub(crate) now: Option<NowFn>,
}

impl Context {
    /// Create a context building channels and handshake layers with the given factories
    pub fn new(
        channel_factory: Arc<dyn ChannelFactory>,
        handshake_factory: Arc<dyn HandshakeFactory>,
    ) -> Self {
        Self {
            channel_factory,
            handshake_factory,
            mode: Mode::empty(),
            thread_assisted: false,
            now: None,
        }
    }

    /// Write mode inherited by connections and, through them, by their streams
    pub fn mode(&mut self, value: Mode) -> &mut Self {
        self.mode = value;
        self
    }

    /// Whether to drive each connection from a background thread once its handshake starts
    ///
    /// Without assistance, timers only fire while the application calls into the connection.
    pub fn thread_assisted(&mut self, value: bool) -> &mut Self {
        self.thread_assisted = value;
        self
    }

    /// Replace the clock used for protocol timing
    ///
    /// Mostly useful for tests that need deterministic time.
    pub fn now_override(&mut self, now: impl Fn() -> Instant + Send + Sync + 'static) -> &mut Self {
        self.now = Some(Arc::new(now));
        self
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("mode", &self.mode)
            .field("thread_assisted", &self.thread_assisted)
            .field("now_override", &self.now.is_some())
            .finish_non_exhaustive()
    }
}
