use std::{
    fmt, io,
    net::SocketAddr,
    panic::Location,
    sync::{Arc, Condvar, Weak},
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::{
    assist::ThreadAssist,
    channel::{Channel, ChannelArgs, ChannelError},
    config::{Context, Mode, NowFn, ShutdownArgs, ShutdownFlags},
    dispatch::{with_ctx, Ctx, Handle, QuicObject},
    endpoint::{same_endpoint, NetEndpoint},
    error::{self, raise_detached, raise_detached_with, Error, ErrorCode},
    mutex::{Mutex, MutexGuard},
    reactor::{block_until_pred, tick_reactor, BlockFlags},
    stream::{free_xso, read_io, AonState, QuicStream, Xso, XsoId},
    stream_map::{Dir, Side},
    tls::{ExportKeyingMaterialError, HandshakeLayer},
};

/// Lock token for a connection's shared state
///
/// Functions which may suspend take the guard itself so that they can release it while waiting.
pub(crate) type ConnGuard<'a> = MutexGuard<'a, ConnState>;

/// A QUIC connection
///
/// Created with a default bidirectional stream, so the connection handle itself can be read from
/// and written to. Additional streams are opened with [`new_stream`](Self::new_stream).
///
/// Dropping the connection frees it: the default stream is concluded, the assist thread (if
/// any) is joined, and the channel and network endpoints are released. Stream handles that
/// outlive their connection fail every operation.
pub struct QuicConnection {
    pub(crate) inner: Arc<Mutex<ConnState>>,
}

impl QuicConnection {
    /// Create a client connection from `ctx`
    pub fn new(ctx: &Context) -> Result<Self, Error> {
        let tls = ctx.handshake_factory.new_handshake_layer().map_err(|e| {
            raise_detached_with(Error::Internal("handshake layer creation failed"), e)
        })?;

        let channel = ctx
            .channel_factory
            .new_channel(ChannelArgs {
                side: Side::Client,
                tls: tls.clone(),
                now: ctx.now.clone(),
            })
            .map_err(|e| raise_detached_with(Error::Internal("channel creation failed"), e))?;

        let thread_assisted = ctx.thread_assisted;
        let inner = Arc::new_cyclic(|weak| {
            Mutex::new(ConnState {
                tls: Some(tls),
                channel: Some(channel),
                net_rbio: None,
                net_wbio: None,
                can_poll_net_rbio: false,
                can_poll_net_wbio: false,
                blocking: true,
                default_blocking: true,
                default_mode: ctx.mode,
                init_peer_addr: None,
                started: false,
                as_server: false,
                as_server_state: false,
                thread_assisted,
                assist: None,
                last_error: ErrorCode::None,
                xsos: FxHashMap::default(),
                next_xso: 0,
                num_xso: 0,
                default_xso: None,
                freed: false,
                now: ctx.now.clone(),
                wake: Arc::new(Condvar::new()),
                weak: weak.clone(),
            })
        });
        let conn = Self { inner };

        {
            let mut state = conn.inner.lock("new");
            let xso = stream_new(&mut state, Dir::Bi)?;
            state.default_xso = Some(xso);
        }

        debug!(thread_assisted, "connection created");
        Ok(conn)
    }

    /// Open a new locally-initiated stream
    ///
    /// The stream inherits the connection's default blocking and write modes.
    pub fn new_stream(&self, dir: Dir) -> Result<QuicStream, Error> {
        with_ctx(self.handle(), "new_stream", |ctx| {
            let xso = stream_new(&mut ctx.conn, dir)?;
            let stream = ctx.conn.xsos[&xso].stream;
            Ok(QuicStream::new(Arc::downgrade(&self.inner), xso, stream))
        })
    }

    /// Number of live stream objects, including the default stream
    pub fn stream_count(&self) -> usize {
        self.inner.lock("stream_count").num_xso
    }

    /// Install the endpoint datagrams are received from
    ///
    /// Blocking mode is disabled if the endpoint cannot be polled.
    pub fn set_net_rbio(&self, endpoint: Option<Arc<dyn NetEndpoint>>) -> Result<(), Error> {
        with_ctx(self.handle(), "set_net_rbio", |ctx| {
            set_net_endpoint(&mut ctx.conn, endpoint, Direction::Read)
        })
    }

    /// Install the endpoint datagrams are sent through
    ///
    /// Blocking mode is disabled if the endpoint cannot be polled. If no peer address has been
    /// configured and the handshake has not started, the endpoint's current destination is
    /// adopted as the peer address.
    pub fn set_net_wbio(&self, endpoint: Option<Arc<dyn NetEndpoint>>) -> Result<(), Error> {
        with_ctx(self.handle(), "set_net_wbio", |ctx| {
            set_net_endpoint(&mut ctx.conn, endpoint, Direction::Write)
        })
    }

    /// The endpoint datagrams are received from
    pub fn net_rbio(&self) -> Option<Arc<dyn NetEndpoint>> {
        self.inner.lock("net_rbio").net_rbio.clone()
    }

    /// The endpoint datagrams are sent through
    pub fn net_wbio(&self) -> Option<Arc<dyn NetEndpoint>> {
        self.inner.lock("net_wbio").net_wbio.clone()
    }

    /// The peer address the handshake will be started with
    pub fn initial_peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock("initial_peer_addr").init_peer_addr
    }

    /// Derive keying material from this connection's TLS session secrets
    pub fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> Result<(), ExportKeyingMaterialError> {
        let tls = self.inner.lock("export_keying_material").tls.clone();
        match tls {
            Some(tls) if tls.is_handshake_complete() => {
                tls.export_keying_material(output, label, context)
            }
            _ => Err(ExportKeyingMaterialError::HandshakeIncomplete),
        }
    }
}

impl QuicObject for QuicConnection {
    fn handle(&self) -> Handle<'_> {
        Handle::Connection(self)
    }
}

impl Drop for QuicConnection {
    fn drop(&mut self) {
        let mut state = self.inner.lock("free");
        if let Some(xso) = state.default_xso.take() {
            free_xso(&mut state, xso);
        }
        if state.num_xso != 0 {
            warn!(
                remaining = state.num_xso,
                "connection freed while stream objects are alive"
            );
        }
        let assist = state.assist.take();
        drop(state);

        // The assist thread takes the lock itself, so it must be joined with the lock released
        if let Some(assist) = assist {
            assist.stop();
        }

        let mut state = self.inner.lock("free");
        state.freed = true;
        state.xsos.clear();
        state.channel = None;
        state.net_rbio = None;
        state.net_wbio = None;
        state.tls = None;
        debug!("connection freed");
    }
}

impl io::Read for QuicConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_io(&*self, buf)
    }
}

impl io::Write for QuicConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        QuicObject::write(&*self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for QuicConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock("fmt");
        f.debug_struct("QuicConnection")
            .field("started", &state.started)
            .field("blocking", &state.blocking)
            .field("init_peer_addr", &state.init_peer_addr)
            .field("num_xso", &state.num_xso)
            .finish_non_exhaustive()
    }
}

/// State shared by a connection and all of its streams
pub(crate) struct ConnState {
    pub(crate) tls: Option<Arc<dyn HandshakeLayer>>,
    /// Present until the connection is freed
    channel: Option<Box<dyn Channel>>,
    pub(crate) net_rbio: Option<Arc<dyn NetEndpoint>>,
    pub(crate) net_wbio: Option<Arc<dyn NetEndpoint>>,
    pub(crate) can_poll_net_rbio: bool,
    pub(crate) can_poll_net_wbio: bool,
    /// Blocking mode of connection-level operations
    pub(crate) blocking: bool,
    /// Blocking mode inherited by new streams
    pub(crate) default_blocking: bool,
    /// Write mode inherited by new streams
    pub(crate) default_mode: Mode,
    /// Immutable once `started`
    pub(crate) init_peer_addr: Option<SocketAddr>,
    pub(crate) started: bool,
    /// Role the connection was created with
    as_server: bool,
    /// Role requested through connect/accept state
    as_server_state: bool,
    pub(crate) thread_assisted: bool,
    assist: Option<ThreadAssist>,
    pub(crate) last_error: ErrorCode,
    pub(crate) xsos: FxHashMap<XsoId, Xso>,
    next_xso: u64,
    /// Live stream objects, including the default one
    pub(crate) num_xso: usize,
    pub(crate) default_xso: Option<XsoId>,
    pub(crate) freed: bool,
    now: Option<NowFn>,
    /// Signalled whenever the reactor makes progress
    pub(crate) wake: Arc<Condvar>,
    weak: Weak<Mutex<ConnState>>,
}

impl ConnState {
    /// The connection's channel
    ///
    /// Dispatch refuses freed connections, so the channel is always present here.
    pub(crate) fn channel(&mut self) -> &mut dyn Channel {
        self.channel
            .as_deref_mut()
            .expect("channel is only released when the connection is freed")
    }

    pub(crate) fn now(&self) -> Instant {
        match &self.now {
            Some(now) => now(),
            None => Instant::now(),
        }
    }

    /// Record `error` as the outcome of the current operation
    #[track_caller]
    pub(crate) fn raise(&mut self, error: Error) -> Error {
        self.last_error = error.code();
        if !error.is_normal() {
            error::record(error, Location::caller(), None);
        }
        error
    }

    /// Like [`raise`](Self::raise) for non-normal errors caused by a collaborator failure
    #[track_caller]
    pub(crate) fn raise_with(&mut self, error: Error, detail: impl fmt::Display) -> Error {
        self.last_error = error.code();
        error::record(error, Location::caller(), Some(detail.to_string()));
        error
    }

    /// Whether connection-level operations block
    pub(crate) fn blocking_mode(&self) -> bool {
        self.blocking
    }

    /// Whether operations on a stream block
    ///
    /// The stream's own flag is vetoed unless both network endpoints can be polled.
    pub(crate) fn xso_blocking_mode(&self, xso: &Xso) -> bool {
        xso.blocking && self.can_poll_net_rbio && self.can_poll_net_wbio
    }

    /// Wake anything waiting for this connection to make progress
    pub(crate) fn notify_progress(&self) {
        self.wake.notify_all();
    }

    /// Asserts the invariants tying stream objects to their connection
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.num_xso, self.xsos.len());
        if let Some(xso) = self.default_xso {
            assert!(self.xsos.contains_key(&xso));
        }
        for xso in self.xsos.values() {
            if let AonState::InProgress { len, pos, .. } = xso.aon {
                assert!(0 < pos && pos < len, "AON cursor {pos} outside 0..{len}");
                assert!(!xso.mode.contains(Mode::ENABLE_PARTIAL_WRITE));
            }
        }
    }
}

/// Allocate a stream object for a new locally-initiated stream
pub(crate) fn stream_new(state: &mut ConnState, dir: Dir) -> Result<XsoId, Error> {
    if state.channel().is_term_any() {
        return Err(state.raise(Error::ProtocolIsShutdown));
    }

    let stream = match state.channel().new_stream_local(dir) {
        Ok(stream) => stream,
        Err(e) => return Err(state.raise_with(Error::Internal("stream creation failed"), e)),
    };

    let id = XsoId(state.next_xso);
    state.next_xso += 1;
    state.xsos.insert(
        id,
        Xso {
            stream,
            blocking: state.default_blocking,
            mode: state.default_mode,
            aon: AonState::Inactive,
        },
    );
    state.num_xso += 1;
    debug!(%stream, "stream object created");
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

fn set_net_endpoint(
    state: &mut ConnState,
    endpoint: Option<Arc<dyn NetEndpoint>>,
    dir: Direction,
) -> Result<(), Error> {
    let current = match dir {
        Direction::Read => &state.net_rbio,
        Direction::Write => &state.net_wbio,
    };
    let unchanged = match (current, &endpoint) {
        (Some(a), Some(b)) => same_endpoint(a, b),
        (None, None) => true,
        _ => false,
    };
    if unchanged {
        return Ok(());
    }

    let adopted = match dir {
        Direction::Read => state.channel().set_net_rbio(endpoint.clone()),
        Direction::Write => state.channel().set_net_wbio(endpoint.clone()),
    };
    if let Err(e) = adopted {
        return Err(state.raise_with(Error::InvalidArgument, e));
    }

    let pollable = endpoint
        .as_ref()
        .map(|e| e.poll_descriptor().is_pollable());
    match dir {
        Direction::Read => state.net_rbio = endpoint.clone(),
        Direction::Write => state.net_wbio = endpoint.clone(),
    }

    if let Some(pollable) = pollable {
        if !pollable {
            debug!(?dir, "endpoint cannot be polled, blocking mode disabled");
            state.blocking = false;
            state.default_blocking = false;
        }
        match dir {
            Direction::Read => state.can_poll_net_rbio = pollable,
            Direction::Write => state.can_poll_net_wbio = pollable,
        }
    }

    // The destination is captured once here rather than re-read on every send, since a
    // stateless receive path could otherwise be used to redirect it
    if let (Direction::Write, Some(endpoint)) = (dir, &endpoint) {
        if state.init_peer_addr.is_none() && !state.started {
            state.init_peer_addr = endpoint.peer_addr().ok();
            trace!(peer = ?state.init_peer_addr, "detected initial peer address");
            let addr = state.init_peer_addr;
            if let Err(e) = state.channel().set_peer_addr(addr) {
                debug!(error = %e, "channel refused detected peer address");
            }
        }
    }
    Ok(())
}

pub(crate) fn set_blocking_mode(ctx: &mut Ctx<'_>, blocking: bool) -> Result<(), Error> {
    let state = &mut *ctx.conn;
    if blocking && !(state.can_poll_net_rbio && state.can_poll_net_wbio) {
        return Err(state.raise(Error::Unsupported));
    }

    if !ctx.is_stream {
        state.blocking = blocking;
        state.default_blocking = blocking;
    }
    if let Some(xso) = ctx.xso.and_then(|id| state.xsos.get_mut(&id)) {
        xso.blocking = blocking;
    }
    Ok(())
}

pub(crate) fn blocking_mode(ctx: &Ctx<'_>) -> bool {
    if ctx.is_stream {
        ctx.xso
            .and_then(|id| ctx.conn.xsos.get(&id))
            .map_or(false, |xso| xso.blocking)
    } else {
        ctx.conn.blocking
    }
}

pub(crate) fn set_initial_peer_addr(
    state: &mut ConnState,
    addr: Option<SocketAddr>,
) -> Result<(), Error> {
    if state.started {
        return Err(state.raise(Error::ShouldNotHaveBeenCalled));
    }
    state.init_peer_addr = addr;
    Ok(())
}

pub(crate) fn tick_timeout(state: &mut ConnState) -> Option<Duration> {
    let deadline = state.channel().reactor().tick_deadline()?;
    Some(deadline.saturating_duration_since(state.now()))
}

pub(crate) fn set_mode(ctx: &mut Ctx<'_>, mut mode: Mode) -> Mode {
    let state = &mut *ctx.conn;
    if !ctx.is_stream {
        state.default_mode.insert(mode);
    }
    match ctx.xso.and_then(|id| state.xsos.get_mut(&id)) {
        Some(xso) => {
            if matches!(xso.aon, AonState::InProgress { .. }) {
                mode.remove(Mode::ENABLE_PARTIAL_WRITE);
            }
            xso.mode.insert(mode);
            xso.mode
        }
        None => state.default_mode,
    }
}

pub(crate) fn clear_mode(ctx: &mut Ctx<'_>, mode: Mode) -> Mode {
    let state = &mut *ctx.conn;
    if !ctx.is_stream {
        state.default_mode.remove(mode);
    }
    match ctx.xso.and_then(|id| state.xsos.get_mut(&id)) {
        Some(xso) => {
            xso.mode.remove(mode);
            xso.mode
        }
        None => state.default_mode,
    }
}

pub(crate) fn mode(ctx: &Ctx<'_>) -> Mode {
    match ctx.xso.and_then(|id| ctx.conn.xsos.get(&id)) {
        Some(xso) => xso.mode,
        None => ctx.conn.default_mode,
    }
}

/// Request the client or server role; ignored once started or on a stream
pub(crate) fn set_server_state(ctx: &mut Ctx<'_>, as_server: bool) {
    if ctx.conn.started || ctx.is_stream {
        return;
    }
    ctx.conn.as_server_state = as_server;
}

fn configure_channel(state: &mut ConnState) -> Result<(), ChannelError> {
    let rbio = state.net_rbio.clone();
    let wbio = state.net_wbio.clone();
    let peer = state.init_peer_addr;
    let ch = state.channel();
    ch.set_net_rbio(rbio)?;
    ch.set_net_wbio(wbio)?;
    ch.set_peer_addr(peer)
}

/// Start the channel, and the assist thread if configured, on first use
fn ensure_channel_started(state: &mut ConnState) -> Result<(), Error> {
    if state.started {
        return Ok(());
    }

    let started = configure_channel(state).and_then(|()| state.channel().start());
    if let Err(e) = started {
        return Err(state.raise_with(Error::Internal("failed to start channel"), e));
    }

    if state.thread_assisted {
        match ThreadAssist::start(state.weak.clone()) {
            Ok(assist) => state.assist = Some(assist),
            Err(e) => {
                return Err(state.raise_with(Error::Internal("failed to start assist thread"), e))
            }
        }
    }

    state.started = true;
    debug!(peer = ?state.init_peer_addr, "channel started");
    Ok(())
}

/// Drive the handshake as far as the connection's blocking mode allows
///
/// Errors are raised on the connection before being returned.
pub(crate) fn do_handshake(conn: &mut ConnGuard<'_>) -> Result<(), Error> {
    if conn.channel().is_handshake_complete() {
        return Ok(());
    }

    if conn.channel().is_term_any() {
        return Err(conn.raise(Error::ProtocolIsShutdown));
    }

    if conn.init_peer_addr.is_none() {
        return Err(conn.raise(Error::RemotePeerAddressNotSet));
    }

    // Must match the role the connection was created with
    if conn.as_server != conn.as_server_state {
        return Err(conn.raise(Error::InvalidArgument));
    }

    if conn.net_rbio.is_none() || conn.net_wbio.is_none() {
        return Err(conn.raise(Error::NetEndpointNotSet));
    }

    // May be reached repeatedly in non-blocking mode
    ensure_channel_started(conn)?;

    if conn.channel().is_handshake_complete() {
        return Ok(());
    }

    if conn.blocking_mode() {
        let result = block_until_pred(conn, BlockFlags::default(), |state| {
            let ch = state.channel();
            if !ch.is_active() {
                return Err(Error::ProtocolIsShutdown);
            }
            Ok(ch.is_handshake_complete())
        });
        if let (Err(e), true) = (result, conn.freed) {
            return Err(conn.raise(e));
        }
        if !conn.channel().is_active() {
            return Err(conn.raise(Error::ProtocolIsShutdown));
        }
        if let Err(e) = result {
            return Err(conn.raise_with(Error::Internal("handshake wait failed"), e));
        }
        debug_assert!(conn.channel().is_handshake_complete());
        trace!("handshake complete");
        Ok(())
    } else {
        tick_reactor(conn);
        if conn.channel().is_handshake_complete() {
            trace!("handshake complete");
            return Ok(());
        }
        Err(conn.raise(Error::WantRead))
    }
}

/// Begin closing the connection, waiting for termination in blocking mode unless `rapid`
pub(crate) fn shutdown(
    ctx: &mut Ctx<'_>,
    flags: ShutdownFlags,
    args: Option<&ShutdownArgs>,
) -> Result<bool, Error> {
    if ctx.is_stream {
        return Err(ctx.conn.raise(Error::Unsupported));
    }

    let conn = &mut ctx.conn;
    let code = args.map_or(0, |args| args.quic_error_code);
    debug!(code, rapid = flags.rapid, "shutting down");
    conn.channel().local_close(code);

    if conn.channel().is_terminated() {
        return Ok(true);
    }

    if conn.blocking_mode() && !flags.rapid {
        let result = block_until_pred(conn, BlockFlags::default(), |state| {
            Ok(state.channel().is_terminated())
        });
        if let Err(e) = result {
            if conn.freed {
                return Err(conn.raise(e));
            }
            debug!(error = %e, "stopped waiting for termination");
        }
    } else {
        tick_reactor(conn);
    }

    Ok(conn.channel().is_terminated())
}

pub(crate) fn inject_datagram(
    state: &mut ConnState,
    datagram: &[u8],
    peer: SocketAddr,
    local: Option<SocketAddr>,
) -> Result<(), Error> {
    match state.channel().inject_datagram(datagram, peer, local) {
        Ok(()) => Ok(()),
        Err(e) => Err(state.raise_with(Error::Internal("datagram injection failed"), e)),
    }
}

pub(crate) fn force_assist_thread_wake(state: &ConnState) {
    if let Some(assist) = &state.assist {
        assist.notify();
    }
}

/// Raised when a handle can no longer be resolved to its connection
#[track_caller]
pub(crate) fn connection_gone() -> Error {
    raise_detached(Error::Internal("connection has been freed"))
}
