use std::{net::SocketAddr, time::Duration};

use tracing::debug;

use crate::{
    config::{Mode, ShutdownArgs, ShutdownFlags},
    connection::{self, connection_gone, ConnGuard, QuicConnection},
    endpoint::PollDescriptor,
    error::{Error, ErrorCode},
    reactor::tick_reactor,
    recv_stream, send_stream,
    stream::{BufferIdentity, QuicStream, XsoId},
};

/// A handle that front-end operations are dispatched on
#[derive(Debug, Clone, Copy)]
pub enum Handle<'a> {
    /// A connection, standing in for its default stream in stream operations
    Connection(&'a QuicConnection),
    /// A stream
    Stream(&'a QuicStream),
}

/// A resolved handle with its connection locked
pub(crate) struct Ctx<'a> {
    pub(crate) conn: ConnGuard<'a>,
    /// The stream addressed, which for a connection handle is its default stream
    pub(crate) xso: Option<XsoId>,
    /// Whether a stream handle was passed
    pub(crate) is_stream: bool,
}

impl Ctx<'_> {
    /// The addressed stream, for operations that need one
    #[track_caller]
    pub(crate) fn expect_stream(&mut self) -> Result<XsoId, Error> {
        match self.xso {
            Some(id) if self.conn.xsos.contains_key(&id) => Ok(id),
            _ => Err(self.conn.raise(Error::Internal("no stream available"))),
        }
    }
}

/// Resolve `handle`, lock its connection and run `f`
///
/// The outcome of `f` becomes the connection's last error.
pub(crate) fn with_ctx<R>(
    handle: Handle<'_>,
    purpose: &'static str,
    f: impl FnOnce(&mut Ctx<'_>) -> Result<R, Error>,
) -> Result<R, Error> {
    resolve(handle, purpose, true, f)
}

/// Like [`with_ctx`] for queries, which leave the last error alone
pub(crate) fn inspect_ctx<R>(
    handle: Handle<'_>,
    purpose: &'static str,
    f: impl FnOnce(&mut Ctx<'_>) -> Result<R, Error>,
) -> Result<R, Error> {
    resolve(handle, purpose, false, f)
}

fn resolve<R>(
    handle: Handle<'_>,
    purpose: &'static str,
    clear_error: bool,
    f: impl FnOnce(&mut Ctx<'_>) -> Result<R, Error>,
) -> Result<R, Error> {
    let (shared, stream) = match handle {
        Handle::Connection(conn) => (conn.inner.clone(), None),
        Handle::Stream(stream) => match stream.shared() {
            Some(shared) => (shared, Some(stream.xso())),
            None => return Err(connection_gone()),
        },
    };

    let conn = shared.lock(purpose);
    if conn.freed {
        return Err(connection_gone());
    }

    let is_stream = stream.is_some();
    let xso = if is_stream { stream } else { conn.default_xso };
    let mut ctx = Ctx {
        conn,
        xso,
        is_stream,
    };
    if clear_error {
        ctx.conn.last_error = ErrorCode::None;
    }
    f(&mut ctx)
}

mod private {
    pub trait Sealed {}

    impl Sealed for crate::QuicConnection {}
    impl Sealed for crate::QuicStream {}
}

/// Operations shared by connection and stream handles
///
/// Stream operations invoked on a [`QuicConnection`] act on its default stream. Every operation
/// locks the connection for its duration; blocking operations release the lock only while
/// waiting for the network.
///
/// Errors are also recorded: [`last_error`](Self::last_error) reflects the most recent
/// operation, and non-normal errors leave a record on the
/// [`error_queue`](crate::error_queue).
pub trait QuicObject: private::Sealed {
    /// The handle operations are dispatched on
    fn handle(&self) -> Handle<'_>;

    /// Reset the object for reuse; currently does nothing
    fn reset(&self) -> Result<(), Error> {
        with_ctx(self.handle(), "reset", |_| Ok(()))
    }

    /// Clear per-session state; currently does nothing
    fn clear(&self) -> Result<(), Error> {
        with_ctx(self.handle(), "clear", |_| Ok(()))
    }

    /// Outcome of the most recent operation on the connection
    fn last_error(&self) -> ErrorCode {
        inspect_ctx(self.handle(), "last_error", |ctx| Ok(ctx.conn.last_error))
            .unwrap_or(ErrorCode::Failure)
    }

    /// Whether operations on this handle block
    fn blocking_mode(&self) -> bool {
        inspect_ctx(self.handle(), "blocking_mode", |ctx| {
            Ok(connection::blocking_mode(ctx))
        })
        .unwrap_or(false)
    }

    /// Switch between blocking and non-blocking operation
    ///
    /// On a connection this also sets the mode inherited by new streams. Blocking mode requires
    /// both network endpoints to be pollable, and fails with [`Error::Unsupported`] otherwise.
    fn set_blocking_mode(&self, blocking: bool) -> Result<(), Error> {
        with_ctx(self.handle(), "set_blocking_mode", |ctx| {
            connection::set_blocking_mode(ctx, blocking)
        })
    }

    /// Set the address the handshake is started towards, or clear it with `None`
    ///
    /// Fails with [`Error::ShouldNotHaveBeenCalled`] once the handshake has started.
    fn set_initial_peer_addr(&self, addr: Option<SocketAddr>) -> Result<(), Error> {
        with_ctx(self.handle(), "set_initial_peer_addr", |ctx| {
            connection::set_initial_peer_addr(&mut ctx.conn, addr)
        })
    }

    /// Perform any network I/O and timer processing that is due
    fn tick(&self) -> Result<(), Error> {
        with_ctx(self.handle(), "tick", |ctx| {
            tick_reactor(&mut ctx.conn);
            Ok(())
        })
    }

    /// Time until [`tick`](Self::tick) should next be called, or `None` if no timer is armed
    fn tick_timeout(&self) -> Result<Option<Duration>, Error> {
        inspect_ctx(self.handle(), "tick_timeout", |ctx| {
            Ok(connection::tick_timeout(&mut ctx.conn))
        })
    }

    /// Descriptor to wait on for the read endpoint to become readable
    fn read_poll_descriptor(&self) -> Result<PollDescriptor, Error> {
        with_ctx(self.handle(), "read_poll_descriptor", |ctx| {
            match ctx.conn.net_rbio.as_ref().map(|e| e.poll_descriptor()) {
                Some(d) => Ok(d),
                None => Err(ctx.conn.raise(Error::NetEndpointNotSet)),
            }
        })
    }

    /// Descriptor to wait on for the write endpoint to become writable
    fn write_poll_descriptor(&self) -> Result<PollDescriptor, Error> {
        with_ctx(self.handle(), "write_poll_descriptor", |ctx| {
            match ctx.conn.net_wbio.as_ref().map(|e| e.poll_descriptor()) {
                Some(d) => Ok(d),
                None => Err(ctx.conn.raise(Error::NetEndpointNotSet)),
            }
        })
    }

    /// Whether the connection wants to be ticked once the read endpoint is readable
    fn net_read_desired(&self) -> bool {
        inspect_ctx(self.handle(), "net_read_desired", |ctx| {
            Ok(ctx.conn.channel().reactor().net_read_desired())
        })
        .unwrap_or(false)
    }

    /// Whether the connection wants to be ticked once the write endpoint is writable
    fn net_write_desired(&self) -> bool {
        inspect_ctx(self.handle(), "net_write_desired", |ctx| {
            Ok(ctx.conn.channel().reactor().net_write_desired())
        })
        .unwrap_or(false)
    }

    /// Start or continue the handshake
    ///
    /// Returns immediately once the handshake is complete. In non-blocking mode an incomplete
    /// handshake fails with [`Error::WantRead`] and must be retried. See
    /// [`Error::handshake_status`] for the integer form of failures.
    fn do_handshake(&self) -> Result<(), Error> {
        with_ctx(self.handle(), "do_handshake", |ctx| {
            connection::do_handshake(&mut ctx.conn)
        })
    }

    /// Act as a client; ignored once the handshake has started or on a stream
    fn set_connect_state(&self) {
        let result = with_ctx(self.handle(), "set_connect_state", |ctx| {
            connection::set_server_state(ctx, false);
            Ok(())
        });
        if let Err(e) = result {
            debug!(error = %e, "client role not applied");
        }
    }

    /// Act as a server; ignored once the handshake has started or on a stream
    ///
    /// Server operation is not supported, so a subsequent handshake fails with
    /// [`Error::InvalidArgument`].
    fn set_accept_state(&self) {
        let result = with_ctx(self.handle(), "set_accept_state", |ctx| {
            connection::set_server_state(ctx, true);
            Ok(())
        });
        if let Err(e) = result {
            debug!(error = %e, "server role not applied");
        }
    }

    /// Enter the client role and drive the handshake
    fn connect(&self) -> Result<(), Error> {
        self.set_connect_state();
        self.do_handshake()
    }

    /// Enter the server role and drive the handshake
    fn accept(&self) -> Result<(), Error> {
        self.set_accept_state();
        self.do_handshake()
    }

    /// Close the connection
    ///
    /// Returns whether the connection has terminated. In blocking mode this waits for
    /// termination unless `flags.rapid` is set. Not supported on streams.
    fn shutdown(&self, flags: ShutdownFlags, args: Option<&ShutdownArgs>) -> Result<bool, Error> {
        with_ctx(self.handle(), "shutdown", |ctx| {
            connection::shutdown(ctx, flags, args)
        })
    }

    /// The current write mode
    fn mode(&self) -> Mode {
        inspect_ctx(self.handle(), "mode", |ctx| Ok(connection::mode(ctx)))
            .unwrap_or_default()
    }

    /// Set write mode flags, returning the resulting mode
    ///
    /// [`Mode::ENABLE_PARTIAL_WRITE`] is ignored while an all-or-nothing write is in progress.
    fn set_mode(&self, mode: Mode) -> Result<Mode, Error> {
        with_ctx(self.handle(), "set_mode", |ctx| {
            Ok(connection::set_mode(ctx, mode))
        })
    }

    /// Clear write mode flags, returning the resulting mode
    fn clear_mode(&self, mode: Mode) -> Result<Mode, Error> {
        with_ctx(self.handle(), "clear_mode", |ctx| {
            Ok(connection::clear_mode(ctx, mode))
        })
    }

    /// Write data to the stream
    ///
    /// Blocking writes return once all of `buf` is buffered. Non-blocking writes with
    /// [`Mode::ENABLE_PARTIAL_WRITE`] return how much could be buffered, possibly zero.
    /// Otherwise a write that cannot complete fails with [`Error::WantWrite`] and must be
    /// retried with the same buffer and length; the retry that completes it reports the full
    /// length.
    fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        with_ctx(self.handle(), "write", |ctx| {
            send_stream::write(ctx, buf, BufferIdentity::Address(buf.as_ptr() as usize))
        })
    }

    /// Like [`write`](Self::write), identifying retries by `token` instead of buffer address
    fn write_with_token(&self, buf: &[u8], token: u64) -> Result<usize, Error> {
        with_ctx(self.handle(), "write", |ctx| {
            send_stream::write(ctx, buf, BufferIdentity::Token(token))
        })
    }

    /// Read data from the stream
    ///
    /// Once the end of the stream has been consumed, fails with [`Error::ZeroReturn`].
    fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        with_ctx(self.handle(), "read", |ctx| recv_stream::read(ctx, buf, false))
    }

    /// Like [`read`](Self::read) without consuming anything
    ///
    /// Never blocks; returns `Ok(0)` when no data is available.
    fn peek(&self, buf: &mut [u8]) -> Result<usize, Error> {
        with_ctx(self.handle(), "peek", |ctx| recv_stream::read(ctx, buf, true))
    }

    /// Bytes that can be read without blocking
    fn pending(&self) -> usize {
        inspect_ctx(self.handle(), "pending", recv_stream::pending).unwrap_or(0)
    }

    /// Whether any bytes can be read without blocking
    fn has_pending(&self) -> bool {
        self.pending() > 0
    }

    /// Finish the sending part of the stream
    fn conclude(&self) -> Result<(), Error> {
        with_ctx(self.handle(), "conclude", send_stream::conclude)
    }

    /// Process `datagram` as if it had been received from `peer` at `local`
    fn inject_datagram(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(), Error> {
        with_ctx(self.handle(), "inject_datagram", |ctx| {
            connection::inject_datagram(&mut ctx.conn, datagram, peer, local)
        })
    }

    /// Make the assist thread, if running, re-evaluate its deadline immediately
    fn force_assist_thread_wake(&self) {
        let _ = inspect_ctx(self.handle(), "force_assist_thread_wake", |ctx| {
            connection::force_assist_thread_wake(&ctx.conn);
            Ok(())
        });
    }
}
