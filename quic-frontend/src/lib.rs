//! Blocking and non-blocking stream front-end for QUIC connections
//!
//! A [`QuicConnection`] wraps a QUIC protocol state machine (a [`Channel`]) and exposes it
//! through a conventional socket-like interface: drive the handshake, read and write byte
//! streams, and shut down. The protocol machinery itself, including packet processing, loss
//! recovery and the event loop, is supplied by the application through the [`ChannelFactory`]
//! and [`HandshakeFactory`] of a [`Context`].
//!
//! # Blocking and non-blocking operation
//!
//! Connections start out blocking: operations wait until they can complete, and the calling
//! thread drives the connection's [`Reactor`] while it waits. Blocking requires both network
//! endpoints to be pollable, so installing an in-memory endpoint switches the connection to
//! non-blocking operation. Non-blocking operations that cannot progress fail with
//! [`Error::WantRead`] or [`Error::WantWrite`], and the application is expected to call
//! [`tick`](QuicObject::tick) when [`tick_timeout`](QuicObject::tick_timeout) expires or the
//! endpoints become ready.
//!
//! With [`Context::thread_assisted`], a background thread additionally ticks each connection
//! when its timers expire.
//!
//! # Streams
//!
//! Each connection is created with a default bidirectional stream, which operations on the
//! connection handle itself read from and write to. Further streams are opened with
//! [`QuicConnection::new_stream`]. Both handle kinds implement [`QuicObject`] along with
//! [`std::io::Read`] and [`std::io::Write`].
//!
//! Non-blocking writes are all-or-nothing by default: a write that cannot be buffered in full
//! fails with [`Error::WantWrite`] and must be retried with the same buffer until it succeeds.
//! [`Mode::ENABLE_PARTIAL_WRITE`] switches to reporting partial progress instead.
//!
//! # Errors
//!
//! Every operation records its outcome as the connection's [`last_error`](QuicObject::last_error).
//! Failures other than the expected non-blocking signals also leave an [`ErrorRecord`] on the
//! thread's [`error_queue`].
#![warn(missing_docs)]
#![warn(clippy::use_self)]

mod assist;
mod channel;
mod config;
mod connection;
mod dispatch;
mod endpoint;
mod error;
mod mutex;
mod reactor;
mod recv_stream;
mod send_stream;
mod stream;
mod stream_map;
mod tls;

pub use crate::channel::{
    Channel, ChannelArgs, ChannelError, ChannelFactory, Reactor, RttInfo,
};
pub use crate::config::{Context, HandshakeFactory, Mode, NowFn, ShutdownArgs, ShutdownFlags};
pub use crate::connection::QuicConnection;
pub use crate::dispatch::{Handle, QuicObject};
pub use crate::endpoint::{MemoryEndpoint, NetEndpoint, PollDescriptor, UdpEndpoint};
pub use crate::error::{error_queue, Error, ErrorCode, ErrorRecord};
pub use crate::stream::QuicStream;
pub use crate::stream_map::{
    Dir, RecvBuffer, RxFc, SendBuffer, Side, StreamChunk, StreamConfig, StreamError, StreamId,
    StreamMap, StreamRecord,
};
pub use crate::tls::{ExportKeyingMaterialError, HandshakeLayer};
