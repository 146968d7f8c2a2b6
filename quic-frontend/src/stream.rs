use std::{
    fmt, io,
    sync::{Arc, Weak},
};

use tracing::debug;

use crate::{
    config::Mode,
    connection::ConnState,
    dispatch::{Handle, QuicObject},
    error::Error,
    mutex::Mutex,
    stream_map::StreamId,
};

/// Identifies a stream object within its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct XsoId(pub(crate) u64);

/// How a retried all-or-nothing write is matched against the one that started it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferIdentity {
    /// Address of the caller's buffer
    Address(usize),
    /// Caller-chosen token
    Token(u64),
}

/// Progress of an all-or-nothing write that could not complete immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AonState {
    Inactive,
    /// `0 < pos < len` bytes of a `len` byte write from `buf` have been buffered
    InProgress {
        buf: BufferIdentity,
        len: usize,
        pos: usize,
    },
}

/// Per-handle state of a stream object, kept in its connection
#[derive(Debug, Clone, Copy)]
pub(crate) struct Xso {
    pub(crate) stream: StreamId,
    pub(crate) blocking: bool,
    pub(crate) mode: Mode,
    pub(crate) aon: AonState,
}

/// A stream of a [`QuicConnection`](crate::QuicConnection)
///
/// Dropping the handle concludes the sending part of the stream if it was not already; the
/// stream's protocol state lives on in the connection until everything has been transmitted.
pub struct QuicStream {
    conn: Weak<Mutex<ConnState>>,
    xso: XsoId,
    id: StreamId,
}

impl QuicStream {
    pub(crate) fn new(conn: Weak<Mutex<ConnState>>, xso: XsoId, id: StreamId) -> Self {
        Self { conn, xso, id }
    }

    /// Identifier of the underlying stream
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn xso(&self) -> XsoId {
        self.xso
    }

    pub(crate) fn shared(&self) -> Option<Arc<Mutex<ConnState>>> {
        self.conn.upgrade()
    }
}

impl QuicObject for QuicStream {
    fn handle(&self) -> Handle<'_> {
        Handle::Stream(self)
    }
}

impl Drop for QuicStream {
    fn drop(&mut self) {
        let Some(shared) = self.conn.upgrade() else {
            return;
        };
        let mut state = shared.lock("free_stream");
        if !state.freed {
            free_xso(&mut state, self.xso);
        }
    }
}

impl fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicStream").field("id", &self.id).finish()
    }
}

/// Release a stream object, leaving its record to the stream map
///
/// The record is marked deleted and its sending part concluded. It is reclaimed by the stream
/// map once nothing remains to be transmitted.
pub(crate) fn free_xso(state: &mut ConnState, id: XsoId) {
    let Some(xso) = state.xsos.remove(&id) else {
        return;
    };
    debug_assert!(state.num_xso > 0);
    state.num_xso = state.num_xso.saturating_sub(1);

    let map = state.channel().stream_map();
    if let Some(record) = map.get_mut(xso.stream) {
        record.deleted = true;
        // Provisional: concluded rather than reset
        if let Some(sstream) = record.sstream.as_mut() {
            sstream.fin();
        }
    }
    map.update_state(xso.stream);
    debug!(stream = %xso.stream, "stream object freed");
}

impl io::Read for QuicStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_io(&*self, buf)
    }
}

impl io::Write for QuicStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        QuicObject::write(&*self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read through [`io::Read`], reporting the end of the stream as `Ok(0)`
pub(crate) fn read_io(obj: &impl QuicObject, buf: &mut [u8]) -> io::Result<usize> {
    match QuicObject::read(obj, buf) {
        Ok(n) => Ok(n),
        Err(Error::ZeroReturn) => Ok(0),
        Err(e) => Err(e.into()),
    }
}
