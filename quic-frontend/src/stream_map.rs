use std::{
    cmp, fmt,
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Build the identifier of the `index`th stream opened by `initiator` in direction `dir`
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(f, "{} {}directional stream {}", initiator, dir, self.index())
    }
}

/// Failures of the per-stream buffers and flow controller
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// Data was appended to a send buffer that was already finished
    #[error("stream already finished")]
    Finished,
    /// Received data does not start where previously received data ended
    #[error("stream data is not contiguous")]
    Gap,
    /// Received data extends past or contradicts the stream's final size
    #[error("final size error")]
    FinalSize,
    /// The peer sent more than it was credited
    #[error("flow control limit exceeded")]
    FlowControl,
    /// More bytes were retired than have been received
    #[error("retired bytes exceed received bytes")]
    RetireOverflow,
    /// Data arrived for a stream without a receiving part
    #[error("stream is not readable")]
    NotReadable,
    /// Received data ends beyond the largest representable stream offset
    #[error("stream offset out of range")]
    OffsetOverflow,
}

/// Contiguous piece of stream data ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    /// Stream offset of the first byte
    pub offset: u64,
    /// Payload, possibly empty for a bare FIN
    pub data: Bytes,
    /// Whether this chunk ends the stream
    pub fin: bool,
}

/// Bounded buffer of outgoing stream data
///
/// Bytes leave the buffer once they are handed to the channel for transmission; recovering
/// lost transmissions is the channel's concern.
#[derive(Debug)]
pub struct SendBuffer {
    /// Data appended by the application but not yet transmitted
    unsent: BytesMut,
    /// Offset one past the last appended byte
    offset: u64,
    capacity: usize,
    fin: bool,
    fin_sent: bool,
}

impl SendBuffer {
    /// Construct an empty buffer holding at most `capacity` untransmitted bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            unsent: BytesMut::with_capacity(capacity),
            offset: 0,
            capacity,
            fin: false,
            fin_sent: false,
        }
    }

    /// Append as much of `data` as there is room for, returning how much was taken
    pub fn append(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        if self.fin {
            return Err(StreamError::Finished);
        }
        let n = cmp::min(data.len(), self.space());
        self.unsent.extend_from_slice(&data[..n]);
        self.offset += n as u64;
        Ok(n)
    }

    /// Mark the end of the stream; nothing can be appended afterwards
    pub fn fin(&mut self) {
        self.fin = true;
    }

    /// Whether [`fin`](Self::fin) has been called
    pub fn is_finished(&self) -> bool {
        self.fin
    }

    /// The total length of the stream, once finished
    pub fn final_size(&self) -> Option<u64> {
        self.fin.then_some(self.offset)
    }

    /// Room left for appending
    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.unsent.len())
    }

    /// Bytes waiting for transmission
    pub fn buffered(&self) -> usize {
        self.unsent.len()
    }

    /// Whether there is data or a FIN left to transmit
    pub fn has_pending(&self) -> bool {
        !self.unsent.is_empty() || (self.fin && !self.fin_sent)
    }

    /// Whether everything, including the FIN, has been transmitted
    pub fn is_complete(&self) -> bool {
        self.fin_sent
    }

    /// Take up to `max_len` bytes of data for transmission
    pub fn poll_transmit(&mut self, max_len: usize) -> Option<StreamChunk> {
        if !self.has_pending() {
            return None;
        }
        let len = cmp::min(max_len, self.unsent.len());
        let offset = self.offset - self.unsent.len() as u64;
        let data = self.unsent.split_to(len).freeze();
        let fin = self.fin && self.unsent.is_empty();
        if fin {
            self.fin_sent = true;
        }
        Some(StreamChunk { offset, data, fin })
    }
}

/// Reassembled incoming stream data awaiting the application
#[derive(Debug, Default)]
pub struct RecvBuffer {
    data: BytesMut,
    /// Offset of the first unread byte
    read: u64,
    final_size: Option<u64>,
}

impl RecvBuffer {
    /// Construct an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset one past the last received byte
    pub fn received(&self) -> u64 {
        self.read + self.data.len() as u64
    }

    /// Accept stream data received at `offset`
    ///
    /// Retransmitted bytes that were already received are ignored; data must otherwise arrive
    /// in order.
    pub fn push(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<(), StreamError> {
        let end = frame_end(offset, data)?;
        if let Some(size) = self.final_size {
            if end > size || (fin && end != size) {
                return Err(StreamError::FinalSize);
            }
        }
        let received = self.received();
        if offset > received {
            return Err(StreamError::Gap);
        }
        if end > received {
            let skip = (received - offset) as usize;
            self.data.extend_from_slice(&data[skip..]);
        }
        if fin {
            if end < self.received() {
                return Err(StreamError::FinalSize);
            }
            self.final_size = Some(end);
        }
        Ok(())
    }

    /// Copy out and consume buffered data, reporting whether the end of the stream was reached
    pub fn read(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let n = self.copy_out(buf);
        self.data.advance(n);
        self.read += n as u64;
        (n, self.at_end())
    }

    /// Like [`read`](Self::read) without consuming anything
    pub fn peek(&self, buf: &mut [u8]) -> (usize, bool) {
        let n = self.copy_out(buf);
        (n, self.final_size == Some(self.read + n as u64))
    }

    /// Bytes ready to be read, and whether they run up to the end of the stream
    pub fn available(&self) -> (usize, bool) {
        (self.data.len(), self.final_size.is_some())
    }

    fn copy_out(&self, buf: &mut [u8]) -> usize {
        let n = cmp::min(buf.len(), self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        n
    }

    fn at_end(&self) -> bool {
        self.final_size == Some(self.read)
    }
}

/// Offset one past the last byte of `data` received at `offset`
fn frame_end(offset: u64, data: &[u8]) -> Result<u64, StreamError> {
    offset
        .checked_add(data.len() as u64)
        .ok_or(StreamError::OffsetOverflow)
}

/// Receive-side flow controller of one stream
///
/// Tracks the credit granted to the peer (`cwm`), the highest offset received (`hwm`) and how
/// much the application has retired (`rwm`). Credit is extended once half of the window has
/// been retired, and the window doubles when that happens faster than four round trips.
#[derive(Debug, Clone)]
pub struct RxFc {
    cwm: u64,
    rwm: u64,
    hwm: u64,
    window: u64,
    max_window: u64,
    epoch_start: Option<Instant>,
    update: Option<u64>,
}

impl RxFc {
    /// Start with `initial_window` bytes of credit, growing up to `max_window`
    pub fn new(initial_window: u64, max_window: u64) -> Self {
        Self {
            cwm: initial_window,
            rwm: 0,
            hwm: 0,
            window: initial_window,
            max_window: cmp::max(initial_window, max_window),
            epoch_start: None,
            update: None,
        }
    }

    /// Account for received data ending at `end`
    pub fn on_rx(&mut self, end: u64) -> Result<(), StreamError> {
        if end > self.cwm {
            return Err(StreamError::FlowControl);
        }
        self.hwm = cmp::max(self.hwm, end);
        Ok(())
    }

    /// Account for `n` bytes consumed by the application
    pub fn on_retire(
        &mut self,
        n: u64,
        smoothed_rtt: Duration,
        now: Instant,
    ) -> Result<(), StreamError> {
        if self.rwm + n > self.hwm {
            return Err(StreamError::RetireOverflow);
        }
        self.rwm += n;
        let epoch_start = *self.epoch_start.get_or_insert(now);

        if self.cwm - self.rwm > self.window / 2 {
            return Ok(());
        }

        if now.saturating_duration_since(epoch_start) < smoothed_rtt * 4
            && self.window < self.max_window
        {
            self.window = cmp::min(self.window * 2, self.max_window);
            trace!(window = self.window, "receive window grown");
        }
        self.cwm = self.rwm + self.window;
        self.update = Some(self.cwm);
        self.epoch_start = Some(now);
        Ok(())
    }

    /// A new credit limit to advertise, if one is due
    pub fn take_credit_update(&mut self) -> Option<u64> {
        self.update.take()
    }

    /// Whether a credit update is waiting to be sent
    pub fn wants_credit_update(&self) -> bool {
        self.update.is_some()
    }

    /// Credit granted to the peer
    pub fn cwm(&self) -> u64 {
        self.cwm
    }

    /// Bytes retired by the application
    pub fn rwm(&self) -> u64 {
        self.rwm
    }

    /// Highest offset received
    pub fn hwm(&self) -> u64 {
        self.hwm
    }

    /// Current window size
    pub fn window(&self) -> u64 {
        self.window
    }
}

/// Per-stream protocol state, owned by the [`StreamMap`]
///
/// A record outlives the application's stream handle: freeing the handle only marks the record
/// deleted, and the map reclaims it once nothing remains to be transmitted.
#[derive(Debug)]
pub struct StreamRecord {
    id: StreamId,
    pub(crate) sstream: Option<SendBuffer>,
    pub(crate) rstream: Option<RecvBuffer>,
    pub(crate) rxfc: RxFc,
    pub(crate) recv_fin_retired: bool,
    pub(crate) deleted: bool,
    active: bool,
}

impl StreamRecord {
    fn new(id: StreamId, send: bool, recv: bool, config: &StreamConfig) -> Self {
        Self {
            id,
            sstream: send.then(|| SendBuffer::new(config.send_buffer_capacity)),
            rstream: recv.then(RecvBuffer::new),
            rxfc: RxFc::new(config.initial_receive_window, config.max_receive_window),
            recv_fin_retired: false,
            deleted: false,
            active: false,
        }
    }

    /// Identifier of the stream
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Outgoing data, absent for receive-only streams and once fully transmitted
    pub fn send_buffer(&self) -> Option<&SendBuffer> {
        self.sstream.as_ref()
    }

    /// Mutable access to the outgoing data
    pub fn send_buffer_mut(&mut self) -> Option<&mut SendBuffer> {
        self.sstream.as_mut()
    }

    /// Incoming data, absent for send-only streams
    pub fn recv_buffer(&self) -> Option<&RecvBuffer> {
        self.rstream.as_ref()
    }

    /// Record data received from the peer, enforcing flow control
    pub fn on_stream_frame(
        &mut self,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<(), StreamError> {
        let rstream = self.rstream.as_mut().ok_or(StreamError::NotReadable)?;
        self.rxfc.on_rx(frame_end(offset, data)?)?;
        rstream.push(offset, data, fin)
    }

    /// Receive flow controller
    pub fn rxfc(&self) -> &RxFc {
        &self.rxfc
    }

    /// Mutable access to the receive flow controller
    pub fn rxfc_mut(&mut self) -> &mut RxFc {
        &mut self.rxfc
    }

    /// Whether the application has consumed the end of the incoming stream
    pub fn recv_fin_retired(&self) -> bool {
        self.recv_fin_retired
    }

    /// Whether the application's handle to this stream has been freed
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the stream has something to transmit
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Parameters applied to each new stream
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum untransmitted bytes buffered per stream
    pub send_buffer_capacity: usize,
    /// Receive credit initially granted per stream
    pub initial_receive_window: u64,
    /// Upper bound for receive window autotuning
    pub max_receive_window: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            send_buffer_capacity: 128 * 1024,
            initial_receive_window: 64 * 1024,
            max_receive_window: 1024 * 1024,
        }
    }
}

/// Registry of all streams of one connection
#[derive(Debug)]
pub struct StreamMap {
    side: Side,
    config: StreamConfig,
    streams: FxHashMap<StreamId, StreamRecord>,
    next_local: [u64; 2],
}

impl StreamMap {
    /// Create an empty map for the endpoint acting as `side`
    pub fn new(side: Side, config: StreamConfig) -> Self {
        Self {
            side,
            config,
            streams: FxHashMap::default(),
            next_local: [0, 0],
        }
    }

    /// Open the next locally-initiated stream in direction `dir`
    pub fn new_local(&mut self, dir: Dir) -> StreamId {
        let id = StreamId::new(self.side, dir, self.next_local[dir as usize]);
        self.next_local[dir as usize] += 1;
        let record = StreamRecord::new(id, true, dir == Dir::Bi, &self.config);
        self.streams.insert(id, record);
        trace!(%id, "opened");
        id
    }

    /// Register a stream opened by the peer, or return the existing record
    pub fn get_or_insert_remote(&mut self, id: StreamId) -> &mut StreamRecord {
        let config = &self.config;
        self.streams.entry(id).or_insert_with(|| {
            trace!(%id, "peer opened");
            StreamRecord::new(id, id.dir() == Dir::Bi, true, config)
        })
    }

    /// Look up a stream
    pub fn get(&self, id: StreamId) -> Option<&StreamRecord> {
        self.streams.get(&id)
    }

    /// Look up a stream for modification
    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamRecord> {
        self.streams.get_mut(&id)
    }

    /// Number of records, including deleted ones awaiting reclamation
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the map holds no records
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Reconsider whether a stream has anything to transmit
    ///
    /// Must be called after anything that may change the stream's scheduling status, such as
    /// appending data, finishing, or retiring received data.
    pub fn update_state(&mut self, id: StreamId) {
        let Some(record) = self.streams.get_mut(&id) else {
            return;
        };
        if record.sstream.as_ref().map_or(false, SendBuffer::is_complete) {
            record.sstream = None;
        }
        let active = record.sstream.as_ref().map_or(false, SendBuffer::has_pending)
            || record.rxfc.wants_credit_update();
        if active != record.active {
            trace!(%id, active, "stream state changed");
        }
        record.active = active;
    }

    /// Streams with something to transmit, in identifier order
    pub fn active_streams(&self) -> Vec<StreamId> {
        let mut ids = self
            .streams
            .values()
            .filter(|s| s.active)
            .map(|s| s.id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Reclaim deleted records with nothing left to transmit, returning how many were dropped
    pub fn gc(&mut self) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, s| {
            !(s.deleted && !s.sstream.as_ref().map_or(false, SendBuffer::has_pending))
        });
        before - self.streams.len()
    }
}
