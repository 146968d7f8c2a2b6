use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    Channel, ChannelArgs, ChannelError, Context, Dir, ExportKeyingMaterialError, HandshakeLayer,
    NetEndpoint, Reactor, RttInfo, StreamChunk, StreamConfig, StreamId, StreamMap,
};

/// Stream data the mock channel delivers once the reactor has ticked `at_tick` times
#[derive(Debug)]
pub(super) struct Incoming {
    pub(super) at_tick: usize,
    pub(super) stream: StreamId,
    pub(super) offset: u64,
    pub(super) data: Vec<u8>,
    pub(super) fin: bool,
}

/// Script for, and observations of, a [`MockChannel`]
///
/// Shared between the test and the channel. Never hold the lock across a call into the
/// connection, since ticking locks it too.
#[derive(Debug, Default)]
pub(super) struct Probe {
    /// Complete the handshake once this many ticks have happened since start
    pub(super) handshake_after: Option<usize>,
    pub(super) handshake_complete: bool,
    pub(super) starts: usize,
    pub(super) fail_start: bool,
    pub(super) reject_endpoints: bool,
    pub(super) endpoint_changes: usize,
    pub(super) peer_addr: Option<SocketAddr>,
    pub(super) ticks: usize,
    pub(super) ticks_since_start: usize,
    /// Report a deadline this far after every query
    pub(super) tick_interval: Option<Duration>,
    /// Move buffered stream data out on every tick
    pub(super) transmit: bool,
    /// Feed transmitted data back into the stream's own receive side
    pub(super) echo: bool,
    pub(super) transmitted: Vec<(StreamId, StreamChunk)>,
    pub(super) credit_updates: Vec<(StreamId, u64)>,
    pub(super) incoming: VecDeque<Incoming>,
    /// Terminate once this many ticks have happened since start
    pub(super) die_after: Option<usize>,
    /// Stay in the closing state after a local close instead of terminating on the next tick
    pub(super) linger_close: bool,
    pub(super) closing: bool,
    pub(super) terminated: bool,
    pub(super) close_code: Option<u64>,
    pub(super) fail_stream_creation: bool,
    pub(super) injected: Vec<(Vec<u8>, SocketAddr)>,
    /// Ask to be ticked when the read endpoint becomes readable
    pub(super) want_read: bool,
    /// Deliver every datagram received on the read endpoint as data on this stream
    pub(super) datagram_stream: Option<StreamId>,
}

impl Probe {
    pub(super) fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    /// All data transmitted on `stream`, in order
    pub(super) fn sent_on(&self, stream: StreamId) -> Vec<u8> {
        self.transmitted
            .iter()
            .filter(|(id, _)| *id == stream)
            .flat_map(|(_, chunk)| chunk.data.iter().copied())
            .collect()
    }
}

/// Scriptable stand-in for the protocol state machine
pub(super) struct MockChannel {
    probe: Arc<Mutex<Probe>>,
    streams: StreamMap,
    rbio: Option<Arc<dyn NetEndpoint>>,
}

impl MockChannel {
    fn new(args: ChannelArgs, probe: Arc<Mutex<Probe>>, config: StreamConfig) -> Self {
        Self {
            probe,
            streams: StreamMap::new(args.side, config),
            rbio: None,
        }
    }
}

impl Reactor for MockChannel {
    fn tick(&mut self) -> Result<(), ChannelError> {
        let mut probe = self.probe.lock().unwrap();
        probe.ticks += 1;
        if probe.starts > 0 {
            probe.ticks_since_start += 1;
            if probe
                .handshake_after
                .map_or(false, |n| probe.ticks_since_start >= n)
            {
                probe.handshake_complete = true;
            }
            if probe
                .die_after
                .map_or(false, |n| probe.ticks_since_start >= n)
            {
                probe.terminated = true;
            }
        }
        if probe.closing && !probe.linger_close {
            probe.terminated = true;
        }

        while probe
            .incoming
            .front()
            .map_or(false, |i| i.at_tick <= probe.ticks)
        {
            let i = probe.incoming.pop_front().unwrap();
            self.streams
                .get_or_insert_remote(i.stream)
                .on_stream_frame(i.offset, &i.data, i.fin)?;
            self.streams.update_state(i.stream);
        }

        if let (Some(rbio), Some(stream)) = (&self.rbio, probe.datagram_stream) {
            let mut buf = [0; 1500];
            loop {
                let n = match rbio.recv(&mut buf) {
                    Ok((n, _)) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                };
                let record = self.streams.get_or_insert_remote(stream);
                let offset = record.recv_buffer().map_or(0, |r| r.received());
                record.on_stream_frame(offset, &buf[..n], false)?;
                self.streams.update_state(stream);
            }
        }

        if probe.transmit {
            for id in self.streams.active_streams() {
                let Some(record) = self.streams.get_mut(id) else {
                    continue;
                };
                if let Some(limit) = record.rxfc_mut().take_credit_update() {
                    probe.credit_updates.push((id, limit));
                }
                while let Some(chunk) = record
                    .send_buffer_mut()
                    .and_then(|s| s.poll_transmit(usize::MAX))
                {
                    if probe.echo {
                        record.on_stream_frame(chunk.offset, &chunk.data, chunk.fin)?;
                    }
                    probe.transmitted.push((id, chunk));
                }
                self.streams.update_state(id);
            }
            self.streams.gc();
        }
        Ok(())
    }

    fn tick_deadline(&self) -> Option<Instant> {
        let interval = self.probe.lock().unwrap().tick_interval?;
        Some(Instant::now() + interval)
    }

    fn net_read_desired(&self) -> bool {
        self.probe.lock().unwrap().want_read
    }

    fn net_write_desired(&self) -> bool {
        false
    }
}

impl Channel for MockChannel {
    fn start(&mut self) -> Result<(), ChannelError> {
        let mut probe = self.probe.lock().unwrap();
        if probe.fail_start {
            return Err(ChannelError::Other("scripted start failure".into()));
        }
        probe.starts += 1;
        Ok(())
    }

    fn set_net_rbio(&mut self, endpoint: Option<Arc<dyn NetEndpoint>>) -> Result<(), ChannelError> {
        self.set_endpoint(endpoint.is_some())?;
        self.rbio = endpoint;
        Ok(())
    }

    fn set_net_wbio(&mut self, endpoint: Option<Arc<dyn NetEndpoint>>) -> Result<(), ChannelError> {
        self.set_endpoint(endpoint.is_some())
    }

    fn set_peer_addr(&mut self, addr: Option<SocketAddr>) -> Result<(), ChannelError> {
        self.probe.lock().unwrap().peer_addr = addr;
        Ok(())
    }

    fn is_handshake_complete(&self) -> bool {
        self.probe.lock().unwrap().handshake_complete
    }

    fn is_active(&self) -> bool {
        let probe = self.probe.lock().unwrap();
        probe.starts > 0 && !probe.closing && !probe.terminated
    }

    fn is_terminated(&self) -> bool {
        self.probe.lock().unwrap().terminated
    }

    fn is_term_any(&self) -> bool {
        let probe = self.probe.lock().unwrap();
        probe.closing || probe.terminated
    }

    fn local_close(&mut self, app_error_code: u64) {
        let mut probe = self.probe.lock().unwrap();
        probe.close_code = Some(app_error_code);
        probe.closing = true;
    }

    fn reactor(&mut self) -> &mut dyn Reactor {
        self
    }

    fn stream_map(&mut self) -> &mut StreamMap {
        &mut self.streams
    }

    fn rtt_info(&self) -> RttInfo {
        RttInfo {
            smoothed_rtt: Duration::from_millis(10),
        }
    }

    fn new_stream_local(&mut self, dir: Dir) -> Result<StreamId, ChannelError> {
        if self.probe.lock().unwrap().fail_stream_creation {
            return Err(ChannelError::StreamLimit);
        }
        Ok(self.streams.new_local(dir))
    }

    fn inject_datagram(
        &mut self,
        datagram: &[u8],
        peer: SocketAddr,
        _local: Option<SocketAddr>,
    ) -> Result<(), ChannelError> {
        self.probe
            .lock()
            .unwrap()
            .injected
            .push((datagram.to_vec(), peer));
        Ok(())
    }
}

impl MockChannel {
    fn set_endpoint(&mut self, present: bool) -> Result<(), ChannelError> {
        let mut probe = self.probe.lock().unwrap();
        if probe.reject_endpoints && present {
            return Err(ChannelError::EndpointRejected);
        }
        probe.endpoint_changes += 1;
        Ok(())
    }
}

/// Handshake layer that completes along with the mock channel
#[derive(Debug)]
pub(super) struct MockTls {
    probe: Arc<Mutex<Probe>>,
}

impl HandshakeLayer for MockTls {
    fn is_handshake_complete(&self) -> bool {
        self.probe.lock().unwrap().handshake_complete
    }

    fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> Result<(), ExportKeyingMaterialError> {
        if output.is_empty() {
            return Err(ExportKeyingMaterialError::InvalidLength);
        }
        let seed = label.iter().chain(context).fold(0u8, |a, b| a.wrapping_add(*b));
        for (i, byte) in output.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        Ok(())
    }
}

/// A context whose connections are backed by mock channels scripted through `probe`
pub(super) fn context(probe: &Arc<Mutex<Probe>>, config: StreamConfig) -> Context {
    let channel_probe = probe.clone();
    let tls_probe = probe.clone();
    Context::new(
        Arc::new(
            move |args: ChannelArgs| -> Result<Box<dyn Channel>, ChannelError> {
                Ok(Box::new(MockChannel::new(
                    args,
                    channel_probe.clone(),
                    config.clone(),
                )))
            },
        ),
        Arc::new(move || -> Result<Arc<dyn HandshakeLayer>, ChannelError> {
            Ok(Arc::new(MockTls {
                probe: tls_probe.clone(),
            }))
        }),
    )
}
