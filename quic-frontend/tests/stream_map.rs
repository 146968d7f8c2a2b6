use std::time::{Duration, Instant};

use quic_frontend::{
    Dir, RecvBuffer, RxFc, SendBuffer, Side, StreamConfig, StreamError, StreamId, StreamMap,
};

#[test]
fn stream_id_fields() {
    let id = StreamId::new(Side::Server, Dir::Uni, 5);
    assert_eq!(id, StreamId(23));
    assert_eq!(id.initiator(), Side::Server);
    assert_eq!(id.dir(), Dir::Uni);
    assert_eq!(id.index(), 5);
    assert_eq!(id.to_string(), "server unidirectional stream 5");

    let id = StreamId(0);
    assert_eq!(id.initiator(), Side::Client);
    assert_eq!(id.dir(), Dir::Bi);
    assert_eq!(id.to_string(), "client bidirectional stream 0");
}

#[test]
fn send_buffer_is_bounded() {
    let mut buf = SendBuffer::new(8);
    assert_eq!(buf.space(), 8);
    assert_eq!(buf.append(b"hello"), Ok(5));
    assert_eq!(buf.append(b"world"), Ok(3));
    assert_eq!(buf.space(), 0);
    assert_eq!(buf.append(b"!"), Ok(0));
    assert_eq!(buf.buffered(), 8);

    let chunk = buf.poll_transmit(6).unwrap();
    assert_eq!(chunk.offset, 0);
    assert_eq!(&chunk.data[..], b"hellow");
    assert!(!chunk.fin);
    assert_eq!(buf.space(), 6);

    let chunk = buf.poll_transmit(usize::MAX).unwrap();
    assert_eq!(chunk.offset, 6);
    assert_eq!(&chunk.data[..], b"or");
    assert!(buf.poll_transmit(usize::MAX).is_none());
}

#[test]
fn send_buffer_fin() {
    let mut buf = SendBuffer::new(16);
    buf.append(b"abc").unwrap();
    assert_eq!(buf.final_size(), None);
    buf.fin();
    assert!(buf.is_finished());
    assert_eq!(buf.final_size(), Some(3));
    assert_eq!(buf.append(b"d"), Err(StreamError::Finished));

    let chunk = buf.poll_transmit(usize::MAX).unwrap();
    assert!(chunk.fin);
    assert_eq!(&chunk.data[..], b"abc");
    assert!(buf.is_complete());
    assert!(!buf.has_pending());
}

#[test]
fn bare_fin_is_transmitted() {
    let mut buf = SendBuffer::new(16);
    buf.append(b"xy").unwrap();
    buf.poll_transmit(usize::MAX).unwrap();
    assert!(!buf.has_pending());

    buf.fin();
    assert!(buf.has_pending());
    let chunk = buf.poll_transmit(usize::MAX).unwrap();
    assert_eq!(chunk.offset, 2);
    assert!(chunk.data.is_empty());
    assert!(chunk.fin);
}

#[test]
fn recv_buffer_reassembly() {
    let mut buf = RecvBuffer::new();
    buf.push(0, b"hello", false).unwrap();
    assert_eq!(buf.push(7, b"!", false), Err(StreamError::Gap));
    // Retransmission overlapping what has been received
    buf.push(3, b"lo wor", false).unwrap();
    buf.push(0, b"he", false).unwrap();
    assert_eq!(buf.received(), 9);
    assert_eq!(buf.available(), (9, false));

    buf.push(9, b"ld", true).unwrap();
    assert_eq!(buf.available(), (11, true));
    assert_eq!(buf.push(11, b"?", false), Err(StreamError::FinalSize));
    assert_eq!(buf.push(0, b"hel", true), Err(StreamError::FinalSize));

    let mut out = [0; 5];
    assert_eq!(buf.peek(&mut out), (5, false));
    assert_eq!(buf.read(&mut out), (5, false));
    assert_eq!(&out, b"hello");

    let mut out = [0; 16];
    assert_eq!(buf.peek(&mut out), (6, true));
    assert_eq!(buf.read(&mut out), (6, true));
    assert_eq!(&out[..6], b" world");
    assert_eq!(buf.read(&mut out), (0, true));
}

#[test]
fn offsets_past_the_end_of_the_stream_space() {
    let mut buf = RecvBuffer::new();
    assert_eq!(
        buf.push(u64::MAX, b"x", false),
        Err(StreamError::OffsetOverflow)
    );
    assert_eq!(buf.received(), 0);

    let mut map = StreamMap::new(Side::Client, small_config());
    let id = StreamId::new(Side::Server, Dir::Bi, 0);
    let record = map.get_or_insert_remote(id);
    assert_eq!(
        record.on_stream_frame(u64::MAX - 1, b"xy", true),
        Err(StreamError::OffsetOverflow)
    );
    assert_eq!(record.rxfc().hwm(), 0);
}

#[test]
fn flow_control_limit() {
    let mut fc = RxFc::new(100, 1000);
    fc.on_rx(60).unwrap();
    fc.on_rx(40).unwrap();
    assert_eq!(fc.hwm(), 60);
    assert_eq!(fc.on_rx(101), Err(StreamError::FlowControl));
}

#[test]
fn flow_control_credit() {
    let mut fc = RxFc::new(100, 1000);
    let start = Instant::now();
    let rtt = Duration::from_millis(10);
    fc.on_rx(100).unwrap();

    fc.on_retire(40, rtt, start).unwrap();
    assert_eq!(fc.take_credit_update(), None);
    assert_eq!(fc.cwm(), 100);

    // Half the window retired slowly: credit is extended without growing the window
    fc.on_retire(20, rtt, start + Duration::from_secs(1)).unwrap();
    assert!(fc.wants_credit_update());
    assert_eq!(fc.take_credit_update(), Some(160));
    assert_eq!(fc.take_credit_update(), None);
    assert_eq!(fc.window(), 100);
    assert_eq!(fc.rwm(), 60);

    assert_eq!(
        fc.on_retire(41, rtt, start + Duration::from_secs(1)),
        Err(StreamError::RetireOverflow)
    );
}

#[test]
fn flow_control_window_grows() {
    let mut fc = RxFc::new(100, 150);
    let now = Instant::now();
    let rtt = Duration::from_millis(10);
    fc.on_rx(100).unwrap();

    fc.on_retire(60, rtt, now).unwrap();
    assert_eq!(fc.window(), 150);
    assert_eq!(fc.take_credit_update(), Some(210));

    // Capped at the maximum
    fc.on_rx(210).unwrap();
    fc.on_retire(150, rtt, now).unwrap();
    assert_eq!(fc.window(), 150);
    assert_eq!(fc.take_credit_update(), Some(360));
}

fn small_config() -> StreamConfig {
    StreamConfig {
        send_buffer_capacity: 16,
        initial_receive_window: 32,
        max_receive_window: 64,
    }
}

#[test]
fn local_streams() {
    let mut map = StreamMap::new(Side::Server, small_config());
    assert!(map.is_empty());
    let a = map.new_local(Dir::Bi);
    let b = map.new_local(Dir::Bi);
    let c = map.new_local(Dir::Uni);
    assert_eq!(a, StreamId::new(Side::Server, Dir::Bi, 0));
    assert_eq!(b, StreamId::new(Side::Server, Dir::Bi, 1));
    assert_eq!(c, StreamId::new(Side::Server, Dir::Uni, 0));
    assert_eq!(map.len(), 3);

    let record = map.get(a).unwrap();
    assert_eq!(record.id(), a);
    assert!(record.send_buffer().is_some());
    assert!(record.recv_buffer().is_some());

    let record = map.get(c).unwrap();
    assert!(record.send_buffer().is_some());
    assert!(record.recv_buffer().is_none());
}

#[test]
fn remote_streams() {
    let mut map = StreamMap::new(Side::Client, small_config());
    let uni = StreamId::new(Side::Server, Dir::Uni, 0);
    let record = map.get_or_insert_remote(uni);
    assert!(record.send_buffer().is_none());
    record.on_stream_frame(0, b"data", false).unwrap();
    assert_eq!(
        record.on_stream_frame(4, &[0; 64], false),
        Err(StreamError::FlowControl)
    );

    // Looking it up again returns the same record
    assert_eq!(map.get_or_insert_remote(uni).rxfc().hwm(), 4);
    assert_eq!(map.len(), 1);

    let local = map.new_local(Dir::Uni);
    assert_eq!(
        map.get_mut(local).unwrap().on_stream_frame(0, b"x", false),
        Err(StreamError::NotReadable)
    );
}

#[test]
fn scheduling() {
    let mut map = StreamMap::new(Side::Client, small_config());
    let a = map.new_local(Dir::Bi);
    let b = map.new_local(Dir::Uni);
    assert!(map.active_streams().is_empty());

    map.get_mut(b).unwrap().send_buffer_mut().unwrap().append(b"x").unwrap();
    map.get_mut(a).unwrap().send_buffer_mut().unwrap().append(b"y").unwrap();
    map.update_state(a);
    map.update_state(b);
    assert_eq!(map.active_streams(), vec![a, b]);

    let record = map.get_mut(a).unwrap();
    let sstream = record.send_buffer_mut().unwrap();
    sstream.fin();
    sstream.poll_transmit(usize::MAX).unwrap();
    map.update_state(a);
    assert_eq!(map.active_streams(), vec![b]);
    // Fully transmitted send parts are released
    assert!(map.get(a).unwrap().send_buffer().is_none());

    // Live records are never reclaimed
    assert_eq!(map.gc(), 0);
    assert_eq!(map.len(), 2);
}
