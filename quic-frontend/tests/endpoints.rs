use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use quic_frontend::{MemoryEndpoint, NetEndpoint, PollDescriptor, UdpEndpoint};

#[test]
fn memory_pair() {
    let (a, b) = MemoryEndpoint::pair();
    assert_eq!(a.peer_addr().unwrap(), b.local_addr().unwrap());
    assert_eq!(b.peer_addr().unwrap(), a.local_addr().unwrap());
    assert_eq!(a.poll_descriptor(), PollDescriptor::None);
    assert!(!a.poll_descriptor().is_pollable());

    let mut buf = [0; 16];
    assert_eq!(
        b.recv(&mut buf).unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );

    assert_eq!(a.send(b"first", None).unwrap(), 5);
    assert_eq!(a.send(b"second", None).unwrap(), 6);
    assert_eq!(b.queued(), 2);
    assert_eq!(a.queued(), 0);

    let (n, from) = b.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"first");
    assert_eq!(from, a.local_addr().unwrap());

    // Datagrams are truncated to the receive buffer
    let mut small = [0; 3];
    assert_eq!(b.recv(&mut small).unwrap().0, 3);
    assert_eq!(&small, b"sec");
    assert_eq!(b.queued(), 0);
}

fn recv_retrying(endpoint: &UdpEndpoint, buf: &mut [u8]) -> (usize, SocketAddr) {
    for _ in 0..1000 {
        match endpoint.recv(buf) {
            Ok(r) => return r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1))
            }
            Err(e) => panic!("recv failed: {e}"),
        }
    }
    panic!("timed out waiting for a datagram");
}

#[test]
fn udp_loopback() {
    let loopback = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let a = UdpEndpoint::bind(loopback).unwrap();
    let b = UdpEndpoint::bind(loopback).unwrap();
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();
    assert!(a.poll_descriptor().is_pollable());

    let mut buf = [0; 64];
    assert_eq!(
        b.recv(&mut buf).unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );
    assert!(a.peer_addr().is_err());

    a.send(b"addressed", Some(b_addr)).unwrap();
    let (n, from) = recv_retrying(&b, &mut buf);
    assert_eq!(&buf[..n], b"addressed");
    assert_eq!(from, a_addr);

    a.connect(b_addr).unwrap();
    assert_eq!(a.peer_addr().unwrap(), b_addr);
    a.send(b"connected", None).unwrap();
    let (n, _) = recv_retrying(&b, &mut buf);
    assert_eq!(&buf[..n], b"connected");
}

#[test]
fn udp_from_socket() {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = socket.local_addr().unwrap();
    let endpoint = UdpEndpoint::from_socket(socket).unwrap();
    assert_eq!(endpoint.local_addr().unwrap(), addr);

    let mut buf = [0; 8];
    assert_eq!(
        endpoint.recv(&mut buf).unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );
}
