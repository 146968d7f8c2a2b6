use std::{
    collections::VecDeque,
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tracing::trace;

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd as RawDescriptor};
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, RawSocket as RawDescriptor};

/// A datagram-oriented network I/O endpoint a connection reads from or writes to
///
/// Endpoints are non-blocking: [`send`](Self::send) and [`recv`](Self::recv) fail with
/// [`io::ErrorKind::WouldBlock`] rather than waiting.
pub trait NetEndpoint: Send + Sync + fmt::Debug {
    /// Transmit one datagram, to `destination` if given or the endpoint's default peer otherwise
    fn send(&self, datagram: &[u8], destination: Option<SocketAddr>) -> io::Result<usize>;

    /// Receive one datagram, returning its length and source address
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Descriptor that can be waited on for readiness, if any
    fn poll_descriptor(&self) -> PollDescriptor;

    /// The destination currently configured on this endpoint
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// The local address datagrams are sent from
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Something the operating system can wait on for I/O readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDescriptor {
    /// The endpoint cannot be polled, such as an in-memory pipe
    None,
    /// A socket descriptor
    #[cfg(any(unix, windows))]
    Socket(RawDescriptor),
}

impl PollDescriptor {
    /// Whether readiness of this descriptor can be waited for
    pub fn is_pollable(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Identity of a shared endpoint, for detecting that the same endpoint is set again
pub(crate) fn same_endpoint(a: &Arc<dyn NetEndpoint>, b: &Arc<dyn NetEndpoint>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// A non-blocking UDP socket
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Bind a new non-blocking UDP socket to `addr`
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            if addr.is_ipv4() {
                socket2::Domain::IPV4
            } else {
                socket2::Domain::IPV6
            },
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(addr))?;
        Ok(Self {
            socket: socket.into(),
        })
    }

    /// Wrap an existing socket, switching it to non-blocking mode
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// Set the default destination of the socket
    ///
    /// The destination is picked up as the connection's peer address when this endpoint is
    /// installed as a write endpoint before any peer address has been configured.
    pub fn connect(&self, peer: SocketAddr) -> io::Result<()> {
        self.socket.connect(peer)
    }
}

impl NetEndpoint for UdpEndpoint {
    fn send(&self, datagram: &[u8], destination: Option<SocketAddr>) -> io::Result<usize> {
        match destination {
            Some(dest) => self.socket.send_to(datagram, dest),
            None => self.socket.send(datagram),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn poll_descriptor(&self) -> PollDescriptor {
        #[cfg(unix)]
        {
            PollDescriptor::Socket(self.socket.as_raw_fd())
        }
        #[cfg(windows)]
        {
            PollDescriptor::Socket(self.socket.as_raw_socket())
        }
        #[cfg(not(any(unix, windows)))]
        {
            PollDescriptor::None
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

type Inbox = Arc<Mutex<VecDeque<(Bytes, SocketAddr)>>>;

/// One end of an in-memory datagram pipe
///
/// Memory endpoints have no descriptor, so a connection using them cannot block.
pub struct MemoryEndpoint {
    addr: SocketAddr,
    peer: SocketAddr,
    inbox: Inbox,
    peer_inbox: Inbox,
}

impl MemoryEndpoint {
    /// Create two connected endpoints with distinct loopback addresses
    pub fn pair() -> (Self, Self) {
        let a_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433);
        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4434);
        let a_inbox = Inbox::default();
        let b_inbox = Inbox::default();
        (
            Self {
                addr: a_addr,
                peer: b_addr,
                inbox: a_inbox.clone(),
                peer_inbox: b_inbox.clone(),
            },
            Self {
                addr: b_addr,
                peer: a_addr,
                inbox: b_inbox,
                peer_inbox: a_inbox,
            },
        )
    }

    /// Number of datagrams waiting to be received
    pub fn queued(&self) -> usize {
        self.inbox.lock().unwrap().len()
    }
}

impl NetEndpoint for MemoryEndpoint {
    fn send(&self, datagram: &[u8], _destination: Option<SocketAddr>) -> io::Result<usize> {
        trace!(len = datagram.len(), from = %self.addr, "memory send");
        self.peer_inbox
            .lock()
            .unwrap()
            .push_back((Bytes::copy_from_slice(datagram), self.addr));
        Ok(datagram.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (datagram, from) = self
            .inbox
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        // Datagram semantics: excess bytes are discarded
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok((n, from))
    }

    fn poll_descriptor(&self) -> PollDescriptor {
        PollDescriptor::None
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("addr", &self.addr)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
