//! The non-blocking descriptor a session runs over.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

/// A non-blocking byte (or datagram) transport.
///
/// Readiness is reported the usual way: `read`/`write` fail with
/// [`io::ErrorKind::WouldBlock`] when the descriptor isn't ready, and the
/// session turns that into a want-read/want-write signal. Any other I/O
/// error is the "last system error" and ends the session.
///
/// Datagram transports must return exactly one datagram per `read` and send
/// each `write` as one datagram.
pub trait Transport: Read + Write {
    /// Identifier used to correlate log records, usually the descriptor.
    fn id(&self) -> u64;

    /// Address of the remote end, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl Transport for TcpStream {
    fn id(&self) -> u64 {
        descriptor(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// A UDP socket connected to a single peer.
#[derive(Debug)]
pub struct ConnectedUdp {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl ConnectedUdp {
    /// Connect `socket` to `peer` and switch it to non-blocking mode.
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> io::Result<Self> {
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        Ok(ConnectedUdp { socket, peer })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl Read for ConnectedUdp {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }
}

impl Write for ConnectedUdp {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ConnectedUdp {
    fn id(&self) -> u64 {
        descriptor(&self.socket)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

#[cfg(unix)]
fn descriptor<T: std::os::fd::AsRawFd>(t: &T) -> u64 {
    t.as_raw_fd() as u64
}

#[cfg(windows)]
fn descriptor<T: std::os::windows::io::AsRawSocket>(t: &T) -> u64 {
    t.as_raw_socket()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_reports_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        assert_eq!(Transport::peer_addr(&client), Some(addr));
    }

    #[test]
    fn udp_roundtrip() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let mut a = ConnectedUdp::new(a, b_addr).unwrap();
        let mut b = ConnectedUdp::new(b, a_addr).unwrap();
        assert_eq!(a.peer_addr(), Some(b_addr));

        let mut buf = [0u8; 16];
        let err = b.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        a.write_all(b"ping").unwrap();

        // Loopback delivery is quick but not synchronous.
        let mut n = 0;
        for _ in 0..1000 {
            match b.read(&mut buf) {
                Ok(len) => {
                    n = len;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1))
                }
                Err(e) => panic!("recv failed: {}", e),
            }
        }
        assert_eq!(&buf[..n], b"ping");
    }
}
