//! Shared helpers for integration tests.

#![allow(unused)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nbtls::{HandshakeResult, Session, Transport};

/// Handshake message types (RFC 5246 / 6347).
pub const CLIENT_HELLO: u8 = 1;
pub const HELLO_VERIFY_REQUEST: u8 = 3;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
struct Channel {
    bytes: VecDeque<u8>,
    datagrams: VecDeque<Vec<u8>>,
    written: usize,
}

/// One end of an in-memory transport pair.
///
/// Reads report `WouldBlock` until the other end has written something.
pub struct MemoryTransport {
    id: u64,
    peer: SocketAddr,
    datagram: bool,
    inbox: Arc<Mutex<Channel>>,
    outbox: Arc<Mutex<Channel>>,
}

impl MemoryTransport {
    /// Bytes written by this end so far.
    pub fn written(&self) -> usize {
        self.outbox.lock().unwrap().written
    }

    /// Bytes (stream) or datagrams waiting to be read by this end.
    pub fn available(&self) -> usize {
        let inbox = self.inbox.lock().unwrap();
        if self.datagram {
            inbox.datagrams.len()
        } else {
            inbox.bytes.len()
        }
    }

    /// Copies of the datagrams waiting to be read by this end.
    pub fn incoming_datagrams(&self) -> Vec<Vec<u8>> {
        self.inbox.lock().unwrap().datagrams.iter().cloned().collect()
    }

    /// Deliver raw bytes to this end as if the peer sent them.
    pub fn inject(&self, data: &[u8]) {
        let mut inbox = self.inbox.lock().unwrap();
        if self.datagram {
            inbox.datagrams.push_back(data.to_vec());
        } else {
            inbox.bytes.extend(data);
        }
    }
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbox = self.inbox.lock().unwrap();

        if self.datagram {
            let Some(datagram) = inbox.datagrams.pop_front() else {
                return Err(io::ErrorKind::WouldBlock.into());
            };
            let n = datagram.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram[..n]);
            return Ok(n);
        }

        if inbox.bytes.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = inbox.bytes.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(inbox.bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut outbox = self.outbox.lock().unwrap();
        if self.datagram {
            outbox.datagrams.push_back(buf.to_vec());
        } else {
            outbox.bytes.extend(buf);
        }
        outbox.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

fn pair(datagram: bool) -> (MemoryTransport, MemoryTransport) {
    let id = next_id();
    let client_addr: SocketAddr = format!("127.0.0.1:{}", 40000 + id % 20000).parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();

    let to_server = Arc::new(Mutex::new(Channel::default()));
    let to_client = Arc::new(Mutex::new(Channel::default()));

    let client = MemoryTransport {
        id: id * 2,
        peer: server_addr,
        datagram,
        inbox: to_client.clone(),
        outbox: to_server.clone(),
    };
    let server = MemoryTransport {
        id: id * 2 + 1,
        peer: client_addr,
        datagram,
        inbox: to_server,
        outbox: to_client,
    };

    (client, server)
}

/// Connected (client, server) byte stream ends.
pub fn stream_pair() -> (MemoryTransport, MemoryTransport) {
    pair(false)
}

/// Connected (client, server) datagram ends.
pub fn datagram_pair() -> (MemoryTransport, MemoryTransport) {
    pair(true)
}

/// Step both sessions until both are ready.
pub fn handshake<T: Transport>(client: &mut Session<T>, server: &mut Session<T>) {
    for _ in 0..50 {
        let c = client.step();
        let s = server.step();

        if let HandshakeResult::Fatal(reason) = &c {
            panic!("client handshake failed: {}", reason);
        }
        if let HandshakeResult::Fatal(reason) = &s {
            panic!("server handshake failed: {}", reason);
        }
        if c == HandshakeResult::Ready && s == HandshakeResult::Ready {
            return;
        }
    }
    panic!("handshake did not complete");
}

/// Read until `len` bytes arrived.
pub fn read_exact<T: Transport>(session: &mut Session<T>, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    for _ in 0..1000 {
        if out.len() >= len {
            break;
        }
        match session.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.is_would_block() => {}
            Err(e) => panic!("read failed: {}", e),
        }
    }
    out
}

/// Parse handshake message types from a datagram (content_type=22).
pub fn parse_handshake_types(datagram: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 13 <= datagram.len() {
        let ctype = datagram[i];
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        if ctype == 22 && i + 13 < datagram.len() {
            out.push(datagram[i + 13]);
        }
        i += 13 + len;
    }
    out
}

/// A generated certificate and key, written to PEM files.
pub struct TestCert {
    pub dir: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCert {
    /// Self-signed certificate for the given SAN DNS names.
    pub fn self_signed(names: &[&str]) -> TestCert {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let cert = rcgen::generate_simple_self_signed(names).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        let key_pem = cert.serialize_private_key_pem();

        let dir = scratch_dir();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, &cert_pem).unwrap();
        std::fs::write(&key_path, &key_pem).unwrap();

        TestCert {
            dir,
            cert: cert_path,
            key: key_path,
            cert_pem,
            key_pem,
        }
    }

    /// Write extra content next to the certificate.
    pub fn write(&self, name: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

impl Drop for TestCert {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "nbtls-test-{}-{}",
        std::process::id(),
        next_id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
