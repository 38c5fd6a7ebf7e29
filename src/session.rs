//! Per-connection handshake and I/O state machine.

use std::fmt;
#[cfg(unix)]
use std::fs::File;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use openssl::error::ErrorStack;
use openssl::ssl::{self, ErrorCode, ShutdownState, Ssl, SslStream};

use crate::context::Context;
use crate::runtime::{clear_error_queue, CryptoRuntime, LockSlot};
use crate::transport::Transport;
use crate::verify::{check_trust, PeerCertificate};
use crate::{Error, PEER_LOG};

/// Largest chunk [`Session::send_file`] reads from the file at once.
pub const SEND_FILE_CHUNK: usize = 64 * 1024;

/// Readiness direction the transport must reach before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Which side of the handshake a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle of a session.
///
/// Advances `Init → Handshaking → {Ready | Error}`. `Ready → Closed` is
/// the only way out of `Ready`; `close()` releases any state to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    Handshaking = 1,
    Ready = 2,
    Closed = 3,
    Error = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Handshaking,
            2 => State::Ready,
            3 => State::Closed,
            _ => State::Error,
        }
    }
}

/// Outcome of one handshake round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    Ready,
    /// Call `step()` again once the transport is ready this way.
    WaitIO(Direction),
    Fatal(FatalReason),
}

/// Why a handshake can't continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// The peer violated the protocol.
    Protocol(String),
    /// The peer closed the connection mid handshake.
    Shutdown,
    /// The transport failed.
    Syscall(String),
    /// `step()` on a closed or failed session.
    InvalidState,
    Other(String),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::Protocol(r) => write!(f, "protocol error: {}", r),
            FatalReason::Shutdown => write!(f, "shutdown during handshake"),
            FatalReason::Syscall(r) => write!(f, "syscall error: {}", r),
            FatalReason::InvalidState => write!(f, "invalid session state"),
            FatalReason::Other(r) => write!(f, "{}", r),
        }
    }
}

/// Parameters agreed on by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub version: String,
    pub cipher: Option<String>,
    pub alpn: Option<Vec<u8>>,
}

/// [`Session::new`] failed. Carries the transport back to the caller.
pub struct NewSessionError<T> {
    error: Error,
    transport: T,
}

impl<T> NewSessionError<T> {
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The transport, as it was passed in.
    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn into_parts(self) -> (Error, T) {
        (self.error, self.transport)
    }
}

impl<T> From<NewSessionError<T>> for Error {
    fn from(e: NewSessionError<T>) -> Self {
        e.error
    }
}

impl<T> fmt::Debug for NewSessionError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSessionError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for NewSessionError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T> std::error::Error for NewSessionError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Session data reachable from backend callbacks.
#[derive(Debug)]
pub(crate) struct SessionTag {
    id: u64,
    peer: Option<SocketAddr>,
    state: AtomicU8,
    renegotiated: AtomicBool,
}

impl SessionTag {
    fn new(id: u64, peer: Option<SocketAddr>) -> Self {
        SessionTag {
            id,
            peer,
            state: AtomicU8::new(State::Init as u8),
            renegotiated: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn mark_renegotiated(&self) {
        self.renegotiated.store(true, Ordering::Release);
    }

    fn is_renegotiated(&self) -> bool {
        self.renegotiated.load(Ordering::Acquire)
    }
}

enum Engine<T> {
    /// Allocated but not yet attached to the transport.
    Pending(Ssl, T),
    Attached(SslStream<T>),
    Released,
}

/// One TLS/DTLS connection over a non-blocking [`Transport`].
pub struct Session<T: Transport> {
    runtime: Arc<CryptoRuntime>,
    engine: Engine<T>,
    tag: Arc<SessionTag>,
    role: Role,
    want_read: bool,
    want_write: bool,
    negotiated: Option<Negotiated>,
    dtls: bool,
    chunk_size: Option<usize>,
    quiet_shutdown: bool,
    allow_self_signed: bool,
    scratch: Vec<u8>,
}

impl<T: Transport> Session<T> {
    /// Create a session for `transport` from the shared `context`.
    ///
    /// Nothing is written to the transport until the first `step()`. On
    /// failure the transport is handed back untouched.
    pub fn new(context: &Context, transport: T, role: Role) -> Result<Self, NewSessionError<T>> {
        let runtime = context.runtime().clone();
        if let Err(error) = runtime.ensure_initialized() {
            return Err(NewSessionError { error, transport });
        }

        let config = context.config();
        let tag = Arc::new(SessionTag::new(transport.id(), transport.peer_addr()));

        let allocated = runtime.with_lock(LockSlot::Session, || -> Result<Ssl, ErrorStack> {
            let mut ssl = Ssl::new(context.ssl_context())?;
            ssl.set_ex_data(runtime.session_tag(), tag.clone());
            if context.is_dtls() {
                ssl.set_mtu(config.dtls_mtu())?;
            }
            match role {
                Role::Client => ssl.set_connect_state(),
                Role::Server => ssl.set_accept_state(),
            }
            Ok(ssl)
        });

        let ssl = match allocated {
            Ok(ssl) => ssl,
            Err(e) => {
                debug!("Allocation for connection#{} failed: {}", tag.id, e);
                return Err(NewSessionError {
                    error: Error::AllocationFailed(format!("connection#{}: {}", tag.id, e)),
                    transport,
                });
            }
        };

        runtime.session_opened();

        trace!("New {:?} session for connection#{}", role, tag.id);

        Ok(Session {
            runtime,
            engine: Engine::Pending(ssl, transport),
            tag,
            role,
            want_read: false,
            want_write: false,
            negotiated: None,
            dtls: context.is_dtls(),
            chunk_size: config.dtls_chunk_size(),
            quiet_shutdown: config.quiet_shutdown(),
            allow_self_signed: config.allow_self_signed(),
            scratch: Vec::new(),
        })
    }

    /// Host name sent as SNI and used by the peer to pick a certificate.
    ///
    /// Only for clients, before the first `step()`.
    pub fn set_server_name(&mut self, name: &str) -> Result<(), Error> {
        if self.role != Role::Client {
            return Err(Error::Config("SNI is only sent by clients".to_string()));
        }
        match &mut self.engine {
            Engine::Pending(ssl, _) => ssl
                .set_hostname(name)
                .map_err(|e| Error::Config(format!("Bad server name {}: {}", name, e))),
            _ => Err(Error::Config(
                "Server name must be set before the handshake".to_string(),
            )),
        }
    }

    /// Drive the handshake as far as the transport allows.
    pub fn step(&mut self) -> HandshakeResult {
        self.clear_wants();

        match self.state() {
            State::Ready => return HandshakeResult::Ready,
            State::Closed | State::Error => {
                return HandshakeResult::Fatal(FatalReason::InvalidState)
            }
            State::Init => self.tag.set_state(State::Handshaking),
            State::Handshaking => {}
        }

        let result = match self.stream_mut().map(|stream| stream.do_handshake()) {
            Ok(result) => result,
            Err(e) => {
                self.tag.set_state(State::Error);
                return HandshakeResult::Fatal(FatalReason::Other(e.to_string()));
            }
        };

        match result {
            Ok(()) => {
                self.tag.set_state(State::Ready);
                self.record_negotiated();
                HandshakeResult::Ready
            }
            Err(e) => self.handshake_error(e),
        }
    }

    /// Read decrypted application data.
    ///
    /// `Ok(0)` means the peer closed cleanly.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.clear_wants();
        self.ensure_ready()?;

        let result = self.stream_mut()?.ssl_read(buf);
        match result {
            Ok(n) => Ok(n),
            Err(e) => self.io_error(e),
        }
    }

    /// Write application data, returning how much was accepted.
    ///
    /// DTLS writes above the configured chunk size are cut to that size;
    /// the caller resubmits the rest.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.clear_wants();
        self.ensure_ready()?;

        let len = match self.chunk_size {
            Some(chunk) if self.dtls && buf.len() > chunk => {
                trace!(
                    "Truncate write of {} to {} for connection#{}",
                    buf.len(),
                    chunk,
                    self.tag.id
                );
                chunk
            }
            _ => buf.len(),
        };

        let result = self.stream_mut()?.ssl_write(&buf[..len]);
        match result {
            Ok(n) => Ok(n),
            Err(e) => self.io_error(e),
        }
    }

    /// Send up to `length` bytes of `file` starting at `offset`.
    ///
    /// At most [`SEND_FILE_CHUNK`] bytes are read per call. `offset` is
    /// advanced by what the session accepted. `Ok(0)` at end of file.
    #[cfg(unix)]
    pub fn send_file(
        &mut self,
        file: &File,
        offset: &mut u64,
        length: usize,
    ) -> Result<usize, Error> {
        use std::os::unix::fs::FileExt;

        self.clear_wants();
        self.ensure_ready()?;

        let want = length.min(SEND_FILE_CHUNK);
        if want == 0 {
            return Ok(0);
        }

        let mut scratch = mem::take(&mut self.scratch);
        if scratch.len() < SEND_FILE_CHUNK {
            scratch.resize(SEND_FILE_CHUNK, 0);
        }

        let result = match file.read_at(&mut scratch[..want], *offset) {
            Ok(0) => Ok(0),
            Ok(n) => self.write(&scratch[..n]),
            Err(e) => Err(Error::FileRead(e)),
        };
        self.scratch = scratch;

        if let Ok(sent) = result {
            *offset += sent as u64;
        }

        result
    }

    /// Close the session and release the engine.
    ///
    /// A session still handshaking is dropped without any shutdown
    /// exchange. Calling it again does nothing.
    pub fn close(&mut self) {
        let engine = mem::replace(&mut self.engine, Engine::Released);
        let was_ready = self.state() == State::Ready;

        match engine {
            Engine::Released => return,
            Engine::Pending(..) => {}
            Engine::Attached(mut stream) => {
                if was_ready && stream.ssl().is_init_finished() {
                    self.shutdown(&mut stream);
                } else {
                    trace!(
                        "Discard connection#{} without shutdown during handshake",
                        self.tag.id
                    );
                }
            }
        }

        self.clear_wants();
        self.tag.set_state(State::Closed);
        debug!("Closed connection#{}", self.tag.id);
    }

    fn shutdown(&self, stream: &mut SslStream<T>) {
        if self.quiet_shutdown {
            stream.set_shutdown(ShutdownState::SENT | ShutdownState::RECEIVED);
        }

        match stream.shutdown() {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => {}
            Err(e) if e.ssl_error().is_none() => {
                trace!("Shutdown of connection#{} incomplete: {}", self.tag.id, e);
            }
            Err(e) => {
                warn!("Shutdown of connection#{} failed: {}", self.tag.id, e);
            }
        }
    }

    pub fn state(&self) -> State {
        self.tag.state()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the last call stopped waiting for the transport to be readable.
    pub fn wants_read(&self) -> bool {
        self.want_read
    }

    /// Whether the last call stopped waiting for the transport to be writable.
    pub fn wants_write(&self) -> bool {
        self.want_write
    }

    /// Whether the peer started a new handshake after the first completed.
    pub fn is_renegotiated(&self) -> bool {
        self.tag.is_renegotiated()
    }

    /// Version, cipher and ALPN protocol, once `Ready`.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Connection id of the transport.
    pub fn id(&self) -> u64 {
        self.tag.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.tag.peer
    }

    /// The transport, unless the session was closed.
    pub fn transport(&self) -> Option<&T> {
        match &self.engine {
            Engine::Pending(_, t) => Some(t),
            Engine::Attached(s) => Some(s.get_ref()),
            Engine::Released => None,
        }
    }

    /// Mutable access to the transport, unless the session was closed.
    pub fn transport_mut(&mut self) -> Option<&mut T> {
        match &mut self.engine {
            Engine::Pending(_, t) => Some(t),
            Engine::Attached(s) => Some(s.get_mut()),
            Engine::Released => None,
        }
    }

    /// Certificate the peer presented.
    pub fn peer_certificate(&self) -> Result<PeerCertificate, Error> {
        let der = self
            .peer_x509()?
            .to_der()
            .map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        PeerCertificate::from_der(&der)
    }

    /// Certificate the peer presented, PEM encoded.
    pub fn peer_certificate_pem(&self) -> Result<String, Error> {
        let pem = self
            .peer_x509()?
            .to_pem()
            .map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        String::from_utf8(pem).map_err(|e| Error::InvalidCertificate(e.to_string()))
    }

    /// Check the chain verification outcome.
    ///
    /// A self-signed peer certificate passes only with `allow_self_signed`.
    pub fn verify_trust(&self, allow_self_signed: bool) -> Result<(), Error> {
        self.ensure_ready()?;
        let ssl = self.ssl().ok_or(Error::NotReady)?;
        check_trust(ssl.verify_result(), allow_self_signed, self.tag.id)
    }

    /// [`verify_trust`](Self::verify_trust) with the context's
    /// `allow_self_signed` setting.
    pub fn verify_peer_trust(&self) -> Result<(), Error> {
        self.verify_trust(self.allow_self_signed)
    }

    /// Check that the peer certificate is valid for `host`.
    pub fn verify_hostname(&self, host: &str) -> Result<(), Error> {
        let cert = self.peer_certificate()?;
        if cert.matches_host(host) {
            Ok(())
        } else {
            info!(
                target: PEER_LOG,
                "Certificate of connection#{} does not match {}", self.tag.id, host
            );
            Err(Error::HostnameMismatch(host.to_string()))
        }
    }

    fn peer_x509(&self) -> Result<openssl::x509::X509, Error> {
        let ssl = self.ssl().ok_or(Error::NoPeerCertificate)?;
        ssl.peer_certificate().ok_or(Error::NoPeerCertificate)
    }

    fn ssl(&self) -> Option<&ssl::SslRef> {
        match &self.engine {
            Engine::Pending(ssl, _) => Some(ssl),
            Engine::Attached(s) => Some(s.ssl()),
            Engine::Released => None,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut SslStream<T>, Error> {
        if matches!(self.engine, Engine::Pending(..)) {
            if let Engine::Pending(ssl, transport) = mem::replace(&mut self.engine, Engine::Released)
            {
                let stream = SslStream::new(ssl, transport)
                    .map_err(|e| Error::AllocationFailed(e.to_string()))?;
                self.engine = Engine::Attached(stream);
            }
        }

        match &mut self.engine {
            Engine::Attached(stream) => Ok(stream),
            _ => Err(Error::Fatal(format!(
                "connection#{} has been released",
                self.tag.id
            ))),
        }
    }

    /// Reset per-call state before touching the engine.
    fn clear_wants(&mut self) {
        self.want_read = false;
        self.want_write = false;
        clear_error_queue();
    }

    fn wait(&mut self, direction: Direction) -> Direction {
        match direction {
            Direction::Read => self.want_read = true,
            Direction::Write => self.want_write = true,
        }
        direction
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        if self.state() == State::Ready {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    fn handshake_error(&mut self, e: ssl::Error) -> HandshakeResult {
        let result = match e.code() {
            ErrorCode::WANT_READ => return HandshakeResult::WaitIO(self.wait(Direction::Read)),
            ErrorCode::WANT_WRITE => return HandshakeResult::WaitIO(self.wait(Direction::Write)),
            ErrorCode::SYSCALL if self.dtls && e.io_error().is_none() => {
                return HandshakeResult::WaitIO(self.wait(Direction::Read))
            }
            ErrorCode::ZERO_RETURN => FatalReason::Shutdown,
            ErrorCode::SYSCALL => FatalReason::Syscall(describe(&e)),
            ErrorCode::SSL => FatalReason::Protocol(self.peer_error(&e)),
            _ => FatalReason::Other(e.to_string()),
        };

        debug!("Handshake of connection#{} failed: {}", self.tag.id, result);
        self.tag.set_state(State::Error);

        HandshakeResult::Fatal(result)
    }

    fn io_error(&mut self, e: ssl::Error) -> Result<usize, Error> {
        match e.code() {
            ErrorCode::WANT_READ => Err(Error::WouldBlock(self.wait(Direction::Read))),
            ErrorCode::WANT_WRITE => Err(Error::WouldBlock(self.wait(Direction::Write))),
            ErrorCode::ZERO_RETURN => Ok(0),
            ErrorCode::SYSCALL => Err(Error::Reset(describe(&e))),
            ErrorCode::SSL => Err(Error::BadPeer(self.peer_error(&e))),
            _ => Err(Error::Fatal(e.to_string())),
        }
    }

    /// Log a protocol error caused by the peer and return its reason.
    fn peer_error(&self, e: &ssl::Error) -> String {
        let reason = describe(e);
        match self.tag.peer {
            Some(peer) => warn!(
                target: PEER_LOG,
                "connection#{} peer {}:{}: {}",
                self.tag.id,
                peer.ip(),
                peer.port(),
                reason
            ),
            None => warn!(target: PEER_LOG, "connection#{}: {}", self.tag.id, reason),
        }
        reason
    }

    fn record_negotiated(&mut self) {
        let Some(ssl) = self.ssl() else {
            return;
        };

        let negotiated = Negotiated {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            alpn: ssl.selected_alpn_protocol().map(|p| p.to_vec()),
        };

        if self.role == Role::Client {
            debug!(
                "Connection#{} negotiated {} {} alpn: {:?}",
                self.tag.id,
                negotiated.version,
                negotiated.cipher.as_deref().unwrap_or("-"),
                negotiated
                    .alpn
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default()
            );
        }

        self.negotiated = Some(negotiated);
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.runtime.session_closed();
    }
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.tag.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("want_read", &self.want_read)
            .field("want_write", &self.want_write)
            .finish()
    }
}

fn describe(e: &ssl::Error) -> String {
    if let Some(io) = e.io_error() {
        return io.to_string();
    }
    if let Some(stack) = e.ssl_error() {
        return stack.to_string();
    }
    e.to_string()
}
