//! Non-blocking TLS/DTLS sessions over caller-driven transports.
//!
//! A [`Context`] is built once per listener (or client configuration) from
//! a [`Config`]. Each connection then gets a [`Session`] that the caller's
//! event loop drives: [`Session::step`] until the handshake is `Ready`,
//! then [`Session::read`] / [`Session::write`]. Nothing blocks; when the
//! transport isn't ready the session says which direction to wait for.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use nbtls::{Config, Context, CryptoRuntime, HandshakeResult, Role, Session};
//!
//! # fn main() -> Result<(), nbtls::Error> {
//! let runtime = CryptoRuntime::init()?;
//! let config = Config::builder()
//!     .verify_peer(true)
//!     .alpn_protocols(["h2", "http/1.1"])
//!     .build()?;
//! let context = Context::new(&runtime, &config)?;
//!
//! let stream = TcpStream::connect("example.com:443").unwrap();
//! stream.set_nonblocking(true).unwrap();
//!
//! let mut session = Session::new(&context, stream, Role::Client)?;
//! session.set_server_name("example.com")?;
//!
//! loop {
//!     match session.step() {
//!         HandshakeResult::Ready => break,
//!         HandshakeResult::WaitIO(_direction) => {
//!             // Park until the socket is ready in that direction.
//!         }
//!         HandshakeResult::Fatal(reason) => panic!("handshake failed: {}", reason),
//!     }
//! }
//!
//! session.verify_trust(false)?;
//! session.verify_hostname("example.com")?;
//! # Ok(())
//! # }
//! ```
//!
//! Datagram transports get a stateless cookie exchange before the full
//! DTLS handshake, see [`CookieExchange`].
//!
//! Conditions caused by the remote peer (protocol violations, failed
//! verification) are logged under the `nbtls::peer` target so they can be
//! filtered apart from local faults.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod alpn;
pub use alpn::{encode_protocols, Advertiser, H2, HTTP_1_1};

mod config;
pub use config::{Config, ConfigBuilder, Method, ProtocolMask, MIN_DTLS_MTU};

mod context;
pub use context::{Context, ContextBuilder};

mod cookie;
pub use cookie::{Cookie, CookieExchange, CookieSecret, COOKIE_SECRET_LEN, MAX_COOKIE_LEN};

mod error;
pub use error::Error;

mod runtime;
pub use runtime::{last_error, thread_id, CryptoRuntime, LockSlot, ERROR_BUFFER_LEN};

mod session;
pub use session::{
    Direction, FatalReason, HandshakeResult, Negotiated, NewSessionError, Role, Session, State,
    SEND_FILE_CHUNK,
};

mod transport;
pub use transport::{ConnectedUdp, Transport};

mod verify;
pub use verify::{match_name, PeerCertificate};

/// Log target for conditions caused by the remote peer.
pub(crate) const PEER_LOG: &str = "nbtls::peer";
