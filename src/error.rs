use std::io;

use thiserror::Error;

use crate::session::Direction;

/// Errors arising from building contexts and driving sessions.
#[derive(Debug, Error)]
pub enum Error {
    /// The crypto runtime could not be initialized.
    #[error("Crypto runtime: {0}")]
    Runtime(String),

    /// The runtime can't be torn down while sessions are alive.
    #[error("Crypto runtime still has {0} active sessions")]
    RuntimeBusy(usize),

    /// Invalid combination of configuration values.
    #[error("Config error: {0}")]
    Config(String),

    /// Loading the certificate, chain or private key failed.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// The cipher list was rejected.
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// The DH parameters could not be loaded.
    #[error("DH param error: {0}")]
    DhParam(String),

    /// Unknown or unusable ECDH curve.
    #[error("Curve error: {0}")]
    Curve(String),

    /// CA file/path could not be loaded.
    #[error("CA error: {0}")]
    Ca(String),

    /// The engine for a session could not be allocated.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Retry once the transport is ready in the given direction.
    #[error("Would block on {0:?}")]
    WouldBlock(Direction),

    /// Application data requested before the handshake completed.
    #[error("Session is not ready")]
    NotReady,

    /// The transport failed underneath the session.
    #[error("Connection reset: {0}")]
    Reset(String),

    /// The peer sent malformed or hostile protocol data.
    #[error("Bad peer: {0}")]
    BadPeer(String),

    /// Any other unrecoverable session error.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Reading the file for send_file failed.
    #[error("File read failed: {0}")]
    FileRead(#[source] io::Error),

    /// The peer certificate chain was not trusted.
    #[error("Verify failed: {0}")]
    VerifyFailed(String),

    /// The peer did not present a certificate.
    #[error("No peer certificate")]
    NoPeerCertificate,

    /// No SAN or CN entry matched the expected host name.
    #[error("Host name {0} does not match peer certificate")]
    HostnameMismatch(String),

    /// The peer certificate could not be parsed.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
}

impl Error {
    /// Whether this error is a routine "try again later" signal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock(_))
    }

    /// Whether this error was produced while building a context.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Certificate(_)
                | Error::Cipher(_)
                | Error::DhParam(_)
                | Error::Curve(_)
                | Error::Ca(_)
        )
    }
}
