use std::convert::Infallible;
use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use openssl::ssl::{SslMethod, SslOptions, SslVersion};
use zeroize::Zeroizing;

use crate::Error;

/// Largest ALPN protocol name the wire format can carry.
const MAX_ALPN_NAME: usize = 255;

/// Smallest MTU the backend accepts for DTLS sessions.
pub const MIN_DTLS_MTU: u32 = 256;

/// Protocol method a context is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Negotiate the highest version both peers support.
    #[default]
    Negotiate,
    Tls1,
    Tls1_1,
    Tls1_2,
    Tls1_3,
    /// Any DTLS version.
    Dtls,
    Dtls1,
    Dtls1_2,
}

impl Method {
    /// Whether this is a datagram method.
    pub fn is_dtls(&self) -> bool {
        matches!(self, Method::Dtls | Method::Dtls1 | Method::Dtls1_2)
    }

    /// The backend method table.
    pub(crate) fn ssl_method(&self) -> SslMethod {
        if self.is_dtls() {
            SslMethod::dtls()
        } else {
            SslMethod::tls()
        }
    }

    /// Version both min and max are pinned to, if any.
    pub(crate) fn pinned_version(&self) -> Option<SslVersion> {
        match self {
            Method::Negotiate | Method::Dtls => None,
            Method::Tls1 => Some(SslVersion::TLS1),
            Method::Tls1_1 => Some(SslVersion::TLS1_1),
            Method::Tls1_2 => Some(SslVersion::TLS1_2),
            Method::Tls1_3 => Some(SslVersion::TLS1_3),
            Method::Dtls1 => Some(SslVersion::DTLS1),
            Method::Dtls1_2 => Some(SslVersion::DTLS1_2),
        }
    }
}

impl FromStr for Method {
    type Err = Infallible;

    /// Unknown names fall back to [`Method::Negotiate`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace(['_', '-'], ".");
        let method = match name.as_str() {
            "tlsv1" | "tlsv1.0" | "tls1" | "tls1.0" => Method::Tls1,
            "tlsv1.1" | "tls1.1" => Method::Tls1_1,
            "tlsv1.2" | "tls1.2" => Method::Tls1_2,
            "tlsv1.3" | "tls1.3" => Method::Tls1_3,
            "dtls" => Method::Dtls,
            "dtlsv1" | "dtlsv1.0" | "dtls1" | "dtls1.0" => Method::Dtls1,
            "dtlsv1.2" | "dtls1.2" => Method::Dtls1_2,
            _ => Method::Negotiate,
        };
        Ok(method)
    }
}

/// Set of protocol versions to disable.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolMask(u8);

impl ProtocolMask {
    pub const SSLV2: ProtocolMask = ProtocolMask(1 << 1);
    pub const SSLV3: ProtocolMask = ProtocolMask(1 << 2);
    pub const TLSV1: ProtocolMask = ProtocolMask(1 << 3);
    pub const TLSV1_1: ProtocolMask = ProtocolMask(1 << 4);
    pub const TLSV1_2: ProtocolMask = ProtocolMask(1 << 5);
    pub const TLSV1_3: ProtocolMask = ProtocolMask(1 << 6);

    const ALL: [(ProtocolMask, &'static str, SslOptions); 6] = [
        (ProtocolMask::SSLV2, "SSLv2", SslOptions::NO_SSLV2),
        (ProtocolMask::SSLV3, "SSLv3", SslOptions::NO_SSLV3),
        (ProtocolMask::TLSV1, "TLSv1", SslOptions::NO_TLSV1),
        (ProtocolMask::TLSV1_1, "TLSv1.1", SslOptions::NO_TLSV1_1),
        (ProtocolMask::TLSV1_2, "TLSv1.2", SslOptions::NO_TLSV1_2),
        (ProtocolMask::TLSV1_3, "TLSv1.3", SslOptions::NO_TLSV1_3),
    ];

    /// No protocol disabled.
    pub const fn empty() -> Self {
        ProtocolMask(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: ProtocolMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Split into the backend options to set and the ones to clear.
    pub(crate) fn to_options(self) -> (SslOptions, SslOptions) {
        let mut set = SslOptions::empty();
        let mut clear = SslOptions::empty();
        for (bit, _, option) in Self::ALL {
            if self.contains(bit) {
                set.insert(option);
            } else {
                clear.insert(option);
            }
        }
        (set, clear)
    }
}

impl BitOr for ProtocolMask {
    type Output = ProtocolMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        ProtocolMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for ProtocolMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = Self::ALL
            .iter()
            .filter(|(bit, _, _)| self.contains(*bit))
            .map(|(_, name, _)| *name)
            .collect();
        write!(f, "ProtocolMask({})", names.join("|"))
    }
}

impl FromStr for ProtocolMask {
    type Err = Error;

    /// Parse a list such as `"SSLv3, TLSv1"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = ProtocolMask::empty();
        for token in s.split([',', ':', ' ']).filter(|t| !t.is_empty()) {
            let Some((bit, _, _)) = Self::ALL
                .iter()
                .find(|(_, name, _)| name.eq_ignore_ascii_case(token))
            else {
                return Err(Error::Config(format!("Unknown protocol name: {}", token)));
            };
            mask = mask | *bit;
        }
        Ok(mask)
    }
}

/// TLS/DTLS configuration
#[derive(Clone)]
pub struct Config {
    method: Method,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    passphrase: Option<Arc<Zeroizing<Vec<u8>>>>,
    ciphers: Option<String>,
    prefer_server_ciphers: bool,
    dhparam: Option<PathBuf>,
    ecdh_curve: Option<String>,
    disable_protocols: ProtocolMask,
    disable_compression: bool,
    cafile: Option<PathBuf>,
    capath: Option<PathBuf>,
    client_ca_file: Option<PathBuf>,
    verify_depth: u32,
    verify_peer: bool,
    allow_self_signed: bool,
    alpn_protocols: Vec<String>,
    http: bool,
    http2: bool,
    dtls: bool,
    quiet_shutdown: bool,
    dtls_chunk_size: Option<usize>,
    dtls_mtu: u32,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            method: Method::Negotiate,
            cert_file: None,
            key_file: None,
            passphrase: None,
            ciphers: None,
            prefer_server_ciphers: false,
            dhparam: None,
            ecdh_curve: None,
            disable_protocols: ProtocolMask::empty(),
            disable_compression: true,
            cafile: None,
            capath: None,
            client_ca_file: None,
            verify_depth: 0,
            verify_peer: false,
            allow_self_signed: false,
            alpn_protocols: Vec::new(),
            http: false,
            http2: false,
            dtls: false,
            quiet_shutdown: false,
            dtls_chunk_size: None,
            dtls_mtu: 1150,
        }
    }

    /// Protocol method.
    #[inline(always)]
    pub fn method(&self) -> Method {
        self.method
    }

    /// PEM file with the local certificate (and optionally its chain).
    #[inline(always)]
    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    /// PEM file with the private key.
    ///
    /// Falls back to the certificate file when unset.
    #[inline(always)]
    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref().or(self.cert_file.as_deref())
    }

    /// Passphrase protecting the private key.
    #[inline(always)]
    pub fn passphrase(&self) -> Option<&[u8]> {
        self.passphrase.as_ref().map(|p| p.as_slice())
    }

    /// Cipher list in backend syntax.
    #[inline(always)]
    pub fn ciphers(&self) -> Option<&str> {
        self.ciphers.as_deref()
    }

    /// Whether the server's cipher order wins over the client's.
    #[inline(always)]
    pub fn prefer_server_ciphers(&self) -> bool {
        self.prefer_server_ciphers
    }

    /// PEM file with DH parameters.
    #[inline(always)]
    pub fn dhparam(&self) -> Option<&Path> {
        self.dhparam.as_deref()
    }

    /// Named curve for ECDH.
    #[inline(always)]
    pub fn ecdh_curve(&self) -> Option<&str> {
        self.ecdh_curve.as_deref()
    }

    /// Protocol versions to disable.
    #[inline(always)]
    pub fn disable_protocols(&self) -> ProtocolMask {
        self.disable_protocols
    }

    #[inline(always)]
    pub fn disable_compression(&self) -> bool {
        self.disable_compression
    }

    /// CA bundle used to verify peers.
    #[inline(always)]
    pub fn cafile(&self) -> Option<&Path> {
        self.cafile.as_deref()
    }

    /// Hashed CA directory used to verify peers.
    #[inline(always)]
    pub fn capath(&self) -> Option<&Path> {
        self.capath.as_deref()
    }

    /// For a server, CA bundle that client certificates must chain to.
    #[inline(always)]
    pub fn client_ca_file(&self) -> Option<&Path> {
        self.client_ca_file.as_deref()
    }

    /// Max verification depth. 0 keeps the backend default.
    #[inline(always)]
    pub fn verify_depth(&self) -> u32 {
        self.verify_depth
    }

    /// Whether to load a trust store and request peer verification.
    #[inline(always)]
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// Whether a self-signed peer certificate passes
    /// [`Session::verify_peer_trust`](crate::Session::verify_peer_trust).
    #[inline(always)]
    pub fn allow_self_signed(&self) -> bool {
        self.allow_self_signed
    }

    /// ALPN protocols a client offers.
    #[inline(always)]
    pub fn alpn_protocols(&self) -> &[String] {
        &self.alpn_protocols
    }

    #[inline(always)]
    pub fn is_http(&self) -> bool {
        self.http
    }

    #[inline(always)]
    pub fn is_http2(&self) -> bool {
        self.http2
    }

    /// Whether sessions run over datagrams.
    #[inline(always)]
    pub fn is_dtls(&self) -> bool {
        self.dtls || self.method.is_dtls()
    }

    /// Skip the close-notify exchange when closing.
    #[inline(always)]
    pub fn quiet_shutdown(&self) -> bool {
        self.quiet_shutdown
    }

    /// Largest payload a single DTLS write accepts.
    #[inline(always)]
    pub fn dtls_chunk_size(&self) -> Option<usize> {
        self.dtls_chunk_size
    }

    /// MTU for DTLS sessions.
    #[inline(always)]
    pub fn dtls_mtu(&self) -> u32 {
        self.dtls_mtu
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("method", &self.method)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("ciphers", &self.ciphers)
            .field("disable_protocols", &self.disable_protocols)
            .field("http2", &self.http2)
            .field("dtls", &self.is_dtls())
            .finish_non_exhaustive()
    }
}

/// Builder for TLS/DTLS configuration.
pub struct ConfigBuilder {
    method: Method,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    passphrase: Option<Arc<Zeroizing<Vec<u8>>>>,
    ciphers: Option<String>,
    prefer_server_ciphers: bool,
    dhparam: Option<PathBuf>,
    ecdh_curve: Option<String>,
    disable_protocols: ProtocolMask,
    disable_compression: bool,
    cafile: Option<PathBuf>,
    capath: Option<PathBuf>,
    client_ca_file: Option<PathBuf>,
    verify_depth: u32,
    verify_peer: bool,
    allow_self_signed: bool,
    alpn_protocols: Vec<String>,
    http: bool,
    http2: bool,
    dtls: bool,
    quiet_shutdown: bool,
    dtls_chunk_size: Option<usize>,
    dtls_mtu: u32,
}

impl ConfigBuilder {
    /// Set the protocol method.
    ///
    /// Defaults to [`Method::Negotiate`].
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the certificate (chain) PEM file.
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    /// Set the private key PEM file.
    ///
    /// Defaults to the certificate file.
    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    /// Set the passphrase for an encrypted private key.
    pub fn passphrase(mut self, passphrase: impl AsRef<[u8]>) -> Self {
        self.passphrase = Some(Arc::new(Zeroizing::new(passphrase.as_ref().to_vec())));
        self
    }

    /// Set the cipher list. Empty strings are ignored.
    pub fn ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphers = Some(ciphers.into());
        self
    }

    /// Defaults to false.
    pub fn prefer_server_ciphers(mut self, prefer: bool) -> Self {
        self.prefer_server_ciphers = prefer;
        self
    }

    /// Set the DH parameter PEM file.
    ///
    /// Without it a fixed well-known group is used.
    pub fn dhparam(mut self, path: impl Into<PathBuf>) -> Self {
        self.dhparam = Some(path.into());
        self
    }

    /// Set the ECDH curve by short name, e.g. `prime256v1`.
    pub fn ecdh_curve(mut self, curve: impl Into<String>) -> Self {
        self.ecdh_curve = Some(curve.into());
        self
    }

    /// Set protocol versions to disable.
    ///
    /// Defaults to none.
    pub fn disable_protocols(mut self, mask: ProtocolMask) -> Self {
        self.disable_protocols = mask;
        self
    }

    /// Defaults to true.
    pub fn disable_compression(mut self, disable: bool) -> Self {
        self.disable_compression = disable;
        self
    }

    /// Set the CA bundle used to verify peers.
    pub fn cafile(mut self, path: impl Into<PathBuf>) -> Self {
        self.cafile = Some(path.into());
        self
    }

    /// Set the hashed CA directory used to verify peers.
    pub fn capath(mut self, path: impl Into<PathBuf>) -> Self {
        self.capath = Some(path.into());
        self
    }

    /// For servers, request client certificates signed by these CAs.
    pub fn client_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_ca_file = Some(path.into());
        self
    }

    /// Defaults to 0, which keeps the backend default.
    pub fn verify_depth(mut self, depth: u32) -> Self {
        self.verify_depth = depth;
        self
    }

    /// Load a trust store and verify the peer.
    ///
    /// Defaults to false.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Accept self-signed peers in `Session::verify_peer_trust`.
    ///
    /// Defaults to false.
    pub fn allow_self_signed(mut self, allow: bool) -> Self {
        self.allow_self_signed = allow;
        self
    }

    /// ALPN protocols a client offers, most preferred first.
    pub fn alpn_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Enable the HTTP session cache. Defaults to false.
    pub fn http(mut self, http: bool) -> Self {
        self.http = http;
        self
    }

    /// Advertise `h2` ahead of `http/1.1`. Defaults to false.
    pub fn http2(mut self, http2: bool) -> Self {
        self.http2 = http2;
        self
    }

    /// Run over datagrams. Defaults to false.
    pub fn dtls(mut self, dtls: bool) -> Self {
        self.dtls = dtls;
        self
    }

    /// Defaults to false.
    pub fn quiet_shutdown(mut self, quiet: bool) -> Self {
        self.quiet_shutdown = quiet;
        self
    }

    /// Cap the payload of a single DTLS write. Defaults to no cap.
    pub fn dtls_chunk_size(mut self, size: usize) -> Self {
        self.dtls_chunk_size = Some(size);
        self
    }

    /// Defaults to 1150. Must be at least [`MIN_DTLS_MTU`].
    pub fn dtls_mtu(mut self, mtu: u32) -> Self {
        self.dtls_mtu = mtu;
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::Config` for combinations that can never produce a
    /// working context.
    pub fn build(self) -> Result<Config, Error> {
        if self.key_file.is_some() && self.cert_file.is_none() {
            return Err(Error::Config(
                "key_file requires cert_file to be set".to_string(),
            ));
        }

        if self.dtls && !self.method.is_dtls() && self.method.pinned_version().is_some() {
            return Err(Error::Config(format!(
                "DTLS cannot use method {:?}",
                self.method
            )));
        }

        if self.dtls_mtu < MIN_DTLS_MTU {
            return Err(Error::Config(format!(
                "dtls_mtu {} is below the minimum of {}",
                self.dtls_mtu, MIN_DTLS_MTU
            )));
        }

        if self.dtls_chunk_size == Some(0) {
            return Err(Error::Config("dtls_chunk_size must be > 0".to_string()));
        }

        for p in &self.alpn_protocols {
            if p.is_empty() || p.len() > MAX_ALPN_NAME {
                return Err(Error::Config(format!("Invalid ALPN protocol: {:?}", p)));
            }
        }

        let ciphers = self.ciphers.filter(|c| !c.is_empty());
        let ecdh_curve = self.ecdh_curve.filter(|c| !c.is_empty());

        Ok(Config {
            method: self.method,
            cert_file: self.cert_file,
            key_file: self.key_file,
            passphrase: self.passphrase,
            ciphers,
            prefer_server_ciphers: self.prefer_server_ciphers,
            dhparam: self.dhparam,
            ecdh_curve,
            disable_protocols: self.disable_protocols,
            disable_compression: self.disable_compression,
            cafile: self.cafile,
            capath: self.capath,
            client_ca_file: self.client_ca_file,
            verify_depth: self.verify_depth,
            verify_peer: self.verify_peer,
            allow_self_signed: self.allow_self_signed,
            alpn_protocols: self.alpn_protocols,
            http: self.http,
            http2: self.http2,
            dtls: self.dtls,
            quiet_shutdown: self.quiet_shutdown,
            dtls_chunk_size: self.dtls_chunk_size,
            dtls_mtu: self.dtls_mtu,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
