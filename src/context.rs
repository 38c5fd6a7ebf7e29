use std::fs;
use std::path::Path;
use std::sync::Arc;

use openssl::dh::Dh;
use openssl::ec::EcKey;
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    AlpnError, ClientHelloResponse, SslContext, SslContextBuilder, SslFiletype, SslMethod,
    SslMode, SslOptions, SslSessionCacheMode, SslVerifyMode,
};
use openssl::x509::store::X509Lookup;
use openssl::x509::X509Name;

use crate::alpn::{encode_protocols, Advertiser};
use crate::config::Config;
use crate::cookie::{CookieExchange, CookieSecret};
use crate::runtime::{CryptoRuntime, LockSlot};
use crate::session::State;
use crate::Error;

/// Session id context used when the HTTP session cache is on.
const HTTP_SESSION_ID_CONTEXT: &[u8] = b"HTTP";

/// Named curves accepted for ECDH, with the names they go by.
const CURVES: &[(Nid, &[&str])] = &[
    (Nid::X9_62_PRIME256V1, &["prime256v1", "secp256r1", "P-256"]),
    (Nid::SECP384R1, &["secp384r1", "P-384"]),
    (Nid::SECP521R1, &["secp521r1", "P-521"]),
    (Nid::SECP224R1, &["secp224r1", "P-224"]),
    (Nid::X9_62_PRIME192V1, &["prime192v1", "secp192r1", "P-192"]),
    (Nid::SECP256K1, &["secp256k1"]),
];

/// A built TLS/DTLS context, shared by every session of a listener.
///
/// Cloning is cheap and shares the underlying backend context.
#[derive(Clone)]
pub struct Context {
    ssl: SslContext,
    runtime: Arc<CryptoRuntime>,
    config: Arc<Config>,
    advertiser: Advertiser,
    cookies: Option<CookieExchange>,
}

impl Context {
    /// Build a context from `config` in one go.
    pub fn new(runtime: &Arc<CryptoRuntime>, config: &Config) -> Result<Context, Error> {
        Ok(ContextBuilder::new(runtime, config)?.build())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<CryptoRuntime> {
        &self.runtime
    }

    pub fn is_dtls(&self) -> bool {
        self.config.is_dtls()
    }

    /// Protocols a server context advertises.
    pub fn advertiser(&self) -> &Advertiser {
        &self.advertiser
    }

    /// The cookie exchange of a DTLS context.
    pub fn cookie_exchange(&self) -> Option<&CookieExchange> {
        self.cookies.as_ref()
    }

    pub(crate) fn ssl_context(&self) -> &SslContext {
        &self.ssl
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder applying a [`Config`] to a backend context.
///
/// All of the config is applied by [`ContextBuilder::new`]. Trust settings
/// can be added before [`build`](ContextBuilder::build) freezes the
/// context.
pub struct ContextBuilder {
    builder: SslContextBuilder,
    runtime: Arc<CryptoRuntime>,
    config: Config,
    advertiser: Advertiser,
    cookies: Option<CookieExchange>,
}

impl ContextBuilder {
    /// Start a context from `config`.
    ///
    /// Each step fails with its own error kind. A partially configured
    /// context is dropped on failure.
    pub fn new(runtime: &Arc<CryptoRuntime>, config: &Config) -> Result<ContextBuilder, Error> {
        runtime.ensure_initialized()?;
        runtime.with_lock(LockSlot::Context, || Self::configure(runtime, config))
    }

    fn configure(runtime: &Arc<CryptoRuntime>, config: &Config) -> Result<ContextBuilder, Error> {
        let method = if config.is_dtls() {
            SslMethod::dtls()
        } else {
            config.method().ssl_method()
        };

        let mut builder = SslContextBuilder::new(method)
            .map_err(|e| Error::Runtime(format!("Context allocation failed: {}", e)))?;

        if let Some(version) = config.method().pinned_version() {
            let pin_err =
                |e: ErrorStack| Error::Config(format!("Can't pin {:?}: {}", config.method(), e));
            builder.set_min_proto_version(Some(version)).map_err(pin_err)?;
            builder.set_max_proto_version(Some(version)).map_err(pin_err)?;
        }

        // Fixed hardening, not configurable.
        builder.set_options(SslOptions::DONT_INSERT_EMPTY_FRAGMENTS);
        builder.clear_options(SslOptions::TLS_ROLLBACK_BUG);
        builder.set_mode(
            SslMode::RELEASE_BUFFERS
                | SslMode::NO_AUTO_CHAIN
                | SslMode::ENABLE_PARTIAL_WRITE
                | SslMode::ACCEPT_MOVING_WRITE_BUFFER,
        );
        builder.set_read_ahead(true);

        // Clear what isn't disabled so the outcome never depends on defaults.
        let (disable, enable) = config.disable_protocols().to_options();
        builder.set_options(disable);
        builder.clear_options(enable);

        if config.disable_compression() {
            builder.set_options(SslOptions::NO_COMPRESSION);
        } else {
            builder.clear_options(SslOptions::NO_COMPRESSION);
        }

        let tag_index = runtime.session_tag();
        builder.set_client_hello_callback(move |ssl, _alert| {
            if let Some(tag) = ssl.ex_data(tag_index) {
                if tag.state() == State::Ready {
                    debug!("Renegotiation on connection#{}", tag.id());
                    tag.mark_renegotiated();
                }
            }
            Ok(ClientHelloResponse::SUCCESS)
        });

        if let Some(cert) = config.cert_file() {
            load_certificate(&mut builder, cert, config.key_file(), config.passphrase())?;
        }

        if let Some(ciphers) = config.ciphers() {
            builder
                .set_cipher_list(ciphers)
                .map_err(|e| Error::Cipher(format!("{}: {}", ciphers, e)))?;
        }
        if config.prefer_server_ciphers() {
            builder.set_options(SslOptions::CIPHER_SERVER_PREFERENCE);
        }

        let dh = match config.dhparam() {
            Some(path) => {
                let pem = fs::read(path)
                    .map_err(|e| Error::DhParam(format!("{}: {}", path.display(), e)))?;
                Dh::params_from_pem(&pem)
                    .map_err(|e| Error::DhParam(format!("{}: {}", path.display(), e)))?
            }
            None => Dh::get_2048_256().map_err(|e| Error::DhParam(e.to_string()))?,
        };
        builder
            .set_tmp_dh(&dh)
            .map_err(|e| Error::DhParam(e.to_string()))?;

        if let Some(name) = config.ecdh_curve() {
            let nid =
                curve_nid(name).ok_or_else(|| Error::Curve(format!("Unknown curve: {}", name)))?;
            let key = EcKey::from_curve_name(nid)
                .map_err(|e| Error::Curve(format!("{}: {}", name, e)))?;
            builder
                .set_tmp_ecdh(&key)
                .map_err(|e| Error::Curve(format!("{}: {}", name, e)))?;
            builder.set_options(SslOptions::SINGLE_ECDH_USE);
        }

        if config.is_http() {
            builder
                .set_session_id_context(HTTP_SESSION_ID_CONTEXT)
                .map_err(|e| Error::Config(e.to_string()))?;
            builder.set_session_cache_mode(SslSessionCacheMode::SERVER);
            builder.set_session_cache_size(1);
        }

        let advertiser = Advertiser::for_http(config.is_http2());
        let server_protocols = advertiser;
        builder.set_alpn_select_callback(move |_, client| {
            server_protocols.select(client).ok_or(AlpnError::NOACK)
        });

        if !config.alpn_protocols().is_empty() {
            let wire = encode_protocols(config.alpn_protocols().iter().map(|p| p.as_bytes()));
            builder
                .set_alpn_protos(&wire)
                .map_err(|e| Error::Config(format!("ALPN protocols: {}", e)))?;
        }

        let cookies = if config.is_dtls() {
            let exchange = CookieExchange::new(CookieSecret::random());
            install_cookie_callbacks(&mut builder, runtime, &exchange);
            Some(exchange)
        } else {
            None
        };

        let mut context = ContextBuilder {
            builder,
            runtime: runtime.clone(),
            config: config.clone(),
            advertiser,
            cookies,
        };

        if config.verify_peer() {
            context.set_ca_path(config)?;
            context
                .builder
                .set_verify_callback(SslVerifyMode::PEER, |_ok, _ctx| true);
        }
        if let Some(ca_file) = config.client_ca_file() {
            context.set_client_verification(ca_file, config.verify_depth())?;
        }

        debug!("Context configured: {:?}", config);

        Ok(context)
    }

    /// Request and verify client certificates issued by the CAs in
    /// `ca_file`, which are also advertised to clients.
    pub fn set_client_verification(&mut self, ca_file: &Path, depth: u32) -> Result<(), Error> {
        let ca_err = |e: ErrorStack| Error::Ca(format!("{}: {}", ca_file.display(), e));

        // The trust decision is made after the handshake.
        self.builder
            .set_verify_callback(SslVerifyMode::PEER, |_ok, _ctx| true);
        if depth > 0 {
            self.builder.set_verify_depth(depth);
        }

        self.builder.set_ca_file(ca_file).map_err(ca_err)?;
        let names = X509Name::load_client_ca_file(ca_file).map_err(ca_err)?;
        self.builder.set_client_ca_list(names);

        Ok(())
    }

    /// Load the trust store from the configured CA file and/or directory,
    /// or the system default when neither is set.
    pub fn set_ca_path(&mut self, config: &Config) -> Result<(), Error> {
        let mut loaded = false;

        if let Some(file) = config.cafile() {
            self.builder
                .set_ca_file(file)
                .map_err(|e| Error::Ca(format!("{}: {}", file.display(), e)))?;
            loaded = true;
        }

        if let Some(dir) = config.capath() {
            if !dir.is_dir() {
                return Err(Error::Ca(format!("{}: not a directory", dir.display())));
            }
            let name = dir
                .to_str()
                .ok_or_else(|| Error::Ca(format!("{}: not valid UTF-8", dir.display())))?;
            self.builder
                .cert_store_mut()
                .add_lookup(X509Lookup::hash_dir())
                .and_then(|lookup| lookup.add_dir(name, SslFiletype::PEM))
                .map_err(|e| Error::Ca(format!("{}: {}", dir.display(), e)))?;
            loaded = true;
        }

        if !loaded {
            self.builder
                .set_default_verify_paths()
                .map_err(|e| Error::Ca(format!("Default trust store: {}", e)))?;
        }

        if config.verify_depth() > 0 {
            self.builder.set_verify_depth(config.verify_depth());
        }

        Ok(())
    }

    /// Freeze the context.
    pub fn build(self) -> Context {
        Context {
            ssl: self.builder.build(),
            runtime: self.runtime,
            config: Arc::new(self.config),
            advertiser: self.advertiser,
            cookies: self.cookies,
        }
    }
}

fn load_certificate(
    builder: &mut SslContextBuilder,
    cert: &Path,
    key: Option<&Path>,
    passphrase: Option<&[u8]>,
) -> Result<(), Error> {
    let cert_err = |what: &str, path: &Path, e: ErrorStack| {
        Error::Certificate(format!("{} {}: {}", what, path.display(), e))
    };

    builder
        .set_certificate_file(cert, SslFiletype::PEM)
        .map_err(|e| cert_err("certificate", cert, e))?;
    builder
        .set_certificate_chain_file(cert)
        .map_err(|e| cert_err("certificate chain", cert, e))?;

    let key_path = key.unwrap_or(cert);
    let key = load_private_key(key_path, passphrase)?;
    builder
        .set_private_key(&key)
        .map_err(|e| cert_err("private key", key_path, e))?;
    builder
        .check_private_key()
        .map_err(|e| cert_err("key mismatch for", cert, e))?;

    Ok(())
}

fn load_private_key(path: &Path, passphrase: Option<&[u8]>) -> Result<PKey<Private>, Error> {
    let pem = fs::read(path)
        .map_err(|e| Error::Certificate(format!("private key {}: {}", path.display(), e)))?;

    // Without a passphrase an encrypted key fails instead of prompting.
    let passphrase = passphrase.unwrap_or_default();
    PKey::private_key_from_pem_callback(&pem, |buf| Ok(copy_passphrase(passphrase, buf)))
        .map_err(|e| Error::Certificate(format!("private key {}: {}", path.display(), e)))
}

/// Copy `passphrase` into the backend's buffer, leaving room for a NUL.
///
/// Returns the number of bytes copied, 0 if it doesn't fit.
fn copy_passphrase(passphrase: &[u8], buf: &mut [u8]) -> usize {
    if passphrase.len() >= buf.len() {
        return 0;
    }
    buf[..passphrase.len()].copy_from_slice(passphrase);
    passphrase.len()
}

fn curve_nid(name: &str) -> Option<Nid> {
    CURVES
        .iter()
        .find(|(_, names)| names.iter().any(|n| n.eq_ignore_ascii_case(name)))
        .map(|(nid, _)| *nid)
}

fn install_cookie_callbacks(
    builder: &mut SslContextBuilder,
    runtime: &CryptoRuntime,
    exchange: &CookieExchange,
) {
    let tag_index = runtime.session_tag();

    builder.set_options(SslOptions::COOKIE_EXCHANGE);

    let generate = exchange.clone();
    builder.set_cookie_generate_cb(move |ssl, out| {
        let peer = ssl
            .ex_data(tag_index)
            .and_then(|tag| tag.peer())
            .ok_or_else(ErrorStack::get)?;
        Ok(generate.write_cookie(&peer, out))
    });

    let verify = exchange.clone();
    builder.set_cookie_verify_cb(move |ssl, cookie| {
        let Some(tag) = ssl.ex_data(tag_index) else {
            return false;
        };
        let Some(peer) = tag.peer() else {
            return false;
        };
        let ok = verify.verify(&peer, cookie);
        if !ok {
            debug!(
                target: crate::PEER_LOG,
                "Cookie mismatch from connection#{} peer {}",
                tag.id(),
                peer
            );
        }
        ok
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_fits() {
        let mut buf = [0u8; 8];
        assert_eq!(copy_passphrase(b"secret", &mut buf), 6);
        assert_eq!(&buf[..6], b"secret");
    }

    #[test]
    fn passphrase_needs_room_for_nul() {
        let mut buf = [0u8; 6];
        assert_eq!(copy_passphrase(b"secret", &mut buf), 0);
        let mut buf = [0u8; 7];
        assert_eq!(copy_passphrase(b"secret", &mut buf), 6);
    }

    #[test]
    fn curve_names() {
        assert_eq!(curve_nid("prime256v1"), Some(Nid::X9_62_PRIME256V1));
        assert_eq!(curve_nid("P-384"), Some(Nid::SECP384R1));
        assert_eq!(curve_nid("SECP521R1"), Some(Nid::SECP521R1));
        assert_eq!(curve_nid("curve0"), None);
    }

    #[test]
    fn bare_context() {
        let _ = env_logger::try_init();
        let runtime = CryptoRuntime::init().unwrap();
        let context = Context::new(&runtime, &Config::default()).unwrap();
        assert!(!context.is_dtls());
        assert!(context.cookie_exchange().is_none());
        assert_eq!(context.advertiser().wire(), b"\x08http/1.1");
    }

    #[test]
    fn dtls_context_has_cookies() {
        let runtime = CryptoRuntime::init().unwrap();
        let config = Config::builder().dtls(true).build().unwrap();
        let context = Context::new(&runtime, &config).unwrap();
        assert!(context.is_dtls());
        assert!(context.cookie_exchange().is_some());
    }

    #[test]
    fn unknown_curve() {
        let runtime = CryptoRuntime::init().unwrap();
        let config = Config::builder().ecdh_curve("curve0").build().unwrap();
        assert!(matches!(
            Context::new(&runtime, &config),
            Err(Error::Curve(_))
        ));
    }

    #[test]
    fn rejected_ciphers() {
        let runtime = CryptoRuntime::init().unwrap();
        let config = Config::builder().ciphers("NOT-A-CIPHER").build().unwrap();
        assert!(matches!(
            Context::new(&runtime, &config),
            Err(Error::Cipher(_))
        ));
    }
}
