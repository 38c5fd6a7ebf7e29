//! DTLS stateless cookies.
//!
//! A server answers a ClientHello without (or with a wrong) cookie by a
//! HelloVerifyRequest carrying `cookie = trunc(HMAC(secret, port ‖ address))`.
//! The client must echo it from the same source address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use tinyvec::ArrayVec;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Length of the secret a cookie is keyed with.
pub const COOKIE_SECRET_LEN: usize = 32;

/// Length of a generated cookie (one HMAC-SHA256 output).
pub const MAX_COOKIE_LEN: usize = 32;

/// A generated cookie.
pub type Cookie = ArrayVec<[u8; MAX_COOKIE_LEN]>;

/// Key material for cookies, scoped to one listener.
pub struct CookieSecret([u8; COOKIE_SECRET_LEN]);

impl CookieSecret {
    /// Fresh secret from the OS random source.
    pub fn random() -> Self {
        let mut secret = [0u8; COOKIE_SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        CookieSecret(secret)
    }

    /// Secret from caller-provided bytes, e.g. shared between workers.
    pub fn from_bytes(secret: [u8; COOKIE_SECRET_LEN]) -> Self {
        CookieSecret(secret)
    }
}

impl Drop for CookieSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for CookieSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieSecret(***)")
    }
}

/// Generates and verifies cookies for one listener.
#[derive(Debug, Clone)]
pub struct CookieExchange {
    secret: Arc<CookieSecret>,
}

impl CookieExchange {
    pub fn new(secret: CookieSecret) -> Self {
        CookieExchange {
            secret: Arc::new(secret),
        }
    }

    /// Cookie for `peer`.
    pub fn generate(&self, peer: &SocketAddr) -> Cookie {
        self.generate_bounded(peer, MAX_COOKIE_LEN)
    }

    /// Cookie for `peer`, truncated to at most `limit` bytes.
    pub fn generate_bounded(&self, peer: &SocketAddr, limit: usize) -> Cookie {
        let mut cookie = Cookie::new();
        if let Some(mac) = self.mac(peer) {
            let tag = mac.finalize().into_bytes();
            let len = tag.len().min(limit).min(MAX_COOKIE_LEN);
            cookie.extend_from_slice(&tag[..len]);
        }
        cookie
    }

    /// Whether `cookie` is exactly what [`generate`](Self::generate) gives
    /// for `peer`.
    pub fn verify(&self, peer: &SocketAddr, cookie: &[u8]) -> bool {
        if cookie.len() != MAX_COOKIE_LEN {
            return false;
        }
        match self.mac(peer) {
            Some(mac) => mac.verify_slice(cookie).is_ok(),
            None => false,
        }
    }

    /// Write a cookie into a backend supplied buffer, returning its length.
    pub(crate) fn write_cookie(&self, peer: &SocketAddr, out: &mut [u8]) -> usize {
        let cookie = self.generate_bounded(peer, out.len());
        out[..cookie.len()].copy_from_slice(&cookie);
        cookie.len()
    }

    fn mac(&self, peer: &SocketAddr) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret.0).ok()?;
        mac.update(&peer_bytes(peer));
        Some(mac)
    }
}

/// Port (network order) followed by the address octets.
fn peer_bytes(peer: &SocketAddr) -> ArrayVec<[u8; 18]> {
    let mut out = ArrayVec::new();
    out.extend_from_slice(&peer.port().to_be_bytes());
    match peer.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(seed: u8) -> CookieExchange {
        CookieExchange::new(CookieSecret::from_bytes([seed; COOKIE_SECRET_LEN]))
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn same_peer_same_cookie() {
        let x = exchange(1);
        let peer = addr("192.0.2.7:4433");
        assert_eq!(x.generate(&peer), x.generate(&peer));
        assert_eq!(x.generate(&peer).len(), MAX_COOKIE_LEN);
    }

    #[test]
    fn verify_own_cookie() {
        let x = exchange(1);
        let peer = addr("[2001:db8::1]:5000");
        let cookie = x.generate(&peer);
        assert!(x.verify(&peer, &cookie));
    }

    #[test]
    fn any_single_byte_mutation_fails() {
        let x = exchange(1);
        let peer = addr("192.0.2.7:4433");
        let cookie = x.generate(&peer);
        for i in 0..cookie.len() {
            let mut bad = cookie.clone();
            bad[i] ^= 0x01;
            assert!(!x.verify(&peer, &bad), "mutation at {} accepted", i);
        }
    }

    #[test]
    fn other_address_or_port_fails() {
        let x = exchange(1);
        let cookie = x.generate(&addr("192.0.2.7:4433"));
        assert!(!x.verify(&addr("192.0.2.8:4433"), &cookie));
        assert!(!x.verify(&addr("192.0.2.7:4434"), &cookie));
    }

    #[test]
    fn other_secret_fails() {
        let peer = addr("192.0.2.7:4433");
        let cookie = exchange(1).generate(&peer);
        assert!(!exchange(2).verify(&peer, &cookie));
    }

    #[test]
    fn truncated_or_extended_fails() {
        let x = exchange(1);
        let peer = addr("192.0.2.7:4433");
        let cookie = x.generate(&peer);
        assert!(!x.verify(&peer, &cookie[..MAX_COOKIE_LEN - 1]));
        let mut longer = cookie.to_vec();
        longer.push(0);
        assert!(!x.verify(&peer, &longer));
        assert!(!x.verify(&peer, &[]));
    }

    #[test]
    fn bounded_by_buffer() {
        let x = exchange(1);
        let peer = addr("192.0.2.7:4433");
        let mut small = [0u8; 16];
        assert_eq!(x.write_cookie(&peer, &mut small), 16);
        assert_eq!(&small[..], &x.generate(&peer)[..16]);

        let mut large = [0u8; 255];
        assert_eq!(x.write_cookie(&peer, &mut large), MAX_COOKIE_LEN);
    }

    #[test]
    fn random_secrets_differ() {
        let peer = addr("192.0.2.7:4433");
        let a = CookieExchange::new(CookieSecret::random()).generate(&peer);
        let b = CookieExchange::new(CookieSecret::random()).generate(&peer);
        assert_ne!(a, b);
    }
}
