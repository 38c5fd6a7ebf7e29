//! Peer trust decisions and host name matching (RFC 6125 / RFC 2818).

use der::asn1::ObjectIdentifier;
use der::{Any, Decode, Tag, Tagged};
use openssl::x509::X509VerifyResult;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::Certificate;

use crate::{Error, PEER_LOG};

const SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

// X509_V_OK / X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT
const VERIFY_OK: i32 = 0;
const VERIFY_DEPTH_ZERO_SELF_SIGNED: i32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trust {
    Trusted,
    SelfSigned,
    Untrusted,
}

fn classify(code: i32) -> Trust {
    match code {
        VERIFY_OK => Trust::Trusted,
        VERIFY_DEPTH_ZERO_SELF_SIGNED => Trust::SelfSigned,
        _ => Trust::Untrusted,
    }
}

/// Turn the chain verification result of connection `id` into a decision.
pub(crate) fn check_trust(
    result: X509VerifyResult,
    allow_self_signed: bool,
    id: u64,
) -> Result<(), Error> {
    let code = result.as_raw();
    match classify(code) {
        Trust::Trusted => Ok(()),
        Trust::SelfSigned if allow_self_signed => Ok(()),
        Trust::SelfSigned => {
            info!(
                target: PEER_LOG,
                "self signed certificate from connection#{} is not allowed", id
            );
            Err(Error::VerifyFailed(format!(
                "self signed certificate from connection#{}",
                id
            )))
        }
        Trust::Untrusted => {
            let reason = result.error_string();
            info!(
                target: PEER_LOG,
                "could not verify peer from connection#{} with error#{}: {}", id, code, reason
            );
            Err(Error::VerifyFailed(format!(
                "connection#{} error#{}: {}",
                id, code, reason
            )))
        }
    }
}

/// A peer certificate with the names used for host matching.
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    der: Vec<u8>,
    dns_names: Vec<String>,
    common_names: Vec<String>,
}

impl PeerCertificate {
    /// Parse a DER encoded X.509 certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let cert =
            Certificate::from_der(der).map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        let tbs = &cert.tbs_certificate;

        let mut dns_names = Vec::new();
        for ext in tbs.extensions.iter().flatten() {
            if ext.extn_id != SUBJECT_ALT_NAME {
                continue;
            }
            let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                .map_err(|e| Error::InvalidCertificate(format!("subjectAltName: {}", e)))?;
            for name in san.0 {
                if let GeneralName::DnsName(dns) = name {
                    dns_names.push(dns.to_string());
                }
            }
        }

        let common_names = tbs
            .subject
            .0
            .iter()
            .flat_map(|rdn| rdn.0.iter())
            .filter(|atv| atv.oid == COMMON_NAME)
            .filter_map(|atv| attribute_text(&atv.value))
            .collect();

        Ok(PeerCertificate {
            der: der.to_vec(),
            dns_names,
            common_names,
        })
    }

    /// The certificate as presented, DER encoded.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DNS entries of the subjectAltName extension.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Every commonName in the subject.
    pub fn common_names(&self) -> &[String] {
        &self.common_names
    }

    /// Whether the certificate is valid for `host`.
    ///
    /// SAN DNS entries win; only when there are none are the subject's
    /// commonNames considered, all of them rather than just the most
    /// specific one.
    pub fn matches_host(&self, host: &str) -> bool {
        if !self.dns_names.is_empty() {
            let found = self.dns_names.iter().any(|p| match_name(host, p));
            trace!(
                "subjectAltName {}: {}",
                if found { "match" } else { "no match" },
                host
            );
            return found;
        }

        let found = self.common_names.iter().any(|p| match_name(host, p));
        trace!(
            "commonName {}: {}",
            if found { "match" } else { "no match" },
            host
        );
        found
    }
}

fn attribute_text(value: &Any) -> Option<String> {
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String | Tag::TeletexString => {
            std::str::from_utf8(value.value()).ok().map(str::to_owned)
        }
        _ => None,
    }
}

/// Compare `host` with a certificate name `pattern`, ignoring case.
///
/// A `*.` pattern covers exactly one leftmost label: `*.example.com`
/// matches `www.example.com` but neither `example.com` nor
/// `a.b.example.com`.
pub fn match_name(host: &str, pattern: &str) -> bool {
    if host.eq_ignore_ascii_case(pattern) {
        return true;
    }

    if pattern.len() > 2 && pattern.starts_with("*.") {
        // Both keep their leading dot.
        let rest = &pattern[1..];
        // The wildcard stands for one non-empty label.
        let Some(dot) = host.find('.').filter(|&dot| dot > 0) else {
            return false;
        };
        return host[dot..].eq_ignore_ascii_case(rest);
    }

    false
}
