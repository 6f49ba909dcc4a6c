//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! TLS configuration and the summary of a completed handshake.
//!
//! The handshake itself is performed by an injected [`TlsProvider`]; this
//! module only decides what to ask for and whether to accept what came back.

use std::fmt::Debug;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};

use crate::errors::{LogSafeDisplay, TlsFailure, TransportConnectError};
use crate::host::Host;
use crate::{AsyncDuplexStream, Protocol};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, strum::Display, strum::EnumString)]
pub enum TlsVersion {
    #[strum(serialize = "TLSv1.2")]
    Tls1_2,
    #[strum(serialize = "TLSv1.3")]
    Tls1_3,
}
impl LogSafeDisplay for TlsVersion {}

/// Name of a negotiated cipher suite, kept verbatim.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CipherSuite(pub Arc<str>);

impl std::fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl LogSafeDisplay for CipherSuite {}

/// The parts of a verified peer certificate that matter after the handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Certificate {
    pub dns_names: Vec<Arc<str>>,
    pub ip_addresses: Vec<IpAddr>,
    /// SHA-256 of the DER-encoded SubjectPublicKeyInfo.
    pub public_key_sha256: [u8; 32],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Handshake {
    pub tls_version: TlsVersion,
    pub cipher_suite: CipherSuite,
    /// Leaf first.
    pub peer_certificates: Vec<Certificate>,
}

/// Returns whether `certificate` is valid for `host`.
///
/// IP hosts must appear among the certificate's IP addresses. Domain hosts
/// must match one of its DNS names, where a name of the form `*.example.com`
/// matches exactly one additional leftmost label.
pub fn verify_hostname(host: Host<&str>, certificate: &Certificate) -> bool {
    match host {
        Host::Ip(ip) => certificate.ip_addresses.contains(&ip),
        Host::Domain(domain) => {
            let domain = normalize_domain(domain);
            certificate
                .dns_names
                .iter()
                .any(|pattern| domain_matches_pattern(&domain, pattern))
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

fn domain_matches_pattern(domain: &str, pattern: &str) -> bool {
    if domain.is_empty() || domain.starts_with('.') || domain.contains("..") {
        return false;
    }
    let pattern = normalize_domain(pattern);
    if pattern.is_empty() || pattern.starts_with('.') || pattern.contains("..") {
        return false;
    }
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return !pattern.contains('*') && domain == pattern;
    };
    // Wildcards are only allowed as the whole leftmost label and never for a
    // bare top-level domain.
    if suffix.contains('*') || !suffix.contains('.') {
        return false;
    }
    match domain.strip_suffix(suffix) {
        Some(prefix) => prefix
            .strip_suffix('.')
            .is_some_and(|label| !label.is_empty() && !label.contains('.')),
        None => false,
    }
}

/// A custom hostname check supplied by the application.
pub trait VerifyHostname: Debug + Send + Sync {
    fn verify(&self, host: Host<&str>, handshake: &Handshake) -> bool;
}

#[derive(Clone, Debug, Default)]
pub enum HostnameVerifier {
    /// [`verify_hostname`] against the leaf certificate.
    #[default]
    Default,
    Custom(Arc<dyn VerifyHostname>),
}

impl HostnameVerifier {
    pub fn verify(&self, host: Host<&str>, handshake: &Handshake) -> bool {
        match self {
            HostnameVerifier::Default => handshake
                .peer_certificates
                .first()
                .is_some_and(|leaf| verify_hostname(host, leaf)),
            HostnameVerifier::Custom(custom) => custom.verify(host, handshake),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, HostnameVerifier::Default)
    }
}

impl PartialEq for HostnameVerifier {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Default, Self::Default) => true,
            (Self::Custom(a), Self::Custom(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum InvalidPin {
    /// pins must start with "sha256/"
    UnsupportedAlgorithm,
    /// pin hash is not a base64-encoded SHA-256 digest
    InvalidHash,
    /// pin pattern is not a valid host pattern
    InvalidPattern,
}

/// A public key pin for hosts matching `pattern`.
///
/// Patterns are either an exact hostname, `*.example.com` (exactly one extra
/// label), or `**.example.com` (any number of extra labels, including none).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pin {
    pattern: Arc<str>,
    sha256: [u8; 32],
}

impl Pin {
    pub fn new(pattern: &str, pin: &str) -> Result<Self, InvalidPin> {
        let hash = pin
            .strip_prefix("sha256/")
            .ok_or(InvalidPin::UnsupportedAlgorithm)?;
        let sha256 = BASE64_STANDARD
            .decode(hash)
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .ok_or(InvalidPin::InvalidHash)?;

        let pattern = normalize_domain(pattern);
        let bare = pattern
            .strip_prefix("**.")
            .or_else(|| pattern.strip_prefix("*."))
            .unwrap_or(&pattern);
        if bare.is_empty() || bare.contains('*') {
            return Err(InvalidPin::InvalidPattern);
        }
        Ok(Self {
            pattern: pattern.into(),
            sha256,
        })
    }

    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize_domain(host);
        if let Some(suffix) = self.pattern.strip_prefix("**.") {
            host == suffix
                || host
                    .strip_suffix(suffix)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        } else if let Some(suffix) = self.pattern.strip_prefix("*.") {
            host.strip_suffix(suffix)
                .and_then(|prefix| prefix.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.'))
        } else {
            host == *self.pattern
        }
    }
}

/// Constrains which public keys are trusted for which hosts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CertificatePinner {
    pins: Vec<Pin>,
}

impl CertificatePinner {
    pub fn new(pins: Vec<Pin>) -> Self {
        Self { pins }
    }

    /// Fails if `host` has pins and none of them matches a certificate in the
    /// chain. Hosts without pins (including IP hosts) always pass.
    pub fn check(
        &self,
        host: Host<&str>,
        peer_certificates: &[Certificate],
    ) -> Result<(), TransportConnectError> {
        let Host::Domain(domain) = host else {
            return Ok(());
        };
        let mut matching = self
            .pins
            .iter()
            .filter(|pin| pin.matches_host(domain))
            .peekable();
        if matching.peek().is_none() {
            return Ok(());
        }
        let pinned = matching.any(|pin| {
            peer_certificates
                .iter()
                .any(|cert| cert.public_key_sha256 == pin.sha256)
        });
        if pinned {
            Ok(())
        } else {
            Err(TransportConnectError::CertificatePinningFailure)
        }
    }
}

/// TLS versions to offer in one handshake attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionSpec {
    pub name: &'static str,
    pub tls_versions: &'static [TlsVersion],
}

impl ConnectionSpec {
    pub const MODERN_TLS: Self = Self {
        name: "modern",
        tls_versions: &[TlsVersion::Tls1_3, TlsVersion::Tls1_2],
    };
    pub const COMPATIBLE_TLS: Self = Self {
        name: "compatible",
        tls_versions: &[TlsVersion::Tls1_2],
    };
}

/// What to ask for in a handshake.
#[derive(Clone, Debug)]
pub struct TlsParams<'a> {
    pub sni: Host<&'a str>,
    pub spec: &'a ConnectionSpec,
    pub alpn: &'a [Protocol],
}

/// A socket after a successful handshake.
pub struct TlsStream {
    pub stream: Box<dyn AsyncDuplexStream>,
    pub handshake: Handshake,
    pub negotiated_protocol: Option<Protocol>,
}

impl Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("handshake", &self.handshake)
            .field("negotiated_protocol", &self.negotiated_protocol)
            .finish_non_exhaustive()
    }
}

/// Performs TLS handshakes over already-connected sockets.
///
/// Implementations verify the certificate chain against their trust roots;
/// hostname verification and pinning are applied afterwards by the caller.
#[async_trait]
pub trait TlsProvider: Debug + Send + Sync {
    async fn handshake(
        &self,
        stream: Box<dyn AsyncDuplexStream>,
        params: TlsParams<'_>,
    ) -> Result<TlsStream, TlsFailure>;
}

#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub provider: Arc<dyn TlsProvider>,
    pub hostname_verifier: HostnameVerifier,
    pub certificate_pinner: CertificatePinner,
    /// Tried in order; later entries are fallbacks after a negotiation failure.
    pub connection_specs: Vec<ConnectionSpec>,
}

impl TlsConfig {
    pub fn new(provider: Arc<dyn TlsProvider>) -> Self {
        Self {
            provider,
            hostname_verifier: HostnameVerifier::Default,
            certificate_pinner: CertificatePinner::default(),
            connection_specs: vec![ConnectionSpec::MODERN_TLS, ConnectionSpec::COMPATIBLE_TLS],
        }
    }
}

impl PartialEq for TlsConfig {
    fn eq(&self, other: &Self) -> bool {
        let Self {
            provider,
            hostname_verifier,
            certificate_pinner,
            connection_specs,
        } = self;
        std::ptr::addr_eq(Arc::as_ptr(provider), Arc::as_ptr(&other.provider))
            && *hostname_verifier == other.hostname_verifier
            && *certificate_pinner == other.certificate_pinner
            && *connection_specs == other.connection_specs
    }
}

impl FromStr for CipherSuite {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.into()))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use const_str::ip_addr;
    use test_case::test_case;

    use super::*;

    fn cert(names: &[&str]) -> Certificate {
        Certificate {
            dns_names: names.iter().map(|n| Arc::from(*n)).collect(),
            ip_addresses: vec![ip_addr!("192.0.2.7")],
            public_key_sha256: [7; 32],
        }
    }

    #[test_case("example.com", &["example.com"], true; "exact")]
    #[test_case("EXAMPLE.com.", &["example.com"], true; "case and root label")]
    #[test_case("a.example.com", &["*.example.com"], true; "wildcard")]
    #[test_case("a.b.example.com", &["*.example.com"], false; "wildcard spans one label")]
    #[test_case("example.com", &["*.example.com"], false; "wildcard needs a label")]
    #[test_case("example.com", &["*.com"], false; "no tld wildcard")]
    #[test_case("other.org", &["example.com", "other.org"], true; "any san")]
    fn hostname_verification(host: &str, names: &[&str], expected: bool) {
        assert_eq!(verify_hostname(Host::Domain(host), &cert(names)), expected);
    }

    #[test]
    fn ip_hosts_match_ip_sans() {
        let cert = cert(&["example.com"]);
        assert!(verify_hostname(Host::Ip(ip_addr!("192.0.2.7")), &cert));
        assert!(!verify_hostname(Host::Ip(ip_addr!("192.0.2.8")), &cert));
    }

    #[test_case("**.example.com", "example.com", true)]
    #[test_case("**.example.com", "a.b.example.com", true)]
    #[test_case("*.example.com", "a.example.com", true)]
    #[test_case("*.example.com", "a.b.example.com", false)]
    #[test_case("example.com", "www.example.com", false)]
    fn pin_patterns(pattern: &str, host: &str, expected: bool) {
        let pin = Pin::new(pattern, &format!("sha256/{}", BASE64_STANDARD.encode([0; 32])))
            .expect("valid");
        assert_eq!(pin.matches_host(host), expected);
    }

    #[test]
    fn pinner_requires_a_matching_key() {
        let good = Pin::new(
            "example.com",
            &format!("sha256/{}", BASE64_STANDARD.encode([7; 32])),
        )
        .expect("valid");
        let bad = Pin::new(
            "example.com",
            &format!("sha256/{}", BASE64_STANDARD.encode([9; 32])),
        )
        .expect("valid");
        let chain = [cert(&["example.com"])];

        assert_matches!(
            CertificatePinner::new(vec![good.clone()]).check(Host::Domain("example.com"), &chain),
            Ok(())
        );
        assert_matches!(
            CertificatePinner::new(vec![bad.clone()]).check(Host::Domain("example.com"), &chain),
            Err(TransportConnectError::CertificatePinningFailure)
        );
        assert_matches!(
            CertificatePinner::new(vec![bad]).check(Host::Domain("unpinned.com"), &chain),
            Ok(())
        );
    }

    #[test]
    fn invalid_pins_are_rejected() {
        assert_eq!(
            Pin::new("example.com", "sha1/AAAA"),
            Err(InvalidPin::UnsupportedAlgorithm)
        );
        assert_eq!(
            Pin::new("example.com", "sha256/AAAA"),
            Err(InvalidPin::InvalidHash)
        );
    }
}
