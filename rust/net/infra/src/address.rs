//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt::Debug;
use std::num::NonZeroU16;
use std::sync::Arc;

use nonzero_ext::nonzero;

use crate::host::Host;
use crate::route::{NoProxy, Proxy, ProxySelector};
use crate::tls::TlsConfig;
use crate::Protocol;

pub const DEFAULT_HTTP_PORT: NonZeroU16 = nonzero!(80u16);
pub const DEFAULT_HTTPS_PORT: NonZeroU16 = nonzero!(443u16);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> NonZeroU16 {
        match self {
            Scheme::Http => DEFAULT_HTTP_PORT,
            Scheme::Https => DEFAULT_HTTPS_PORT,
        }
    }
}

/// Everything needed to open a connection to an origin server.
///
/// Two addresses that differ only in their host may be able to share an
/// HTTP/2 connection (see [`Address::equals_non_host`]).
#[derive(Clone, Debug)]
pub struct Address {
    pub scheme: Scheme,
    pub host: Host<Arc<str>>,
    pub port: NonZeroU16,
    pub tls: Option<TlsConfig>,
    /// In order of preference.
    pub protocols: Vec<Protocol>,
    /// Overrides the proxy selector when present.
    pub proxy: Option<Proxy>,
    pub proxy_selector: Arc<dyn ProxySelector>,
}

impl Address {
    pub fn http(host: Host<Arc<str>>, port: NonZeroU16) -> Self {
        Self {
            scheme: Scheme::Http,
            host,
            port,
            tls: None,
            protocols: vec![Protocol::Http1_1],
            proxy: None,
            proxy_selector: Arc::new(NoProxy),
        }
    }

    pub fn https(host: Host<Arc<str>>, port: NonZeroU16, tls: TlsConfig) -> Self {
        Self {
            scheme: Scheme::Https,
            host,
            port,
            tls: Some(tls),
            protocols: vec![Protocol::Http2, Protocol::Http1_1],
            proxy: None,
            proxy_selector: Arc::new(NoProxy),
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Whether connections to `self` are interchangeable with connections to
    /// `other`, ignoring which host each was addressed to.
    pub fn equals_non_host(&self, other: &Address) -> bool {
        let Self {
            scheme,
            host: _,
            port,
            tls,
            protocols,
            proxy,
            proxy_selector,
        } = self;
        *scheme == other.scheme
            && *port == other.port
            && *tls == other.tls
            && *protocols == other.protocols
            && *proxy == other.proxy
            && std::ptr::addr_eq(
                Arc::as_ptr(proxy_selector),
                Arc::as_ptr(&other.proxy_selector),
            )
    }

    /// `scheme://host:port`, with nothing that isn't already in the URL.
    pub fn origin(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.equals_non_host(other)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{https_address, FakeTlsProvider};

    #[test]
    fn equals_non_host_ignores_only_the_host() {
        let tls = TlsConfig::new(Arc::new(FakeTlsProvider::default()));
        let a = https_address("a.example", tls.clone());
        let b = https_address("b.example", tls.clone());
        assert!(a.equals_non_host(&b));
        assert_ne!(a, b);

        let mut other_port = b.clone();
        other_port.port = nonzero!(8443u16);
        assert!(!a.equals_non_host(&other_port));

        let other_provider = https_address(
            "a.example",
            TlsConfig::new(Arc::new(FakeTlsProvider::default())),
        );
        assert!(!a.equals_non_host(&other_provider));

        let mut other_proxy = a.clone();
        other_proxy.proxy = Some(Proxy::Direct);
        assert!(!a.equals_non_host(&other_proxy));
    }

    #[test]
    fn origin_uses_url_form() {
        let address = Address::http(Host::Domain("example.com".into()), nonzero!(8080u16));
        assert_eq!(address.origin(), "http://example.com:8080");
    }
}
