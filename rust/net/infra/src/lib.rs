//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Connection acquisition for HTTP clients.
//!
//! This crate turns an [`Address`] into a live, pooled [`RealConnection`]:
//! routes are produced lazily from proxies and DNS, connect attempts are raced
//! with a staggered start, and finished connections are shared (and coalesced
//! across hostnames where HTTP/2 and the certificate allow it) through a
//! [`ConnectionPool`].
//!
//! [`Address`]: address::Address
//! [`RealConnection`]: connection::RealConnection
//! [`ConnectionPool`]: pool::ConnectionPool

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::LogSafeDisplay;
use crate::host::Host;

pub mod address;
pub mod connection;
pub mod dns;
pub mod errors;
pub mod events;
pub mod host;
pub mod pool;
pub mod route;
pub mod timeouts;
pub mod tls;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum IpType {
    V4 = 1,
    V6 = 2,
}

impl IpType {
    pub fn from_host<S>(host: &Host<S>) -> Option<Self> {
        match host {
            Host::Domain(_) => None,
            Host::Ip(ip) => Some(ip.into()),
        }
    }
}

impl From<&IpAddr> for IpType {
    fn from(value: &IpAddr) -> Self {
        match value {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl LogSafeDisplay for IpType {}
impl std::fmt::Display for IpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Source for the result of a hostname lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DnsSource {
    /// The result came from performing a DNS query using a system resolver.
    SystemLookup,
    /// The result was resolved from a preconfigured static entry.
    Static,
    /// Test-only value
    #[cfg(any(test, feature = "test-util"))]
    Test,
}

/// Application protocol spoken over an established connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, strum::Display, strum::EnumString)]
pub enum Protocol {
    #[strum(serialize = "http/1.1")]
    Http1_1,
    #[strum(serialize = "h2")]
    Http2,
}

impl Protocol {
    /// The ALPN identifier offered during the TLS handshake.
    pub fn alpn(&self) -> &'static [u8] {
        match self {
            Protocol::Http1_1 => b"http/1.1",
            Protocol::Http2 => b"h2",
        }
    }

    /// Whether more than one exchange can be carried at once.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Protocol::Http2)
    }
}

impl LogSafeDisplay for Protocol {}

/// Identifies one logical request/response exchange (including its retries).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Tag prefixed to log lines about this call.
    pub fn log_tag(&self) -> String {
        format!("[call {}]", self.0)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call {}", self.0)
    }
}

impl LogSafeDisplay for CallId {}

pub trait AsyncDuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplexStream for S {}

/// Something guarded by a lock that callbacks must never observe as held.
///
/// Event listeners run outside of the pool and dispatcher locks; tests use this
/// to assert that.
pub trait LockProbe: Send + Sync {
    fn is_lock_held_by_current_thread(&self) -> bool;
}
