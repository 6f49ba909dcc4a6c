//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Routes, and the machinery for turning them into connections.
//!
//! A [`Route`] is one concrete way of reaching an [`Address`]: which proxy (if
//! any) to go through and which socket address to dial. The
//! [`RouteSelector`] produces routes lazily, the [`RoutePlanner`] turns them
//! (or already-open connections) into plans, and the finders
//! ([`FastFallbackFinder`], [`SequentialFinder`]) execute those plans until
//! one yields a connection.

use std::net::SocketAddr;
use std::time::Duration;

use crate::address::Address;
use crate::errors::LogSafeDisplay;
use crate::{timeouts, IpType};

mod database;
mod fast_fallback;
mod plan;
mod planner;
mod proxy;
mod selector;
mod sequential;

pub use database::RouteDatabase;
pub use fast_fallback::FastFallbackFinder;
pub use plan::{ConnectContext, ConnectPlan, ConnectResult, Plan, ReusePlan};
pub use planner::RoutePlanner;
pub use proxy::{NoProxy, Proxy, ProxySelector};
pub use selector::RouteSelector;
pub use sequential::SequentialFinder;

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub address: Address,
    pub proxy: Proxy,
    /// The socket address dialed: the origin server for direct routes,
    /// otherwise the proxy.
    pub socket_addr: SocketAddr,
}

impl Route {
    /// HTTPS through an HTTP proxy needs a CONNECT tunnel before TLS.
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_https() && matches!(self.proxy, Proxy::Http { .. })
    }

    pub fn ip_type(&self) -> IpType {
        IpType::from(&self.socket_addr.ip())
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.proxy {
            Proxy::Direct => "direct",
            Proxy::Http { .. } => "http proxy",
        };
        write!(f, "{kind} route over {}", self.ip_type())
    }
}
impl LogSafeDisplay for Route {}

/// A connection that has been found for a call.
#[derive(Clone, Debug)]
pub struct FoundConnection {
    pub connection: std::sync::Arc<crate::connection::RealConnection>,
    /// Whether the connection carried exchanges before this call got it.
    pub reused: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Race routes against each other instead of trying them one at a time.
    pub fast_fallback: bool,
    /// Delay between starting successive racing attempts.
    pub fast_fallback_stagger: Duration,
    /// Limit for each TCP connect and each TLS handshake.
    pub connect_timeout: Duration,
    /// Limit for a whole call, from admission to the end of the response.
    pub call_timeout: Option<Duration>,
    /// Retry a call whose reused connection turned out to be dead.
    pub retry_on_connection_failure: bool,
}

pub const SUGGESTED_CONNECT_CONFIG: ConnectConfig = ConnectConfig {
    fast_fallback: true,
    fast_fallback_stagger: timeouts::FAST_FALLBACK_STAGGER,
    connect_timeout: timeouts::CONNECT_TIMEOUT,
    call_timeout: None,
    retry_on_connection_failure: true,
};

impl Default for ConnectConfig {
    fn default() -> Self {
        SUGGESTED_CONNECT_CONFIG
    }
}
