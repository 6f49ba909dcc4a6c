//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex};

use crate::host::Host;
use crate::route::{Proxy, Route};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct RouteKey {
    host: Host<Arc<str>>,
    port: NonZeroU16,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl From<&Route> for RouteKey {
    fn from(route: &Route) -> Self {
        Self {
            host: route.address.host.clone(),
            port: route.address.port,
            proxy: route.proxy.clone(),
            socket_addr: route.socket_addr,
        }
    }
}

/// Record of routes that recently failed.
///
/// Such routes are postponed behind untried ones until a connection over them
/// succeeds again. Shared by every call made through the same client.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<RouteKey>>,
}

impl RouteDatabase {
    pub fn failed(&self, route: &Route) {
        self.lock().insert(route.into());
    }

    pub fn connected(&self, route: &Route) {
        self.lock().remove(&RouteKey::from(route));
    }

    pub fn should_postpone(&self, route: &Route) -> bool {
        self.lock().contains(&RouteKey::from(route))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<RouteKey>> {
        self.failed.lock().expect("not poisoned")
    }
}

#[cfg(test)]
mod test {
    use const_str::ip_addr;

    use super::*;
    use crate::testutil::http_address;

    #[test]
    fn failures_are_forgotten_after_success() {
        let route = Route {
            address: http_address("example.com"),
            proxy: Proxy::Direct,
            socket_addr: SocketAddr::new(ip_addr!("192.0.2.1"), 80),
        };
        let database = RouteDatabase::default();
        assert!(!database.should_postpone(&route));

        database.failed(&route);
        assert!(database.should_postpone(&route));

        let other = Route {
            socket_addr: SocketAddr::new(ip_addr!("192.0.2.2"), 80),
            ..route.clone()
        };
        assert!(!database.should_postpone(&other));

        database.connected(&route);
        assert!(!database.should_postpone(&route));
    }
}
