//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::address::Address;
use crate::dns::{DnsError, Resolver};
use crate::errors::TransportConnectError;
use crate::events::EventListener;
use crate::host::Host;
use crate::route::{Proxy, Route, RouteDatabase};
use crate::CallId;

/// Produces the routes to an address lazily, one proxy at a time.
///
/// For each proxy the target host (the origin for direct connections, the
/// proxy otherwise) is resolved and every resulting socket address becomes a
/// route, IPv6 and IPv4 interleaved. Routes that failed recently are held
/// back until everything else has been offered.
pub struct RouteSelector {
    address: Address,
    resolver: Arc<dyn Resolver>,
    route_database: Arc<RouteDatabase>,
    listener: Arc<dyn EventListener>,
    call: CallId,
    proxies: VecDeque<Proxy>,
    selection: Arc<[Route]>,
    pending: VecDeque<Route>,
    postponed: Vec<Route>,
}

impl RouteSelector {
    pub fn new(
        address: Address,
        resolver: Arc<dyn Resolver>,
        route_database: Arc<RouteDatabase>,
        listener: Arc<dyn EventListener>,
        call: CallId,
    ) -> Self {
        let mut proxies: VecDeque<Proxy> = match &address.proxy {
            Some(proxy) => [proxy.clone()].into(),
            None => address.proxy_selector.select(&address).into(),
        };
        if proxies.is_empty() {
            proxies.push_back(Proxy::Direct);
        }
        Self {
            address,
            resolver,
            route_database,
            listener,
            call,
            proxies,
            selection: Arc::new([]),
            pending: VecDeque::new(),
            postponed: Vec::new(),
        }
    }

    pub fn has_next(&self) -> bool {
        !self.pending.is_empty() || !self.proxies.is_empty() || !self.postponed.is_empty()
    }

    /// The next route to try, along with all the routes it was selected with.
    ///
    /// Returns `Ok(None)` once every route has been offered. A resolution
    /// failure is only reported if there is no other proxy left to try.
    pub async fn next_route(
        &mut self,
    ) -> Result<Option<(Route, Arc<[Route]>)>, TransportConnectError> {
        loop {
            if let Some(route) = self.pending.pop_front() {
                return Ok(Some((route, self.selection.clone())));
            }

            if let Some(proxy) = self.proxies.pop_front() {
                match self.resolve(&proxy).await {
                    Ok(routes) => {
                        let (postponed, fresh): (Vec<_>, Vec<_>) = routes
                            .iter()
                            .cloned()
                            .partition(|route| self.route_database.should_postpone(route));
                        self.selection = routes.into();
                        self.pending = fresh.into();
                        self.postponed.extend(postponed);
                    }
                    Err(error) => {
                        self.address.proxy_selector.connect_failed(&self.address, &proxy);
                        if self.proxies.is_empty() && self.postponed.is_empty() {
                            return Err(error);
                        }
                        log::info!(
                            "{} no routes through a proxy: {error}",
                            self.call.log_tag()
                        );
                    }
                }
                continue;
            }

            if !self.postponed.is_empty() {
                let postponed = std::mem::take(&mut self.postponed);
                self.selection = postponed.clone().into();
                self.pending = postponed.into();
                continue;
            }

            return Ok(None);
        }
    }

    async fn resolve(&self, proxy: &Proxy) -> Result<Vec<Route>, TransportConnectError> {
        let (host, port) = match proxy {
            Proxy::Direct => (&self.address.host, self.address.port),
            Proxy::Http { host, port } => (host, *port),
        };

        let ips: Vec<IpAddr> = match host {
            Host::Ip(ip) => vec![*ip],
            Host::Domain(name) => {
                self.listener.dns_start(self.call, name);
                let result = self.resolver.lookup_ip(name).await?;
                self.listener.dns_end(self.call, name, &result);
                result.iter().collect()
            }
        };
        if ips.is_empty() {
            return Err(DnsError::NoData.into());
        }

        Ok(ips
            .into_iter()
            .map(|ip| Route {
                address: self.address.clone(),
                proxy: proxy.clone(),
                socket_addr: SocketAddr::new(ip, port.get()),
            })
            .collect())
    }
}
