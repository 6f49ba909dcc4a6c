//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Instant;

use crate::address::Address;
use crate::errors::LogSafeDisplay;
use crate::host::Host;
use crate::route::{Proxy, Route};
use crate::tls::{verify_hostname, Handshake};
use crate::{AsyncDuplexStream, CallId, Protocol};

/// Concurrent exchanges allowed on an HTTP/2 connection until the peer says
/// otherwise.
pub const DEFAULT_HTTP2_ALLOCATION_LIMIT: usize = 100;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection {}", self.0)
    }
}
impl LogSafeDisplay for ConnectionId {}

#[derive(Debug)]
struct ConnectionState {
    allocation_limit: usize,
    calls: Vec<CallId>,
    /// Once set, never cleared: no new exchanges may start on this connection.
    no_new_exchanges: bool,
    /// Once set, never cleared: the connection only serves its original host.
    no_coalesced_connections: bool,
    idle_at: Instant,
    success_count: u32,
    closed: bool,
}

/// An established connection, possibly shared between calls.
///
/// The allocation bookkeeping is only changed through the
/// [`ConnectionPool`](crate::pool::ConnectionPool), under its lock.
pub struct RealConnection {
    id: ConnectionId,
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    stream: tokio::sync::Mutex<Option<Box<dyn AsyncDuplexStream>>>,
    state: Mutex<ConnectionState>,
}

impl std::fmt::Debug for RealConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealConnection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RealConnection {
    pub fn new(
        route: Route,
        protocol: Protocol,
        handshake: Option<Handshake>,
        stream: Box<dyn AsyncDuplexStream>,
    ) -> Arc<Self> {
        let allocation_limit = if protocol.is_multiplexed() {
            DEFAULT_HTTP2_ALLOCATION_LIMIT
        } else {
            1
        };
        Arc::new(Self {
            id: ConnectionId::next(),
            route,
            protocol,
            handshake,
            stream: tokio::sync::Mutex::new(Some(stream)),
            state: Mutex::new(ConnectionState {
                allocation_limit,
                calls: Vec::new(),
                no_new_exchanges: false,
                no_coalesced_connections: false,
                idle_at: Instant::now(),
                success_count: 0,
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.protocol.is_multiplexed()
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().expect("not poisoned")
    }

    /// Applies the peer's concurrent stream limit (HTTP/2 only).
    pub(crate) fn set_allocation_limit(&self, limit: usize) {
        if self.is_multiplexed() {
            self.state().allocation_limit = limit.max(1);
        }
    }

    pub fn allocation_limit(&self) -> usize {
        self.state().allocation_limit
    }

    pub fn allocation_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn calls(&self) -> Vec<CallId> {
        self.state().calls.clone()
    }

    pub(crate) fn add_call(&self, call: CallId) {
        self.state().calls.push(call);
    }

    /// Returns true if that was the last allocation.
    pub(crate) fn remove_call(&self, call: CallId, now: Instant) -> bool {
        let mut state = self.state();
        let Some(index) = state.calls.iter().position(|c| *c == call) else {
            return false;
        };
        state.calls.swap_remove(index);
        if state.calls.is_empty() {
            state.idle_at = now;
            true
        } else {
            false
        }
    }

    pub fn idle_at(&self) -> Instant {
        self.state().idle_at
    }

    pub fn no_new_exchanges(&self) -> bool {
        self.state().no_new_exchanges
    }

    pub fn set_no_new_exchanges(&self) {
        self.state().no_new_exchanges = true;
    }

    /// Stop using this connection for hosts other than the one it was opened for.
    pub fn set_no_coalesced_connections(&self) {
        self.state().no_coalesced_connections = true;
    }

    pub fn success_count(&self) -> u32 {
        self.state().success_count
    }

    pub fn increment_success_count(&self) {
        self.state().success_count += 1;
    }

    /// Whether a new exchange for `address` may be carried by this connection.
    ///
    /// A connection to a different host can still be used if it is HTTP/2, its
    /// remote IP is among `routes` (the candidates for `address`), and its
    /// certificate is valid and pinned for the new host.
    pub fn is_eligible(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        {
            let state = self.state();
            if state.closed
                || state.no_new_exchanges
                || state.calls.len() >= state.allocation_limit
            {
                return false;
            }
        }

        if !self.route.address.equals_non_host(address) {
            return false;
        }
        if address.host == self.route.address.host {
            return true;
        }

        // From here on, we're coalescing.
        if !self.is_multiplexed() {
            return false;
        }
        let Some(routes) = routes else {
            return false;
        };
        if !self.route_matches_any(routes) {
            return false;
        }
        let Some(tls) = &address.tls else {
            return false;
        };
        if !tls.hostname_verifier.is_default() {
            return false;
        }
        if !self.supports_host(address.host.as_deref()) {
            return false;
        }
        let Some(handshake) = &self.handshake else {
            return false;
        };
        tls.certificate_pinner
            .check(address.host.as_deref(), &handshake.peer_certificates)
            .is_ok()
    }

    fn route_matches_any(&self, candidates: &[Route]) -> bool {
        candidates.iter().any(|candidate| {
            candidate.proxy == Proxy::Direct
                && self.route.proxy == Proxy::Direct
                && candidate.socket_addr == self.route.socket_addr
        })
    }

    fn supports_host(&self, host: Host<&str>) -> bool {
        if host == self.route.address.host.as_deref() {
            return true;
        }
        if self.state().no_coalesced_connections {
            return false;
        }
        self.handshake
            .as_ref()
            .and_then(|handshake| handshake.peer_certificates.first())
            .is_some_and(|leaf| verify_hostname(host, leaf))
    }

    /// Whether the connection looks usable.
    ///
    /// With `extensive`, an idle HTTP/1 connection's socket is probed with a
    /// non-blocking read: end-of-stream, an error, or unsolicited bytes all
    /// mean the connection can't carry another exchange.
    pub fn is_healthy(&self, extensive: bool) -> bool {
        if self.state().closed {
            return false;
        }
        if !extensive || self.is_multiplexed() {
            return true;
        }
        let Ok(mut stream) = self.stream.try_lock() else {
            // An exchange is using it right now.
            return true;
        };
        let Some(stream) = stream.as_mut() else {
            return false;
        };

        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        match Pin::new(stream).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(())) => false,
            Poll::Ready(Err(_)) => false,
        }
    }

    /// Exclusive access to the socket for one exchange at a time.
    ///
    /// Yields `None` once the connection has been closed.
    pub async fn lock_stream(
        &self,
    ) -> tokio::sync::MutexGuard<'_, Option<Box<dyn AsyncDuplexStream>>> {
        let mut guard = self.stream.lock().await;
        if self.is_closed() {
            guard.take();
        }
        guard
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Marks the connection closed and drops the socket unless an exchange
    /// currently holds it, in which case it is dropped when that exchange next
    /// asks for it.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.no_new_exchanges = true;
        }
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use const_str::ip_addr;
    use tokio::io::AsyncWriteExt as _;

    use super::*;
    use crate::testutil::{fake_certificate, fake_handshake, https_address, FakeTlsProvider};
    use crate::tls::TlsConfig;

    fn h2_connection(
        tls: &TlsConfig,
        host: &str,
        sans: &[&str],
    ) -> (Arc<RealConnection>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64);
        let route = Route {
            address: https_address(host, tls.clone()),
            proxy: Proxy::Direct,
            socket_addr: SocketAddr::new(ip_addr!("192.0.2.1"), 443),
        };
        let handshake = fake_handshake(vec![fake_certificate(sans)]);
        (
            RealConnection::new(route, Protocol::Http2, Some(handshake), Box::new(client)),
            server,
        )
    }

    #[test]
    fn coalesces_only_for_covered_hosts_with_matching_routes() {
        let tls = TlsConfig::new(Arc::new(FakeTlsProvider::default()));
        let (connection, _server) =
            h2_connection(&tls, "a.example", &["a.example", "b.example"]);

        let b = https_address("b.example", tls.clone());
        let same_ip = [Route {
            address: b.clone(),
            proxy: Proxy::Direct,
            socket_addr: SocketAddr::new(ip_addr!("192.0.2.1"), 443),
        }];
        let other_ip = [Route {
            socket_addr: SocketAddr::new(ip_addr!("192.0.2.2"), 443),
            ..same_ip[0].clone()
        }];

        assert!(connection.is_eligible(&https_address("a.example", tls.clone()), None));
        assert!(connection.is_eligible(&b, Some(&same_ip)));
        assert!(!connection.is_eligible(&b, None));
        assert!(!connection.is_eligible(&b, Some(&other_ip)));
        assert!(!connection.is_eligible(&https_address("c.example", tls.clone()), Some(&same_ip)));

        connection.set_no_coalesced_connections();
        assert!(!connection.is_eligible(&b, Some(&same_ip)));
    }

    #[test]
    fn allocation_limit_and_no_new_exchanges_block_eligibility() {
        let tls = TlsConfig::new(Arc::new(FakeTlsProvider::default()));
        let (connection, _server) = h2_connection(&tls, "a.example", &["a.example"]);
        let address = https_address("a.example", tls);

        connection.set_allocation_limit(1);
        connection.add_call(CallId::next());
        assert!(!connection.is_eligible(&address, None));

        connection.set_allocation_limit(2);
        assert!(connection.is_eligible(&address, None));

        connection.set_no_new_exchanges();
        assert!(!connection.is_eligible(&address, None));
    }

    #[tokio::test]
    async fn extensive_health_check_detects_peer_close_and_stray_bytes() {
        let tls = TlsConfig::new(Arc::new(FakeTlsProvider::default()));
        let route = Route {
            address: https_address("a.example", tls),
            proxy: Proxy::Direct,
            socket_addr: SocketAddr::new(ip_addr!("192.0.2.1"), 443),
        };

        let (client, server) = tokio::io::duplex(64);
        let connection =
            RealConnection::new(route.clone(), Protocol::Http1_1, None, Box::new(client));
        assert!(connection.is_healthy(true));
        drop(server);
        assert!(connection.is_healthy(false));
        assert!(!connection.is_healthy(true));

        let (client, mut server) = tokio::io::duplex(64);
        let connection = RealConnection::new(route, Protocol::Http1_1, None, Box::new(client));
        server.write_all(b"x").await.expect("can write");
        assert!(!connection.is_healthy(true));

        connection.close();
        assert!(!connection.is_healthy(false));
        assert!(connection.lock_stream().await.is_none());
    }
}
