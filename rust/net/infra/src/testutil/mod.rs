//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::address::{Address, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use crate::connection::ConnectionId;
use crate::dns::{LookupResult, StaticResolver};
use crate::errors::TransportConnectError;
use crate::events::EventListener;
use crate::host::Host;
use crate::pool::ConnectionPool;
use crate::route::{ConnectContext, Route, RouteDatabase};
use crate::timeouts::CONNECT_TIMEOUT;
use crate::tls::{Certificate, CipherSuite, Handshake, TlsConfig, TlsVersion};
use crate::transport::SocketConnector;
use crate::{CallId, DnsSource, LockProbe, Protocol};

mod fake_transport;
pub use fake_transport::{FakeBehavior, FakeSocketConnector, FakeTlsProvider};

pub fn http_address(host: &str) -> Address {
    Address::http(Host::parse_as_ip_or_domain(host), DEFAULT_HTTP_PORT)
}

pub fn https_address(host: &str, tls: TlsConfig) -> Address {
    Address::https(Host::parse_as_ip_or_domain(host), DEFAULT_HTTPS_PORT, tls)
}

/// A certificate for the given names; entries that parse as IPs become IP
/// SANs.
pub fn fake_certificate(sans: &[&str]) -> Certificate {
    let (ip_addresses, dns_names) = sans.iter().fold(
        (Vec::new(), Vec::new()),
        |(mut ips, mut names), san| {
            match san.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                Err(_) => names.push(Arc::from(*san)),
            }
            (ips, names)
        },
    );
    Certificate {
        dns_names,
        ip_addresses,
        public_key_sha256: [0xAB; 32],
    }
}

pub fn fake_handshake(peer_certificates: Vec<Certificate>) -> Handshake {
    Handshake {
        tls_version: TlsVersion::Tls1_3,
        cipher_suite: CipherSuite("TLS_AES_128_GCM_SHA256".into()),
        peer_certificates,
    }
}

pub fn static_resolver(entries: &[(&str, &[IpAddr])]) -> Arc<StaticResolver> {
    Arc::new(
        entries
            .iter()
            .fold(StaticResolver::default(), |resolver, (host, ips)| {
                resolver.with_entry(
                    *host,
                    LookupResult::from_ips(DnsSource::Test, ips.iter().copied()),
                )
            }),
    )
}

/// A context for a fresh call with its own pool and route database.
///
/// The pool's lock is registered with the listener so that any event emitted
/// while it is held fails the test.
pub fn test_context(
    socket_connector: Arc<dyn SocketConnector>,
    listener: Arc<RecordingEventListener>,
) -> ConnectContext {
    let pool = ConnectionPool::default();
    listener.forbid_lock(Arc::new(pool.clone()));
    ConnectContext {
        call: CallId::next(),
        pool,
        route_database: Arc::new(RouteDatabase::default()),
        socket_connector,
        listener,
        connect_timeout: CONNECT_TIMEOUT,
        cancel: CancellationToken::new(),
    }
}

/// Everything an [`EventListener`] can be told, as data.
#[derive(Clone, Debug, strum::IntoStaticStr)]
pub enum CallEvent {
    CallStart { call: CallId },
    CallEnd { call: CallId },
    CallFailed { call: CallId, message: String },
    Canceled { call: CallId },
    DnsStart { call: CallId, hostname: String },
    DnsEnd { call: CallId, hostname: String, result: LookupResult },
    ConnectStart { call: CallId, route: Route },
    SecureConnectStart { call: CallId },
    SecureConnectEnd { call: CallId, handshake: Option<Handshake> },
    ConnectEnd { call: CallId, route: Route, protocol: Protocol },
    ConnectFailed { call: CallId, route: Route, error: TransportConnectError },
    ConnectionAcquired { call: CallId, connection: ConnectionId },
    ConnectionReleased { call: CallId, connection: ConnectionId },
    CacheHit { call: CallId },
    CacheMiss { call: CallId },
    CacheConditionalHit { call: CallId },
    SatisfactionFailure { call: CallId },
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// [`EventListener`] that keeps every event it is given.
///
/// Panics if an event arrives while any lock registered with
/// [`forbid_lock`](Self::forbid_lock) is held by the emitting thread.
#[derive(Default)]
pub struct RecordingEventListener {
    events: Mutex<Vec<CallEvent>>,
    forbidden_locks: Mutex<Vec<Arc<dyn LockProbe>>>,
}

impl std::fmt::Debug for RecordingEventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingEventListener")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl RecordingEventListener {
    pub fn forbid_lock(&self, lock: Arc<dyn LockProbe>) {
        self.forbidden_locks
            .lock()
            .expect("not poisoned")
            .push(lock);
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<CallEvent> {
        std::mem::take(&mut *self.events.lock().expect("not poisoned"))
    }

    pub fn take_names(&self) -> Vec<&'static str> {
        self.take().iter().map(CallEvent::name).collect()
    }

    fn record(&self, event: CallEvent) {
        for lock in self.forbidden_locks.lock().expect("not poisoned").iter() {
            assert!(
                !lock.is_lock_held_by_current_thread(),
                "{} emitted while holding a forbidden lock",
                event.name()
            );
        }
        self.events.lock().expect("not poisoned").push(event);
    }
}

impl EventListener for RecordingEventListener {
    fn call_start(&self, call: CallId) {
        self.record(CallEvent::CallStart { call })
    }
    fn call_end(&self, call: CallId) {
        self.record(CallEvent::CallEnd { call })
    }
    fn call_failed(&self, call: CallId, error: &dyn std::fmt::Display) {
        self.record(CallEvent::CallFailed {
            call,
            message: error.to_string(),
        })
    }
    fn canceled(&self, call: CallId) {
        self.record(CallEvent::Canceled { call })
    }
    fn dns_start(&self, call: CallId, hostname: &str) {
        self.record(CallEvent::DnsStart {
            call,
            hostname: hostname.to_owned(),
        })
    }
    fn dns_end(&self, call: CallId, hostname: &str, result: &LookupResult) {
        self.record(CallEvent::DnsEnd {
            call,
            hostname: hostname.to_owned(),
            result: result.clone(),
        })
    }
    fn connect_start(&self, call: CallId, route: &Route) {
        self.record(CallEvent::ConnectStart {
            call,
            route: route.clone(),
        })
    }
    fn secure_connect_start(&self, call: CallId) {
        self.record(CallEvent::SecureConnectStart { call })
    }
    fn secure_connect_end(&self, call: CallId, handshake: Option<&Handshake>) {
        self.record(CallEvent::SecureConnectEnd {
            call,
            handshake: handshake.cloned(),
        })
    }
    fn connect_end(&self, call: CallId, route: &Route, protocol: Protocol) {
        self.record(CallEvent::ConnectEnd {
            call,
            route: route.clone(),
            protocol,
        })
    }
    fn connect_failed(&self, call: CallId, route: &Route, error: &TransportConnectError) {
        self.record(CallEvent::ConnectFailed {
            call,
            route: route.clone(),
            error: error.clone(),
        })
    }
    fn connection_acquired(&self, call: CallId, connection: ConnectionId) {
        self.record(CallEvent::ConnectionAcquired { call, connection })
    }
    fn connection_released(&self, call: CallId, connection: ConnectionId) {
        self.record(CallEvent::ConnectionReleased { call, connection })
    }
    fn cache_hit(&self, call: CallId) {
        self.record(CallEvent::CacheHit { call })
    }
    fn cache_miss(&self, call: CallId) {
        self.record(CallEvent::CacheMiss { call })
    }
    fn cache_conditional_hit(&self, call: CallId) {
        self.record(CallEvent::CacheConditionalHit { call })
    }
    fn satisfaction_failure(&self, call: CallId) {
        self.record(CallEvent::SatisfactionFailure { call })
    }
}
