//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use crate::connection::ConnectionId;
use crate::dns::LookupResult;
use crate::errors::TransportConnectError;
use crate::route::Route;
use crate::tls::Handshake;
use crate::{CallId, Protocol};

/// Observer of a call's progress.
///
/// Every method has an empty default so implementations only override what
/// they need. Callbacks are never invoked while the connection pool's or the
/// dispatcher's lock is held, so implementations may call back into either.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn call_start(&self, call: CallId) {}
    fn call_end(&self, call: CallId) {}
    fn call_failed(&self, call: CallId, error: &dyn std::fmt::Display) {}
    fn canceled(&self, call: CallId) {}

    fn dns_start(&self, call: CallId, hostname: &str) {}
    fn dns_end(&self, call: CallId, hostname: &str, result: &LookupResult) {}

    fn connect_start(&self, call: CallId, route: &Route) {}
    fn secure_connect_start(&self, call: CallId) {}
    fn secure_connect_end(&self, call: CallId, handshake: Option<&Handshake>) {}
    fn connect_end(&self, call: CallId, route: &Route, protocol: Protocol) {}
    fn connect_failed(&self, call: CallId, route: &Route, error: &TransportConnectError) {}

    fn connection_acquired(&self, call: CallId, connection: ConnectionId) {}
    fn connection_released(&self, call: CallId, connection: ConnectionId) {}

    fn cache_hit(&self, call: CallId) {}
    fn cache_miss(&self, call: CallId) {}
    fn cache_conditional_hit(&self, call: CallId) {}
    fn satisfaction_failure(&self, call: CallId) {}
}

#[derive(Copy, Clone, Debug, Default)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {}
