//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::address::Address;
use crate::connection::RealConnection;
use crate::route::Route;
use crate::utils::TrackedMutex;
use crate::{timeouts, CallId, LockProbe};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections beyond this count are closed, oldest idle first.
    pub max_idle_connections: usize,
    /// Idle connections are closed after this long.
    pub keep_alive: Duration,
}

pub const SUGGESTED_POOL_CONFIG: PoolConfig = PoolConfig {
    max_idle_connections: timeouts::POOL_MAX_IDLE_CONNECTIONS,
    keep_alive: timeouts::POOL_KEEP_ALIVE,
};

impl Default for PoolConfig {
    fn default() -> Self {
        SUGGESTED_POOL_CONFIG
    }
}

/// Live connections, shared by all calls of a client.
///
/// Cloning produces another handle to the same pool. Connections are closed
/// outside the pool lock, and the pool never calls into listeners.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    connections: TrackedMutex<Vec<Arc<RealConnection>>>,
    cleanup_running: AtomicBool,
    cleanup_wakeup: Notify,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(SUGGESTED_POOL_CONFIG)
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connections: TrackedMutex::new(Vec::new()),
                cleanup_running: AtomicBool::new(false),
                cleanup_wakeup: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Finds a connection that can carry an exchange for `address` and
    /// allocates it to `call`.
    ///
    /// Pass `routes` (the candidate routes for `address`) to allow coalescing
    /// onto an HTTP/2 connection opened for a different host. Connections that
    /// fail the health check are retired and the search continues.
    pub fn acquire(
        &self,
        address: &Address,
        call: CallId,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
        do_extensive_health_checks: bool,
    ) -> Option<Arc<RealConnection>> {
        loop {
            let candidate = {
                let connections = self.inner.connections.lock();
                let found = connections
                    .iter()
                    .find(|connection| {
                        (!require_multiplexed || connection.is_multiplexed())
                            && connection.is_eligible(address, routes)
                    })
                    .cloned();
                if let Some(connection) = &found {
                    connection.add_call(call);
                }
                found
            }?;

            if candidate.is_healthy(do_extensive_health_checks) {
                return Some(candidate);
            }

            log::info!(
                "{} {} failed its health check, retiring it",
                call.log_tag(),
                candidate.id()
            );
            candidate.set_no_new_exchanges();
            self.release(&candidate, call);
        }
    }

    /// Adds a newly established connection, allocated to `call` if given.
    pub fn put(&self, connection: Arc<RealConnection>, call: Option<CallId>) {
        let mut connections = self.inner.connections.lock();
        if let Some(call) = call {
            connection.add_call(call);
        }
        connections.push(connection);
        self.ensure_cleanup_scheduled(&connections);
    }

    /// Applies the peer's limit on concurrent exchanges to `connection`.
    pub fn set_allocation_limit(&self, connection: &RealConnection, limit: usize) {
        let _connections = self.inner.connections.lock();
        connection.set_allocation_limit(limit);
    }

    /// Removes `call`'s allocation of `connection`.
    ///
    /// A connection that becomes idle is closed right away if it can't take new
    /// exchanges or if the pool keeps no idle connections. Returns whether the
    /// connection was closed.
    pub fn release(&self, connection: &Arc<RealConnection>, call: CallId) -> bool {
        let to_close = {
            let mut connections = self.inner.connections.lock();
            if !connection.remove_call(call, Instant::now()) {
                return false;
            }
            if connection.no_new_exchanges() || self.inner.config.max_idle_connections == 0 {
                connections.retain(|c| !Arc::ptr_eq(c, connection));
                true
            } else {
                self.inner.cleanup_wakeup.notify_one();
                false
            }
        };
        if to_close {
            connection.close();
        }
        to_close
    }

    /// Performs one round of eviction.
    ///
    /// Closes at most one idle connection that has been idle too long or
    /// exceeds the idle limit. Returns how long until the next round is due,
    /// or `None` if the pool is empty.
    pub fn cleanup(&self, now: Instant) -> Option<Duration> {
        let (to_close, next_run) = {
            let mut connections = self.inner.connections.lock();
            let result = self.inner.cleanup_locked(&mut connections, now);
            if result.1.is_none() {
                self.inner.cleanup_running.store(false, Ordering::Relaxed);
            }
            result
        };
        if let Some(connection) = to_close {
            log::debug!("closing idle {}", connection.id());
            connection.close();
        }
        next_run
    }

    /// Closes every idle connection. Connections in use are left alone.
    pub fn evict_all(&self) {
        let evicted = {
            let mut connections = self.inner.connections.lock();
            let (idle, in_use) = std::mem::take(&mut *connections)
                .into_iter()
                .partition::<Vec<_>, _>(|c| c.allocation_count() == 0);
            *connections = in_use;
            idle
        };
        for connection in evicted {
            connection.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.allocation_count() == 0)
            .count()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn connections(&self) -> Vec<Arc<RealConnection>> {
        self.inner.connections.lock().clone()
    }

    fn ensure_cleanup_scheduled(&self, _locked: &[Arc<RealConnection>]) {
        if self.inner.cleanup_running.swap(true, Ordering::Relaxed) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup_loop(Arc::downgrade(&self.inner)));
            }
            Err(_) => {
                log::warn!("no runtime for the connection pool's cleanup task");
                self.inner.cleanup_running.store(false, Ordering::Relaxed);
            }
        }
    }
}

impl LockProbe for ConnectionPool {
    fn is_lock_held_by_current_thread(&self) -> bool {
        self.inner.connections.is_held_by_current_thread()
    }
}

impl PoolInner {
    fn cleanup_locked(
        &self,
        connections: &mut Vec<Arc<RealConnection>>,
        now: Instant,
    ) -> (Option<Arc<RealConnection>>, Option<Duration>) {
        let mut in_use_count = 0;
        let mut idle_count = 0;
        let mut longest_idle: Option<(usize, Duration)> = None;

        for (index, connection) in connections.iter().enumerate() {
            if connection.allocation_count() > 0 {
                in_use_count += 1;
                continue;
            }
            idle_count += 1;
            let idle_for = now.saturating_duration_since(connection.idle_at());
            if longest_idle.is_none_or(|(_, longest)| idle_for > longest) {
                longest_idle = Some((index, idle_for));
            }
        }

        let PoolConfig {
            max_idle_connections,
            keep_alive,
        } = self.config;

        match longest_idle {
            Some((index, idle_for))
                if idle_for >= keep_alive || idle_count > max_idle_connections =>
            {
                let connection = connections.remove(index);
                connection.set_no_new_exchanges();
                (Some(connection), Some(Duration::ZERO))
            }
            Some((_, idle_for)) => (None, Some(keep_alive - idle_for)),
            None if in_use_count > 0 => (None, Some(keep_alive)),
            None => (None, None),
        }
    }
}

async fn cleanup_loop(pool: Weak<PoolInner>) {
    loop {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        let pool = ConnectionPool { inner };
        let Some(delay) = pool.cleanup(Instant::now()) else {
            return;
        };
        if delay.is_zero() {
            continue;
        }
        let wakeup = pool.inner.cleanup_wakeup.notified();
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = wakeup => {}
        }
    }
}
