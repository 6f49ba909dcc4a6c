//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A single request/response exchange, from admission to the cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use http::StatusCode;
use tether_net_infra::address::Address;
use tether_net_infra::connection::RealConnection;
use tether_net_infra::errors::{ConnectError, LogSafeDisplay};
use tether_net_infra::events::EventListener;
use tether_net_infra::pool::ConnectionPool;
use tether_net_infra::route::{
    ConnectContext, FastFallbackFinder, FoundConnection, RoutePlanner, SequentialFinder,
};
use tether_net_infra::timeouts::MAX_CONNECTION_FAILURE_RETRIES;
use tether_net_infra::CallId;
use tokio_util::sync::CancellationToken;

use crate::cache::{invalidates_cache, is_cacheable, CacheStrategy};
use crate::client::Client;
use crate::dispatcher::{AsyncJob, DispatchError, JobId, JobInfo};
use crate::exchange::ExchangeError;
use crate::http::{Request, Response, ResponseSource};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum CallError {
    /// {0}
    Connect(ConnectError),
    /// {0}
    Exchange(ExchangeError),
    /// {0}
    Dispatch(DispatchError),
    /// the call was cancelled
    Cancelled,
    /// the call timed out
    TimedOut,
    /// the call was already executed
    AlreadyExecuted,
    /// invalid request: {0}
    InvalidRequest(&'static str),
}
impl LogSafeDisplay for CallError {}

impl From<DispatchError> for CallError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Cancelled => Self::Cancelled,
            DispatchError::Rejected => Self::Dispatch(value),
        }
    }
}

impl From<ConnectError> for CallError {
    fn from(value: ConnectError) -> Self {
        if value.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Connect(value)
    }
}

pub type Callback = Box<dyn FnOnce(Result<Response, CallError>) + Send>;

/// A request that has been prepared for execution.
///
/// A call runs at most once, through either [`execute`](Self::execute) or
/// [`enqueue`](Self::enqueue). Cloning gives another handle to the same call,
/// which is how a call is cancelled from elsewhere.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

struct CallInner {
    client: Client,
    request: Request,
    id: CallId,
    listener: Arc<dyn EventListener>,
    cancel: CancellationToken,
    executed: AtomicBool,
    canceled: AtomicBool,
    finished: AtomicBool,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("url", &self.inner.request.url)
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A connection allocated to a call; dropping it gives the allocation back.
struct ConnectionLease {
    connection: Arc<RealConnection>,
    reused: bool,
    pool: ConnectionPool,
    call: CallId,
    listener: Arc<dyn EventListener>,
    /// Set when the allocation moved to the route planner instead.
    handed_back: bool,
}

impl ConnectionLease {
    /// Ends the exchange but keeps the allocation, for the planner to reuse or
    /// release.
    fn hand_back(mut self) -> Arc<RealConnection> {
        self.handed_back = true;
        self.connection.clone()
    }

    /// Whether the connection was opened for a different host than `address`.
    fn is_coalesced(&self, address: &Address) -> bool {
        self.connection.route().address.host != address.host
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.handed_back {
            self.pool.release(&self.connection, self.call);
        }
        self.listener
            .connection_released(self.call, self.connection.id());
    }
}

impl Call {
    pub(crate) fn new(client: Client, request: Request) -> Self {
        let id = CallId::next();
        let listener = (client.inner().listener_factory)(id);
        Self {
            inner: Arc::new(CallInner {
                client,
                request,
                id,
                listener,
                cancel: CancellationToken::new(),
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancels the call wherever it is: waiting for admission, connecting, or
    /// exchanging. Does nothing once the call has completed or after the first
    /// time.
    pub fn cancel(&self) {
        if self.inner.finished.load(Ordering::SeqCst)
            || self.inner.canceled.swap(true, Ordering::SeqCst)
        {
            return;
        }
        log::info!("{} cancelled", self.inner.id.log_tag());
        self.inner.cancel.cancel();
        self.inner.listener.canceled(self.inner.id);
    }

    /// Runs the call, waiting for the dispatcher to admit it first.
    pub async fn execute(&self) -> Result<Response, CallError> {
        self.start()?;
        let result = self
            .inner
            .client
            .dispatcher()
            .execute(self.job_info(), self.run())
            .await
            .unwrap_or_else(|e| Err(e.into()));
        self.finish(result)
    }

    /// Hands the call to the dispatcher; `callback` gets the outcome.
    pub fn enqueue(
        &self,
        callback: impl FnOnce(Result<Response, CallError>) + Send + 'static,
    ) -> Result<JobId, CallError> {
        self.start()?;
        Ok(self.inner.client.dispatcher().enqueue(Box::new(CallJob {
            call: self.clone(),
            callback: Box::new(callback),
        })))
    }

    fn start(&self) -> Result<(), CallError> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyExecuted);
        }
        log::debug!(
            "{} {} {}",
            self.inner.id.log_tag(),
            self.inner.request.method,
            self.inner.request.url
        );
        self.inner.listener.call_start(self.inner.id);
        Ok(())
    }

    fn finish(&self, result: Result<Response, CallError>) -> Result<Response, CallError> {
        self.inner.finished.store(true, Ordering::SeqCst);
        let CallInner { id, listener, .. } = &*self.inner;
        match &result {
            Ok(response) => {
                log::debug!("{} {} ({})", id.log_tag(), response.status, response.source);
                listener.call_end(*id);
            }
            Err(error) => {
                log::info!("{} failed: {error}", id.log_tag());
                listener.call_failed(*id, error);
            }
        }
        result
    }

    fn job_info(&self) -> JobInfo {
        JobInfo {
            tag: self.inner.request.url.to_string(),
            host: self.inner.request.host().to_owned(),
            websocket: false,
            cancel: self.inner.cancel.clone(),
        }
    }

    /// Everything after admission, bounded by cancellation and the call
    /// timeout.
    async fn run(&self) -> Result<Response, CallError> {
        let cancel = &self.inner.cancel;
        let work = async {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(CallError::Cancelled),
                result = self.run_with_cache() => result,
            }
        };
        match self.inner.client.connect_config().call_timeout {
            None => work.await,
            Some(timeout) => match tokio::time::timeout(timeout, work).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(CallError::TimedOut)
                }
            },
        }
    }

    async fn run_with_cache(&self) -> Result<Response, CallError> {
        let CallInner {
            client,
            request,
            id,
            listener,
            ..
        } = &*self.inner;
        let cache = client.cache();

        let candidate = cache.and_then(|cache| cache.get(request));
        let strategy = CacheStrategy::compute(Utc::now(), request, candidate);
        if let Some(cache) = cache {
            cache.track_response(&strategy);
        }

        let CacheStrategy {
            network_request,
            cache_response,
        } = strategy;
        let (network_request, cache_response) = match (network_request, cache_response) {
            (None, None) => {
                listener.satisfaction_failure(*id);
                return Ok(Response::unsatisfiable(request.clone()));
            }
            (None, Some(cached)) => {
                listener.cache_hit(*id);
                return Ok(cached);
            }
            (Some(network_request), cached) => {
                if cached.is_some() {
                    listener.cache_conditional_hit(*id);
                } else if cache.is_some() {
                    listener.cache_miss(*id);
                }
                (network_request, cached)
            }
        };

        let network = self.run_network(&network_request).await?;

        let Some(cache) = cache else {
            return Ok(network);
        };
        if let Some(cached) = cache_response {
            if network.status == StatusCode::NOT_MODIFIED {
                let merged = cache.update(&cached, &network);
                cache.track_conditional_cache_hit();
                listener.cache_hit(*id);
                return Ok(merged);
            }
        }
        if is_cacheable(&network, request) {
            cache.put(&network);
        } else if invalidates_cache(&request.method) {
            cache.invalidate_for(&request.method, &request.url);
        }
        Ok(network)
    }

    /// Sends `request` over a pooled or new connection.
    ///
    /// A reused connection that turns out to be dead is replaced, and a
    /// `421 Misdirected Request` on a coalesced connection is retried once on a
    /// connection of the request's own host. Retries keep the call's planner,
    /// so routes it deferred are tried before resolving again.
    async fn run_network(&self, request: &Request) -> Result<Response, CallError> {
        let CallInner { client, id, .. } = &*self.inner;
        let address = client.address(&request.url)?;
        let retry_enabled = client.connect_config().retry_on_connection_failure;
        let mut planner = self.route_planner(&address, request);

        let mut retries = 0;
        let mut retried_misdirected = false;
        loop {
            let lease = self.acquire_connection(&mut planner).await?;
            let sent_request_at = Utc::now();
            let error = match client
                .inner()
                .codec
                .exchange(&lease.connection, request)
                .await
            {
                Ok(network) => {
                    if let Some(limit) = network.max_concurrent_streams {
                        lease.pool.set_allocation_limit(&lease.connection, limit);
                    }
                    if network.status == StatusCode::MISDIRECTED_REQUEST
                        && lease.is_coalesced(&address)
                        && !retried_misdirected
                    {
                        retried_misdirected = true;
                        log::info!(
                            "{} {} is misdirected for {}, no longer coalescing onto it",
                            id.log_tag(),
                            lease.connection.id(),
                            address.host
                        );
                        lease.connection.set_no_coalesced_connections();
                        planner.set_call_connection(lease.hand_back());
                        continue;
                    }
                    lease.connection.increment_success_count();
                    return Ok(Response {
                        request: self.inner.request.clone(),
                        protocol: lease.connection.protocol(),
                        status: network.status,
                        headers: network.headers,
                        body: network.body,
                        handshake: lease.connection.handshake().cloned(),
                        sent_request_at,
                        received_response_at: Utc::now(),
                        source: ResponseSource::Network,
                    });
                }
                Err(error) => error,
            };

            if !error.is_connection_failure() {
                return Err(CallError::Exchange(error));
            }
            lease.connection.set_no_new_exchanges();
            if !lease.reused || !retry_enabled || retries >= MAX_CONNECTION_FAILURE_RETRIES {
                return Err(CallError::Exchange(error));
            }
            retries += 1;
            log::info!(
                "{} reused {} failed ({error}), retrying on another connection",
                id.log_tag(),
                lease.connection.id()
            );
            planner.set_call_connection(lease.hand_back());
        }
    }

    fn route_planner(&self, address: &Address, request: &Request) -> RoutePlanner {
        let CallInner {
            client,
            id,
            listener,
            cancel,
            ..
        } = &*self.inner;
        let inner = client.inner();
        let config = client.connect_config();

        let ctx = ConnectContext {
            call: *id,
            pool: inner.pool.clone(),
            route_database: inner.route_database.clone(),
            socket_connector: inner.socket_connector.clone(),
            listener: listener.clone(),
            connect_timeout: config.connect_timeout,
            cancel: cancel.child_token(),
        };
        let extensive_health_checks = request.method != http::Method::GET;
        RoutePlanner::new(
            ctx,
            address.clone(),
            inner.resolver.clone(),
            extensive_health_checks,
        )
    }

    async fn acquire_connection(
        &self,
        planner: &mut RoutePlanner,
    ) -> Result<ConnectionLease, CallError> {
        let CallInner {
            client, id, listener, ..
        } = &*self.inner;
        let config = client.connect_config();

        let FoundConnection { connection, reused } = if config.fast_fallback {
            FastFallbackFinder::new(planner, config.fast_fallback_stagger)
                .find()
                .await?
        } else {
            SequentialFinder::new(planner).find().await?
        };

        listener.connection_acquired(*id, connection.id());
        Ok(ConnectionLease {
            connection,
            reused,
            pool: client.inner().pool.clone(),
            call: *id,
            listener: listener.clone(),
            handed_back: false,
        })
    }
}

struct CallJob {
    call: Call,
    callback: Callback,
}

impl AsyncJob for CallJob {
    fn info(&self) -> JobInfo {
        self.call.job_info()
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Self { call, callback } = *self;
        async move {
            let result = call.run().await;
            callback(call.finish(result));
        }
        .boxed()
    }

    fn reject(self: Box<Self>, error: DispatchError) {
        let Self { call, callback } = *self;
        callback(call.finish(Err(error.into())));
    }
}
