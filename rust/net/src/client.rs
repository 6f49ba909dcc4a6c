//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::num::NonZeroU16;
use std::sync::Arc;

use http::Uri;
use tether_net_infra::address::Address;
use tether_net_infra::dns::{Resolver, SystemResolver};
use tether_net_infra::events::{EventListener, NoopEventListener};
use tether_net_infra::host::Host;
use tether_net_infra::pool::ConnectionPool;
use tether_net_infra::route::{ConnectConfig, NoProxy, Proxy, ProxySelector, RouteDatabase};
use tether_net_infra::tls::TlsConfig;
use tether_net_infra::transport::{SocketConnector, TokioSocketConnector};
use tether_net_infra::CallId;

use crate::cache::Cache;
use crate::call::{Call, CallError};
use crate::dispatcher::{Dispatcher, TokioExecutor};
use crate::exchange::ExchangeCodec;
use crate::http::Request;

/// Makes a listener for each new call.
pub type EventListenerFactory = Arc<dyn Fn(CallId) -> Arc<dyn EventListener> + Send + Sync>;

/// Everything calls made by one client share.
///
/// Cloning is cheap; clones share the dispatcher, pool and cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) pool: ConnectionPool,
    pub(crate) cache: Option<Arc<Cache>>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) proxy_selector: Arc<dyn ProxySelector>,
    pub(crate) socket_connector: Arc<dyn SocketConnector>,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) connect_config: ConnectConfig,
    pub(crate) route_database: Arc<RouteDatabase>,
    pub(crate) codec: Arc<dyn ExchangeCodec>,
    pub(crate) listener_factory: EventListenerFactory,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("dispatcher", &self.inner.dispatcher)
            .field("cache", &self.inner.cache)
            .field("connect_config", &self.inner.connect_config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(codec: Arc<dyn ExchangeCodec>) -> ClientBuilder {
        ClientBuilder::new(codec)
    }

    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.inner.cache.as_ref()
    }

    pub fn connect_config(&self) -> &ConnectConfig {
        &self.inner.connect_config
    }

    pub(crate) fn inner(&self) -> &ClientInner {
        &self.inner
    }

    /// The address a request for `url` connects to.
    pub fn address(&self, url: &Uri) -> Result<Address, CallError> {
        let host = url
            .host()
            .filter(|host| !host.is_empty())
            .ok_or(CallError::InvalidRequest("URL has no host"))?;
        let host = Host::parse_as_ip_or_domain(host);
        let port = url.port_u16().and_then(NonZeroU16::new);

        let mut address = match url.scheme_str() {
            Some("http") => Address::http(
                host,
                port.unwrap_or(tether_net_infra::address::DEFAULT_HTTP_PORT),
            ),
            Some("https") => {
                let tls = self
                    .inner
                    .tls
                    .clone()
                    .ok_or(CallError::InvalidRequest("no TLS configured for https"))?;
                Address::https(
                    host,
                    port.unwrap_or(tether_net_infra::address::DEFAULT_HTTPS_PORT),
                    tls,
                )
            }
            _ => return Err(CallError::InvalidRequest("unsupported URL scheme")),
        };
        address.proxy = self.inner.proxy.clone();
        address.proxy_selector = self.inner.proxy_selector.clone();
        Ok(address)
    }
}

pub struct ClientBuilder {
    codec: Arc<dyn ExchangeCodec>,
    dispatcher: Option<Dispatcher>,
    pool: Option<ConnectionPool>,
    cache: Option<Arc<Cache>>,
    resolver: Arc<dyn Resolver>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    socket_connector: Arc<dyn SocketConnector>,
    tls: Option<TlsConfig>,
    connect_config: ConnectConfig,
    listener_factory: EventListenerFactory,
}

impl ClientBuilder {
    pub fn new(codec: Arc<dyn ExchangeCodec>) -> Self {
        Self {
            codec,
            dispatcher: None,
            pool: None,
            cache: None,
            resolver: Arc::new(SystemResolver),
            proxy: None,
            proxy_selector: Arc::new(NoProxy),
            socket_connector: Arc::new(TokioSocketConnector),
            tls: None,
            connect_config: ConnectConfig::default(),
            listener_factory: Arc::new(|_: CallId| -> Arc<dyn EventListener> {
                Arc::new(NoopEventListener)
            }),
        }
    }

    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sends every call through `proxy`, bypassing the proxy selector.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn proxy_selector(mut self, proxy_selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = proxy_selector;
        self
    }

    pub fn socket_connector(mut self, socket_connector: Arc<dyn SocketConnector>) -> Self {
        self.socket_connector = socket_connector;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn connect_config(mut self, connect_config: ConnectConfig) -> Self {
        self.connect_config = connect_config;
        self
    }

    /// Uses the same listener for every call.
    pub fn event_listener(self, listener: Arc<dyn EventListener>) -> Self {
        self.event_listener_factory(Arc::new(move |_: CallId| listener.clone()))
    }

    pub fn event_listener_factory(mut self, factory: EventListenerFactory) -> Self {
        self.listener_factory = factory;
        self
    }

    pub fn build(self) -> Client {
        let Self {
            codec,
            dispatcher,
            pool,
            cache,
            resolver,
            proxy,
            proxy_selector,
            socket_connector,
            tls,
            connect_config,
            listener_factory,
        } = self;
        Client {
            inner: Arc::new(ClientInner {
                dispatcher: dispatcher
                    .unwrap_or_else(|| Dispatcher::new(Arc::new(TokioExecutor::default()))),
                pool: pool.unwrap_or_default(),
                cache,
                resolver,
                proxy,
                proxy_selector,
                socket_connector,
                tls,
                connect_config,
                route_database: Arc::new(RouteDatabase::default()),
                codec,
                listener_factory,
            }),
        }
    }
}
