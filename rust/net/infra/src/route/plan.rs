//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::RealConnection;
use crate::errors::TransportConnectError;
use crate::events::EventListener;
use crate::pool::ConnectionPool;
use crate::route::{FoundConnection, Route, RouteDatabase};
use crate::tls::{Handshake, TlsParams, TlsStream};
use crate::transport::SocketConnector;
use crate::{AsyncDuplexStream, CallId, Protocol};

/// Collaborators shared by every plan made for one call.
#[derive(Clone)]
pub struct ConnectContext {
    pub call: CallId,
    pub pool: ConnectionPool,
    pub route_database: Arc<RouteDatabase>,
    pub socket_connector: Arc<dyn SocketConnector>,
    pub listener: Arc<dyn EventListener>,
    pub connect_timeout: Duration,
    /// Cancelled when the call is; each plan watches a child of this.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectContext")
            .field("call", &self.call)
            .field("connect_timeout", &self.connect_timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A way of getting a connection for a call.
#[derive(Debug)]
pub enum Plan {
    /// An existing connection, already allocated to the call.
    Reuse(ReusePlan),
    Connect(ConnectPlan),
}

#[derive(Debug)]
pub struct ReusePlan {
    pub connection: Arc<RealConnection>,
}

impl From<ReusePlan> for FoundConnection {
    fn from(ReusePlan { connection }: ReusePlan) -> Self {
        FoundConnection {
            connection,
            reused: true,
        }
    }
}

/// Outcome of one step of a [`ConnectPlan`].
#[derive(Debug)]
#[must_use]
pub enum ConnectResult {
    /// The step finished; the plan can move on.
    Connected,
    /// This plan is done, but the given follow-up might succeed.
    Retry(ConnectPlan),
    Failed(TransportConnectError),
}

enum PlanState {
    Ready,
    TcpConnected(Box<dyn AsyncDuplexStream>),
    TlsConnected {
        stream: Box<dyn AsyncDuplexStream>,
        protocol: Protocol,
        handshake: Option<Handshake>,
    },
    Done,
}

impl std::fmt::Debug for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PlanState::Ready => "Ready",
            PlanState::TcpConnected(_) => "TcpConnected",
            PlanState::TlsConnected { .. } => "TlsConnected",
            PlanState::Done => "Done",
        })
    }
}

/// One attempt at opening a new connection over a single route.
///
/// Steps are driven explicitly: [`connect_tcp`](Self::connect_tcp), then
/// [`connect_tls_etc`](Self::connect_tls_etc), then
/// [`handle_success`](Self::handle_success). Dropping a plan closes whatever
/// socket it has opened so far.
#[derive(Debug)]
pub struct ConnectPlan {
    ctx: ConnectContext,
    route: Route,
    /// The candidates `route` was chosen from, for coalescing checks.
    routes: Arc<[Route]>,
    spec_index: usize,
    cancel: CancellationToken,
    state: PlanState,
}

impl ConnectPlan {
    pub fn new(ctx: ConnectContext, route: Route, routes: Arc<[Route]>) -> Self {
        Self::with_spec_index(ctx, route, routes, 0)
    }

    fn with_spec_index(
        ctx: ConnectContext,
        route: Route,
        routes: Arc<[Route]>,
        spec_index: usize,
    ) -> Self {
        let cancel = ctx.cancel.child_token();
        Self {
            ctx,
            route,
            routes,
            spec_index,
            cancel,
            state: PlanState::Ready,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, PlanState::Ready)
    }

    pub fn is_tcp_connected(&self) -> bool {
        matches!(self.state, PlanState::TcpConnected(_))
    }

    /// Makes the current or next step fail with
    /// [`TransportConnectError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A fresh plan for the same route, unless the whole call was cancelled.
    pub fn retry(&self) -> Option<ConnectPlan> {
        if self.ctx.cancel.is_cancelled() {
            return None;
        }
        Some(Self::with_spec_index(
            self.ctx.clone(),
            self.route.clone(),
            self.routes.clone(),
            self.spec_index,
        ))
    }

    pub async fn connect_tcp(&mut self) -> ConnectResult {
        if !self.is_ready() {
            return ConnectResult::Failed(TransportConnectError::InvalidConfiguration(
                "TCP already connected",
            ));
        }
        if self.route.requires_tunnel() {
            return self.fail(TransportConnectError::InvalidConfiguration(
                "HTTPS through an HTTP proxy requires a tunnel",
            ));
        }

        let ConnectContext {
            call,
            socket_connector,
            listener,
            connect_timeout,
            ..
        } = &self.ctx;
        listener.connect_start(*call, &self.route);
        log::debug!("{} connecting {}", call.log_tag(), self.route);

        let addr = self.route.socket_addr;
        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TransportConnectError::Cancelled),
            result = crate::utils::timeout(
                *connect_timeout,
                TransportConnectError::TimedOut,
                async {
                    socket_connector
                        .connect(addr)
                        .await
                        .map_err(|e| TransportConnectError::TcpConnectionFailed(e.kind()))
                },
            ) => result,
        };

        match outcome {
            Ok(stream) => {
                self.state = PlanState::TcpConnected(stream);
                ConnectResult::Connected
            }
            Err(error) => self.fail(error),
        }
    }

    /// Completes whatever the connection needs after TCP: the TLS handshake
    /// and its verification for HTTPS, nothing for plaintext HTTP.
    ///
    /// A handshake that fails in a way another TLS configuration might fix
    /// yields [`ConnectResult::Retry`] with the next connection spec.
    pub async fn connect_tls_etc(&mut self) -> ConnectResult {
        let stream = match std::mem::replace(&mut self.state, PlanState::Done) {
            PlanState::TcpConnected(stream) => stream,
            other => {
                self.state = other;
                return ConnectResult::Failed(TransportConnectError::InvalidConfiguration(
                    "TCP not connected",
                ));
            }
        };
        let call = self.ctx.call;
        let listener = self.ctx.listener.clone();

        let Some(tls) = self.route.address.tls.clone() else {
            let protocol = Protocol::Http1_1;
            self.state = PlanState::TlsConnected {
                stream,
                protocol,
                handshake: None,
            };
            listener.connect_end(call, &self.route, protocol);
            return ConnectResult::Connected;
        };
        let Some(spec) = tls.connection_specs.get(self.spec_index).cloned() else {
            return self.fail(TransportConnectError::InvalidConfiguration(
                "no TLS connection spec to try",
            ));
        };

        listener.secure_connect_start(call);
        let host = self.route.address.host.clone();
        let protocols = self.route.address.protocols.clone();
        let params = TlsParams {
            sni: host.as_deref(),
            spec: &spec,
            alpn: &protocols,
        };
        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TransportConnectError::Cancelled),
            result = tokio::time::timeout(
                self.ctx.connect_timeout,
                tls.provider.handshake(stream, params),
            ) => match result {
                Ok(Ok(tls_stream)) => Ok(tls_stream),
                Ok(Err(failure)) => Err(TransportConnectError::TlsHandshakeFailed(failure)),
                Err(_elapsed) => Err(TransportConnectError::TimedOut),
            },
        };

        let TlsStream {
            stream,
            handshake,
            negotiated_protocol,
        } = match outcome {
            Ok(tls_stream) => tls_stream,
            Err(error @ TransportConnectError::TlsHandshakeFailed(failure))
                if failure.allows_spec_fallback()
                    && self.spec_index + 1 < tls.connection_specs.len() =>
            {
                log::info!(
                    "{} TLS handshake using the {} spec failed ({failure}), falling back",
                    call.log_tag(),
                    spec.name,
                );
                listener.connect_failed(call, &self.route, &error);
                return ConnectResult::Retry(Self::with_spec_index(
                    self.ctx.clone(),
                    self.route.clone(),
                    self.routes.clone(),
                    self.spec_index + 1,
                ));
            }
            Err(error) => return self.fail(error),
        };

        if !tls.hostname_verifier.verify(host.as_deref(), &handshake) {
            return self.fail(TransportConnectError::HostnameMismatch);
        }
        if let Err(error) = tls
            .certificate_pinner
            .check(host.as_deref(), &handshake.peer_certificates)
        {
            return self.fail(error);
        }

        let protocol = negotiated_protocol.unwrap_or(Protocol::Http1_1);
        listener.secure_connect_end(call, Some(&handshake));
        listener.connect_end(call, &self.route, protocol);
        self.state = PlanState::TlsConnected {
            stream,
            protocol,
            handshake: Some(handshake),
        };
        ConnectResult::Connected
    }

    /// Turns a fully connected plan into a pooled connection allocated to the
    /// call.
    ///
    /// If another call meanwhile pooled a multiplexed connection that can
    /// serve this address, that one is used and the new one is closed.
    pub fn handle_success(mut self) -> Result<FoundConnection, TransportConnectError> {
        let PlanState::TlsConnected {
            stream,
            protocol,
            handshake,
        } = std::mem::replace(&mut self.state, PlanState::Done)
        else {
            return Err(TransportConnectError::InvalidConfiguration(
                "plan has not finished connecting",
            ));
        };
        let ConnectContext {
            call,
            pool,
            route_database,
            ..
        } = &self.ctx;
        route_database.connected(&self.route);

        let connection = RealConnection::new(self.route.clone(), protocol, handshake, stream);
        if connection.is_multiplexed() {
            if let Some(pooled) =
                pool.acquire(&self.route.address, *call, Some(&self.routes), true, false)
            {
                log::info!(
                    "{} using pooled {} instead of new {}",
                    call.log_tag(),
                    pooled.id(),
                    connection.id()
                );
                connection.close();
                return Ok(FoundConnection {
                    connection: pooled,
                    reused: true,
                });
            }
        }

        pool.put(connection.clone(), Some(*call));
        log::info!(
            "{} opened {} ({protocol}) over {}",
            call.log_tag(),
            connection.id(),
            self.route
        );
        Ok(FoundConnection {
            connection,
            reused: false,
        })
    }

    fn fail(&mut self, error: TransportConnectError) -> ConnectResult {
        self.state = PlanState::Done;
        let ConnectContext {
            call,
            listener,
            route_database,
            ..
        } = &self.ctx;
        listener.connect_failed(*call, &self.route, &error);
        if error.is_route_specific() {
            route_database.failed(&self.route);
        }
        log::info!("{} {} failed: {error}", call.log_tag(), self.route);
        ConnectResult::Failed(error)
    }
}
