//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::VecDeque;
use std::sync::Arc;

use crate::address::Address;
use crate::connection::RealConnection;
use crate::dns::Resolver;
use crate::errors::TransportConnectError;
use crate::route::{ConnectContext, ConnectPlan, Plan, ReusePlan, Route, RouteSelector};

/// Decides how a call gets its next connection.
///
/// Candidates are offered in this order:
/// 1. the connection the call already holds, if it can take another exchange;
/// 2. a pooled connection to the same address;
/// 3. plans deferred by a racer, oldest first;
/// 4. a new plan for the next route (resolving DNS if needed);
/// 5. a pooled connection that can be coalesced now that routes are known.
pub struct RoutePlanner {
    ctx: ConnectContext,
    address: Address,
    resolver: Arc<dyn Resolver>,
    selector: Option<RouteSelector>,
    call_connection: Option<Arc<RealConnection>>,
    do_extensive_health_checks: bool,
    /// Plans to be offered before any new route is tried.
    pub deferred_plans: VecDeque<ConnectPlan>,
}

impl RoutePlanner {
    pub fn new(
        ctx: ConnectContext,
        address: Address,
        resolver: Arc<dyn Resolver>,
        do_extensive_health_checks: bool,
    ) -> Self {
        Self {
            ctx,
            address,
            resolver,
            selector: None,
            call_connection: None,
            do_extensive_health_checks,
            deferred_plans: VecDeque::new(),
        }
    }

    pub fn context(&self) -> &ConnectContext {
        &self.ctx
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Hands the planner a connection already allocated to the call.
    ///
    /// The next plan reuses it if it can still take an exchange for this
    /// address. Otherwise, or if the planner is dropped first, the allocation
    /// is released.
    pub fn set_call_connection(&mut self, connection: Arc<RealConnection>) {
        if let Some(previous) = self.call_connection.replace(connection) {
            self.ctx.pool.release(&previous, self.ctx.call);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }

    pub fn has_next(&self) -> bool {
        self.call_connection.is_some()
            || !self.deferred_plans.is_empty()
            || self.selector.as_ref().is_none_or(RouteSelector::has_next)
    }

    pub async fn plan(&mut self) -> Result<Plan, TransportConnectError> {
        if self.is_cancelled() {
            return Err(TransportConnectError::Cancelled);
        }

        if let Some(reuse) = self.plan_reuse_call_connection() {
            return Ok(Plan::Reuse(reuse));
        }

        if let Some(reuse) = self.plan_reuse_pooled_connection(None) {
            return Ok(Plan::Reuse(reuse));
        }

        if let Some(deferred) = self.deferred_plans.pop_front() {
            return Ok(Plan::Connect(deferred));
        }

        let (route, routes) = self.next_route().await?;

        if let Some(reuse) = self.plan_reuse_pooled_connection(Some(&routes)) {
            // Keep the route for a later attempt on this call, if one is needed.
            self.deferred_plans
                .push_back(ConnectPlan::new(self.ctx.clone(), route, routes));
            return Ok(Plan::Reuse(reuse));
        }

        Ok(Plan::Connect(ConnectPlan::new(self.ctx.clone(), route, routes)))
    }

    fn plan_reuse_call_connection(&mut self) -> Option<ReusePlan> {
        let connection = self.call_connection.take()?;
        let call = self.ctx.call;

        let same_origin = connection.route().address.host == self.address.host
            && connection.route().address.port == self.address.port;
        if connection.no_new_exchanges() || !same_origin {
            self.ctx.pool.release(&connection, call);
            return None;
        }
        if !connection.is_healthy(self.do_extensive_health_checks) {
            log::info!(
                "{} held {} is no longer healthy",
                call.log_tag(),
                connection.id()
            );
            connection.set_no_new_exchanges();
            self.ctx.pool.release(&connection, call);
            return None;
        }
        Some(ReusePlan { connection })
    }

    fn plan_reuse_pooled_connection(&self, routes: Option<&[Route]>) -> Option<ReusePlan> {
        self.ctx
            .pool
            .acquire(
                &self.address,
                self.ctx.call,
                routes,
                false,
                self.do_extensive_health_checks,
            )
            .map(|connection| ReusePlan { connection })
    }

    async fn next_route(&mut self) -> Result<(Route, Arc<[Route]>), TransportConnectError> {
        let selector = self.selector.get_or_insert_with(|| {
            RouteSelector::new(
                self.address.clone(),
                self.resolver.clone(),
                self.ctx.route_database.clone(),
                self.ctx.listener.clone(),
                self.ctx.call,
            )
        });
        selector
            .next_route()
            .await?
            .ok_or(TransportConnectError::NoRoutes)
    }
}

impl Drop for RoutePlanner {
    fn drop(&mut self) {
        if let Some(connection) = self.call_connection.take() {
            self.ctx.pool.release(&connection, self.ctx.call);
        }
    }
}
