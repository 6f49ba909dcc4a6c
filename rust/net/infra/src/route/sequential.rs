//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use crate::errors::{ConnectError, TransportConnectError};
use crate::route::{ConnectPlan, ConnectResult, FoundConnection, Plan, RoutePlanner};

/// Tries the planner's routes one at a time until one connects.
///
/// Used when fast fallback is turned off. TLS fallbacks for a route are
/// followed before the next route is tried.
pub struct SequentialFinder<'a> {
    planner: &'a mut RoutePlanner,
}

impl<'a> SequentialFinder<'a> {
    pub fn new(planner: &'a mut RoutePlanner) -> Self {
        Self { planner }
    }

    pub async fn find(self) -> Result<FoundConnection, ConnectError> {
        let planner = self.planner;
        let mut error: Option<ConnectError> = None;

        while planner.has_next() {
            if planner.is_cancelled() {
                return Err(ConnectError::record(
                    error,
                    TransportConnectError::Cancelled,
                ));
            }

            let plan = match planner.plan().await {
                Ok(Plan::Reuse(reuse)) => return Ok(reuse.into()),
                Ok(Plan::Connect(plan)) => plan,
                Err(TransportConnectError::NoRoutes) if error.is_some() => break,
                Err(e) => {
                    let fatal = !e.is_route_specific();
                    error = Some(ConnectError::record(error, e));
                    if fatal {
                        break;
                    }
                    continue;
                }
            };

            match connect_following_retries(plan).await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    let fatal = !e.is_route_specific();
                    error = Some(ConnectError::record(error, e));
                    if fatal {
                        break;
                    }
                }
            }
        }

        Err(error.unwrap_or_else(|| ConnectError::new(TransportConnectError::NoRoutes)))
    }
}

async fn connect_following_retries(
    mut plan: ConnectPlan,
) -> Result<FoundConnection, TransportConnectError> {
    loop {
        if plan.is_ready() {
            match plan.connect_tcp().await {
                ConnectResult::Connected => {}
                ConnectResult::Retry(follow_up) => {
                    plan = follow_up;
                    continue;
                }
                ConnectResult::Failed(e) => return Err(e),
            }
        }
        match plan.connect_tls_etc().await {
            ConnectResult::Connected => return plan.handle_success(),
            ConnectResult::Retry(follow_up) => plan = follow_up,
            ConnectResult::Failed(e) => return Err(e),
        }
    }
}
