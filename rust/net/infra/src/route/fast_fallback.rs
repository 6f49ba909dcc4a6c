//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt as _, StreamExt as _};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{ConnectError, TransportConnectError};
use crate::route::{ConnectPlan, ConnectResult, FoundConnection, Plan, RoutePlanner};
use crate::utils::future::SomeOrPending;

#[derive(Copy, Clone, Debug)]
enum Step {
    Tcp,
    Tls,
}

struct Attempt {
    plan: ConnectPlan,
    step: Step,
    result: ConnectResult,
}

fn run_step(mut plan: ConnectPlan, step: Step) -> BoxFuture<'static, Attempt> {
    async move {
        let result = match step {
            Step::Tcp => plan.connect_tcp().await,
            Step::Tls => plan.connect_tls_etc().await,
        };
        Attempt { plan, step, result }
    }
    .boxed()
}

/// Races connect attempts over the planner's routes.
///
/// A new TCP attempt starts every `stagger` while earlier ones are still
/// pending, and immediately when one fails. The first attempt to finish its
/// TLS handshake wins; every other attempt still in flight is cancelled and
/// handed back to the planner as a deferred plan.
pub struct FastFallbackFinder<'a> {
    planner: &'a mut RoutePlanner,
    stagger: Duration,
}

impl<'a> FastFallbackFinder<'a> {
    pub fn new(planner: &'a mut RoutePlanner, stagger: Duration) -> Self {
        Self { planner, stagger }
    }

    pub async fn find(self) -> Result<FoundConnection, ConnectError> {
        let Self { planner, stagger } = self;
        let log_tag = planner.context().call.log_tag();

        let mut in_flight = FuturesUnordered::new();
        let mut launched: Vec<CancellationToken> = Vec::new();
        let mut error: Option<ConnectError> = None;
        let mut next_launch_at = Instant::now();

        let record = |error: &mut Option<ConnectError>, e: TransportConnectError| {
            if e == TransportConnectError::NoRoutes && error.is_some() {
                return;
            }
            *error = Some(ConnectError::record(error.take(), e));
        };

        let outcome: Result<FoundConnection, ()> = loop {
            if planner.is_cancelled() {
                record(&mut error, TransportConnectError::Cancelled);
                break Err(());
            }

            let now = Instant::now();
            if planner.has_next() && (in_flight.is_empty() || now >= next_launch_at) {
                next_launch_at = now + stagger;
                match planner.plan().await {
                    Ok(Plan::Reuse(reuse)) => break Ok(reuse.into()),
                    Ok(Plan::Connect(plan)) => {
                        launched.push(plan.cancellation_token());
                        in_flight.push(run_step(plan, Step::Tcp));
                    }
                    Err(e) => {
                        let fatal = !e.is_route_specific() && e != TransportConnectError::NoRoutes;
                        record(&mut error, e);
                        if fatal {
                            break Err(());
                        }
                        next_launch_at = now;
                    }
                }
            }

            if in_flight.is_empty() {
                if planner.has_next() {
                    continue;
                }
                break Err(());
            }

            let launch_deadline = planner.has_next().then_some(next_launch_at);
            let completed = tokio::select! {
                attempt = in_flight.next() => attempt,
                () = SomeOrPending::from(launch_deadline.map(tokio::time::sleep_until)) => None,
            };
            let Some(Attempt { plan, step, result }) = completed else {
                continue;
            };

            match (step, result) {
                (Step::Tcp, ConnectResult::Connected) => {
                    in_flight.push(run_step(plan, Step::Tls));
                }
                (Step::Tls, ConnectResult::Connected) => match plan.handle_success() {
                    Ok(found) => break Ok(found),
                    Err(e) => record(&mut error, e),
                },
                (_, ConnectResult::Retry(follow_up)) => {
                    planner.deferred_plans.push_front(follow_up);
                    next_launch_at = Instant::now();
                }
                (_, ConnectResult::Failed(e)) => {
                    let fatal = !e.is_route_specific();
                    record(&mut error, e);
                    if fatal {
                        break Err(());
                    }
                    next_launch_at = Instant::now();
                }
            }
        };

        if !in_flight.is_empty() {
            log::debug!(
                "{log_tag} cancelling {} connect attempt(s) still in flight",
                in_flight.len()
            );
        }
        for token in &launched {
            token.cancel();
        }
        // Each loser stops at its next checkpoint; whatever it opened is
        // closed when the plan is dropped.
        while let Some(Attempt { plan, .. }) = in_flight.next().await {
            if let Some(retry) = plan.retry() {
                planner.deferred_plans.push_back(retry);
            }
        }

        outcome.map_err(|()| {
            error.unwrap_or_else(|| ConnectError::new(TransportConnectError::NoRoutes))
        })
    }
}
