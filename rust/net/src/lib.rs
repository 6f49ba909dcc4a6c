//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call execution on top of `tether-net-infra`.
//!
//! A [`Client`](client::Client) owns the shared state: the admission
//! [`Dispatcher`](dispatcher::Dispatcher), the connection pool, and an optional
//! disk [`Cache`](cache::Cache). Each request becomes a [`Call`](call::Call)
//! that is admitted, answered from the cache where possible, and otherwise sent
//! over a pooled or freshly raced connection.

pub mod cache;
pub mod call;
pub mod client;
pub mod dispatcher;
pub mod exchange;
pub mod http;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

// Re-export from `tether_net_infra`.
pub use tether_net_infra as infra;
