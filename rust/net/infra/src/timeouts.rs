//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::time::Duration;

/// When racing connect attempts, each new attempt is started this long after
/// the previous one unless the previous one has already failed.
///
/// RFC 8305 recommends 250ms as the default "Connection Attempt Delay".
pub const FAST_FALLBACK_STAGGER: Duration = Duration::from_millis(250);

/// Timeout for a TCP connection attempt to a single socket address, and
/// separately for the TLS handshake that follows it.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an idle pooled connection is kept before it is closed.
pub const POOL_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Upper bound on how many idle connections the pool keeps.
pub const POOL_MAX_IDLE_CONNECTIONS: usize = 5;

/// Number of times a call is retried after failing on a dead connection.
pub const MAX_CONNECTION_FAILURE_RETRIES: usize = 20;
