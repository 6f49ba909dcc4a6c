//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt::Debug;

use async_trait::async_trait;
use tether_net_infra::connection::RealConnection;
use tether_net_infra::errors::LogSafeDisplay;

use crate::http::{NetworkResponse, Request};

/// Writes a request to a connection and reads the response back.
///
/// HTTP/1.1 and HTTP/2 framing live behind this trait; the call pipeline only
/// decides which connection an exchange goes over.
#[async_trait]
pub trait ExchangeCodec: Debug + Send + Sync {
    async fn exchange(
        &self,
        connection: &RealConnection,
        request: &Request,
    ) -> Result<NetworkResponse, ExchangeError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ExchangeError {
    /// the connection was shut down before the exchange completed
    ConnectionShutdown,
    /// I/O error: {0:?}
    Io(std::io::ErrorKind),
    /// protocol error: {0}
    Protocol(&'static str),
    /// the exchange was cancelled
    Cancelled,
}
impl LogSafeDisplay for ExchangeError {}

impl ExchangeError {
    /// Whether the failure says more about the connection than about the
    /// request, so that the request could go through on another connection.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ExchangeError::ConnectionShutdown => true,
            ExchangeError::Io(kind) => matches!(
                kind,
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            ExchangeError::Protocol(_) | ExchangeError::Cancelled => false,
        }
    }
}
