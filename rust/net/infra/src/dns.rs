//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use itertools::Either;
use itertools::Itertools as _;

use crate::errors::LogSafeDisplay;
use crate::DnsSource;

pub mod lookup_result;

pub use lookup_result::LookupResult;

#[derive(displaydoc::Display, Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// DNS lookup failed: {0:?}
    LookupFailed(std::io::ErrorKind),
    /// Data for the given name is not available
    NoData,
}
impl LogSafeDisplay for DnsError {}

pub type Result<T> = std::result::Result<T, DnsError>;

/// Resolves a hostname into the addresses to attempt connecting to.
///
/// Implementations return either a non-empty [`LookupResult`] or an error.
#[async_trait]
pub trait Resolver: Debug + Send + Sync {
    async fn lookup_ip(&self, hostname: &str) -> Result<LookupResult>;
}

/// Performs DNS lookup using the system resolver.
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ip(&self, hostname: &str) -> Result<LookupResult> {
        let lookup_result = tokio::net::lookup_host((hostname, 443))
            .await
            .map_err(|e| DnsError::LookupFailed(e.kind()))?;

        let (ipv4s, ipv6s): (Vec<_>, Vec<_>) =
            lookup_result.into_iter().partition_map(|ip| match ip {
                SocketAddr::V4(v4) => Either::Left(*v4.ip()),
                SocketAddr::V6(v6) => Either::Right(*v6.ip()),
            });
        match LookupResult::new(DnsSource::SystemLookup, ipv4s, ipv6s) {
            lookup_result if !lookup_result.is_empty() => Ok(lookup_result),
            _ => Err(DnsError::NoData),
        }
    }
}

/// Answers lookups from a map of statically configured, non-expiring entries.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver(pub HashMap<String, LookupResult>);

impl StaticResolver {
    pub fn with_entry(mut self, hostname: impl Into<String>, result: LookupResult) -> Self {
        self.0.insert(hostname.into(), result);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup_ip(&self, hostname: &str) -> Result<LookupResult> {
        self.0
            .get(hostname)
            .filter(|result| !result.is_empty())
            .ok_or(DnsError::NoData)
            .cloned()
    }
}
