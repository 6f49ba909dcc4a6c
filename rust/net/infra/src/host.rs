//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt::Display;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

/// The address of a remote host, either IP or DNS domain name.
///
/// Unlike a URL authority, this accepts IPv6 literals with or without the
/// surrounding brackets.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Host<S> {
    /// An IPv4 or IPv6 address.
    Ip(IpAddr),
    /// A DNS domain name.
    Domain(S),
}

impl<S> Host<S> {
    pub fn as_ref(&self) -> Host<&S> {
        match self {
            Host::Domain(domain) => Host::Domain(domain),
            Host::Ip(ip) => Host::Ip(*ip),
        }
    }

    pub fn as_deref<T: ?Sized>(&self) -> Host<&T>
    where
        S: std::ops::Deref<Target = T>,
    {
        match self {
            Host::Ip(ip) => Host::Ip(*ip),
            Host::Domain(domain) => Host::Domain(domain),
        }
    }

    /// Try to parse as an IP address, otherwise assume the input is a domain name.
    ///
    /// Domain names are not validated; DNS resolution is the first thing that
    /// will complain about a malformed one.
    pub fn parse_as_ip_or_domain<'s>(s: &'s str) -> Self
    where
        S: From<&'s str>,
    {
        if let Ok(ip) = IpAddr::from_str(s) {
            return Self::Ip(ip);
        }
        if let Some(ip) = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .and_then(|s| Ipv6Addr::from_str(s).ok())
        {
            return Self::Ip(ip.into());
        }

        Self::Domain(s.into())
    }

    /// Transforms the `Domain` variant with the provided function.
    pub fn map_domain<T>(self, f: impl FnOnce(S) -> T) -> Host<T> {
        match self {
            Host::Ip(ip_addr) => Host::Ip(ip_addr),
            Host::Domain(d) => Host::Domain(f(d)),
        }
    }
}

impl<S: AsRef<str>> Host<S> {
    /// Case-insensitive comparison, ignoring a trailing root label on domains.
    pub fn matches(&self, other: &Host<impl AsRef<str>>) -> bool {
        match (self, other) {
            (Host::Ip(a), Host::Ip(b)) => a == b,
            (Host::Domain(a), Host::Domain(b)) => {
                let a = a.as_ref().trim_end_matches('.');
                let b = b.as_ref().trim_end_matches('.');
                a.eq_ignore_ascii_case(b)
            }
            _ => false,
        }
    }
}

impl<S> From<IpAddr> for Host<S> {
    fn from(value: IpAddr) -> Self {
        Self::Ip(value)
    }
}

impl<S: AsRef<str>> Display for Host<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Host::Ip(IpAddr::V4(ip)) => ip.fmt(f),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
            Host::Domain(domain) => f.write_str(domain.as_ref()),
        }
    }
}
