//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::iter::Map;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::slice::Iter;
use std::vec::IntoIter;

use crate::DnsSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    source: DnsSource,
    ipv4: Vec<Ipv4Addr>,
    ipv6: Vec<Ipv6Addr>,
}

impl IntoIterator for LookupResult {
    type Item = IpAddr;
    type IntoIter = itertools::Interleave<
        Map<IntoIter<Ipv6Addr>, fn(Ipv6Addr) -> IpAddr>,
        Map<IntoIter<Ipv4Addr>, fn(Ipv4Addr) -> IpAddr>,
    >;

    /// Returns an iterator that interleaves IPv6 and IPv4 addresses, IPv6 first.
    fn into_iter(self) -> Self::IntoIter {
        let v6_into_ipaddr: fn(Ipv6Addr) -> IpAddr = IpAddr::V6;
        let v4_into_ipaddr: fn(Ipv4Addr) -> IpAddr = IpAddr::V4;
        itertools::interleave(
            self.ipv6.into_iter().map(v6_into_ipaddr),
            self.ipv4.into_iter().map(v4_into_ipaddr),
        )
    }
}

impl<'a> IntoIterator for &'a LookupResult {
    type Item = IpAddr;
    type IntoIter = itertools::Interleave<
        Map<Iter<'a, Ipv6Addr>, fn(&Ipv6Addr) -> IpAddr>,
        Map<Iter<'a, Ipv4Addr>, fn(&Ipv4Addr) -> IpAddr>,
    >;

    fn into_iter(self) -> Self::IntoIter {
        let v6_into_ipaddr: fn(&Ipv6Addr) -> IpAddr = |v| (*v).into();
        let v4_into_ipaddr: fn(&Ipv4Addr) -> IpAddr = |v| (*v).into();
        itertools::interleave(
            self.ipv6.iter().map(v6_into_ipaddr),
            self.ipv4.iter().map(v4_into_ipaddr),
        )
    }
}

impl LookupResult {
    pub fn new(source: DnsSource, ipv4: Vec<Ipv4Addr>, ipv6: Vec<Ipv6Addr>) -> Self {
        Self { source, ipv4, ipv6 }
    }

    /// Builds a result from addresses of either family, preserving the
    /// relative order within each family.
    pub fn from_ips(source: DnsSource, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();
        for ip in ips {
            match ip {
                IpAddr::V4(v4) => ipv4.push(v4),
                IpAddr::V6(v6) => ipv6.push(v6),
            }
        }
        Self { source, ipv4, ipv6 }
    }

    pub fn iter(&self) -> <&Self as IntoIterator>::IntoIter {
        self.into_iter()
    }

    pub fn source(&self) -> DnsSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl LookupResult {
    pub fn localhost() -> Self {
        Self::new(
            DnsSource::Static,
            vec![Ipv4Addr::LOCALHOST],
            vec![Ipv6Addr::LOCALHOST],
        )
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use const_str::ip_addr;

    use super::LookupResult;
    use crate::DnsSource;

    #[test]
    fn lookup_result_iterates_in_the_right_order() {
        let ipv4_1 = ip_addr!(v4, "192.0.2.1");
        let ipv4_2 = ip_addr!(v4, "192.0.2.2");
        let ipv4_3 = ip_addr!(v4, "192.0.2.3");
        let ipv6_1 = ip_addr!(v6, "2001:db8::1");
        let ipv6_2 = ip_addr!(v6, "2001:db8::2");

        validate_expected_order(
            vec![ipv4_1, ipv4_2, ipv4_3],
            vec![ipv6_1, ipv6_2],
            vec![
                IpAddr::V6(ipv6_1),
                IpAddr::V4(ipv4_1),
                IpAddr::V6(ipv6_2),
                IpAddr::V4(ipv4_2),
                IpAddr::V4(ipv4_3),
            ],
        );

        validate_expected_order(
            vec![ipv4_1, ipv4_2],
            vec![],
            vec![IpAddr::V4(ipv4_1), IpAddr::V4(ipv4_2)],
        );
    }

    #[test]
    fn from_ips_splits_by_family() {
        let result = LookupResult::from_ips(
            DnsSource::Test,
            [ip_addr!("192.0.2.1"), ip_addr!("2001:db8::1"), ip_addr!("192.0.2.2")],
        );
        assert_eq!(result.len(), 3);
        assert_eq!(
            result.iter().collect::<Vec<_>>(),
            [
                ip_addr!("2001:db8::1"),
                ip_addr!("192.0.2.1"),
                ip_addr!("192.0.2.2")
            ]
        );
    }

    fn validate_expected_order(ipv4s: Vec<Ipv4Addr>, ipv6s: Vec<Ipv6Addr>, expected: Vec<IpAddr>) {
        let lookup_result = LookupResult::new(DnsSource::Test, ipv4s, ipv6s);
        let actual: Vec<IpAddr> = lookup_result.into_iter().collect();
        assert_eq!(expected, actual);
    }
}
