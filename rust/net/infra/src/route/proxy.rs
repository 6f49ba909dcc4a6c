//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt::Debug;
use std::num::NonZeroU16;
use std::sync::Arc;

use crate::address::Address;
use crate::host::Host;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Proxy {
    Direct,
    Http {
        host: Host<Arc<str>>,
        port: NonZeroU16,
    },
}

/// Chooses the proxies to try, in order, for an address.
pub trait ProxySelector: Debug + Send + Sync {
    fn select(&self, address: &Address) -> Vec<Proxy>;

    /// Called when every route through `proxy` failed.
    fn connect_failed(&self, _address: &Address, _proxy: &Proxy) {}
}

/// Always connects directly.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _address: &Address) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}
