//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;

use crate::errors::TlsFailure;
use crate::tls::{TlsParams, TlsProvider, TlsStream};
use crate::transport::SocketConnector;
use crate::{AsyncDuplexStream, Protocol};

/// How a [`FakeSocketConnector`] answers connections to one IP.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FakeBehavior {
    #[default]
    Accept,
    Refuse,
    /// Never completes; only a timeout or cancellation ends the attempt.
    Hang,
    /// Accepts after the given delay.
    Delay(Duration),
}

/// [`SocketConnector`] that hands out in-memory streams.
///
/// The server half of every accepted stream is kept alive for as long as the
/// connector is, so connections stay healthy until
/// [`close_all`](Self::close_all) is called.
#[derive(Debug, Default)]
pub struct FakeSocketConnector {
    behaviors: Mutex<HashMap<IpAddr, FakeBehavior>>,
    attempts: Mutex<Vec<SocketAddr>>,
    server_halves: Mutex<Vec<DuplexStream>>,
}

impl FakeSocketConnector {
    pub fn set_behavior(&self, ip: IpAddr, behavior: FakeBehavior) {
        self.behaviors
            .lock()
            .expect("not poisoned")
            .insert(ip, behavior);
    }

    /// Every address a connection was attempted to, in order.
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().expect("not poisoned").clone()
    }

    /// Drops the server side of every accepted stream.
    pub fn close_all(&self) {
        self.server_halves.lock().expect("not poisoned").clear();
    }
}

#[async_trait]
impl SocketConnector for FakeSocketConnector {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<Box<dyn AsyncDuplexStream>> {
        self.attempts.lock().expect("not poisoned").push(addr);
        let behavior = self
            .behaviors
            .lock()
            .expect("not poisoned")
            .get(&addr.ip())
            .copied()
            .unwrap_or_default();

        match behavior {
            FakeBehavior::Accept => {}
            FakeBehavior::Refuse => return Err(std::io::ErrorKind::ConnectionRefused.into()),
            FakeBehavior::Hang => std::future::pending().await,
            FakeBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }

        let (client, server) = tokio::io::duplex(1024);
        self.server_halves.lock().expect("not poisoned").push(server);
        Ok(Box::new(client))
    }
}

/// [`TlsProvider`] that "completes" handshakes without any I/O.
///
/// It presents a single certificate for the configured names and picks the
/// first offered protocol it supports.
#[derive(Debug)]
pub struct FakeTlsProvider {
    sans: Vec<String>,
    supported: Vec<Protocol>,
    failures: Mutex<VecDeque<TlsFailure>>,
    specs_tried: Mutex<Vec<&'static str>>,
}

impl Default for FakeTlsProvider {
    fn default() -> Self {
        Self::with_sans(&["a.example"])
    }
}

impl FakeTlsProvider {
    pub fn with_sans(sans: &[&str]) -> Self {
        Self {
            sans: sans.iter().map(|s| s.to_string()).collect(),
            supported: vec![Protocol::Http2, Protocol::Http1_1],
            failures: Default::default(),
            specs_tried: Default::default(),
        }
    }

    /// Restricts what ALPN can settle on.
    pub fn supporting(mut self, protocols: &[Protocol]) -> Self {
        self.supported = protocols.to_vec();
        self
    }

    /// Makes the next handshake fail; calls queue up.
    pub fn fail_next(&self, failure: TlsFailure) {
        self.failures
            .lock()
            .expect("not poisoned")
            .push_back(failure);
    }

    /// Names of the connection specs handshakes were attempted with.
    pub fn specs_tried(&self) -> Vec<&'static str> {
        self.specs_tried.lock().expect("not poisoned").clone()
    }
}

#[async_trait]
impl TlsProvider for FakeTlsProvider {
    async fn handshake(
        &self,
        stream: Box<dyn AsyncDuplexStream>,
        params: TlsParams<'_>,
    ) -> Result<TlsStream, TlsFailure> {
        self.specs_tried
            .lock()
            .expect("not poisoned")
            .push(params.spec.name);
        if let Some(failure) = self.failures.lock().expect("not poisoned").pop_front() {
            return Err(failure);
        }

        let sans: Vec<&str> = self.sans.iter().map(String::as_str).collect();
        let negotiated_protocol = params
            .alpn
            .iter()
            .find(|p| self.supported.contains(p))
            .copied();
        Ok(TlsStream {
            stream,
            handshake: super::fake_handshake(vec![super::fake_certificate(&sans)]),
            negotiated_protocol,
        })
    }
}
