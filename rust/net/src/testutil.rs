//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt as _;
use http::StatusCode;
use tether_net_infra::connection::{ConnectionId, RealConnection};

use crate::dispatcher::{Executor, JobHandle};
use crate::exchange::{ExchangeCodec, ExchangeError};
use crate::http::{NetworkResponse, Request};

/// [`Executor`] that holds on to the jobs it is given until a test finishes
/// them.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    started: Mutex<Vec<String>>,
    pending: Mutex<Vec<JobHandle>>,
    shut_down: AtomicBool,
}

impl RecordingExecutor {
    /// Tags of the jobs started since the last call.
    pub fn started_tags(&self) -> Vec<String> {
        std::mem::take(&mut *self.started.lock().expect("not poisoned"))
    }

    /// Runs the started job tagged `tag` to completion.
    ///
    /// Panics if there is no such job or if it doesn't complete without
    /// waiting.
    pub fn finish_job(&self, tag: &str) {
        let handle = {
            let mut pending = self.pending.lock().expect("not poisoned");
            let index = pending
                .iter()
                .position(|handle| handle.info().tag == tag)
                .unwrap_or_else(|| panic!("no running job {tag}"));
            pending.remove(index)
        };
        handle
            .run()
            .now_or_never()
            .expect("job completes without waiting");
    }

    /// Makes every later job be rejected.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, job: JobHandle) -> Result<(), JobHandle> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(job);
        }
        self.started
            .lock()
            .expect("not poisoned")
            .push(job.info().tag.clone());
        self.pending.lock().expect("not poisoned").push(job);
        Ok(())
    }
}

/// [`ExchangeCodec`] that answers from a script.
///
/// Each exchange takes the next scripted result; once the script runs out,
/// every exchange gets `200 OK` with body `ok`. Exchanges on a closed
/// connection fail with [`ExchangeError::ConnectionShutdown`] without using up
/// the script.
#[derive(Debug, Default)]
pub struct FakeCodec {
    script: Mutex<VecDeque<Result<NetworkResponse, ExchangeError>>>,
    exchanges: Mutex<Vec<(ConnectionId, Request)>>,
}

impl FakeCodec {
    pub fn enqueue(&self, result: Result<NetworkResponse, ExchangeError>) {
        self.script.lock().expect("not poisoned").push_back(result);
    }

    pub fn enqueue_response(&self, response: NetworkResponse) {
        self.enqueue(Ok(response));
    }

    /// Every request seen so far, with the connection it went over.
    pub fn exchanges(&self) -> Vec<(ConnectionId, Request)> {
        self.exchanges.lock().expect("not poisoned").clone()
    }
}

pub fn ok_response(body: &'static str) -> NetworkResponse {
    NetworkResponse {
        status: StatusCode::OK,
        headers: Default::default(),
        body: Bytes::from_static(body.as_bytes()),
        max_concurrent_streams: None,
    }
}

#[async_trait]
impl ExchangeCodec for FakeCodec {
    async fn exchange(
        &self,
        connection: &RealConnection,
        request: &Request,
    ) -> Result<NetworkResponse, ExchangeError> {
        self.exchanges
            .lock()
            .expect("not poisoned")
            .push((connection.id(), request.clone()));

        let stream = connection.lock_stream().await;
        if stream.is_none() {
            return Err(ExchangeError::ConnectionShutdown);
        }
        let next = self.script.lock().expect("not poisoned").pop_front();
        next.unwrap_or_else(|| Ok(ok_response("ok")))
    }
}
