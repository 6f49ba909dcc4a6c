//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Admission control for calls.
//!
//! The [`Dispatcher`] bounds how many calls run at once, overall and per host.
//! Asynchronous jobs that can't run yet wait in a FIFO queue; synchronous calls
//! wait in [`Dispatcher::execute`] without ever entering that queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use tether_net_infra::errors::LogSafeDisplay;
use tether_net_infra::utils::TrackedMutex;
use tether_net_infra::LockProbe;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_REQUESTS: usize = 64;
pub const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What the dispatcher needs to know about a job to schedule it.
#[derive(Clone, Debug)]
pub struct JobInfo {
    /// Shown by [`Dispatcher::queued_tags`] and [`Dispatcher::running_tags`].
    pub tag: String,
    /// Key for the per-host limit.
    pub host: String,
    /// Websocket jobs are only subject to the overall limit.
    pub websocket: bool,
    /// Flipped when the job is cancelled while running.
    pub cancel: CancellationToken,
}

impl JobInfo {
    pub fn new(tag: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            host: host.into(),
            websocket: false,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum DispatchError {
    /// the executor refused to run the job
    Rejected,
    /// the job was cancelled before it ran
    Cancelled,
}
impl LogSafeDisplay for DispatchError {}

#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
/// {name} must be at least 1
pub struct InvalidLimit {
    pub name: &'static str,
}

/// Work submitted through [`Dispatcher::enqueue`].
pub trait AsyncJob: Send + 'static {
    fn info(&self) -> JobInfo;
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;
    /// Called instead of `run` when the job will never run.
    ///
    /// Invoked without the dispatcher's lock held.
    fn reject(self: Box<Self>, error: DispatchError);
}

/// An admitted job, ready to be run by an [`Executor`].
///
/// Running it reports the job finished to the dispatcher, even if the job's
/// future is dropped part way through.
pub struct JobHandle {
    id: JobId,
    info: JobInfo,
    job: Box<dyn AsyncJob>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn run(self) -> BoxFuture<'static, ()> {
        let Self {
            id,
            info: _,
            job,
            dispatcher,
        } = self;
        Box::pin(async move {
            let _finished = FinishOnDrop { dispatcher, id };
            job.run().await;
        })
    }

    fn reject(self, error: DispatchError) {
        let Self {
            id,
            info,
            job,
            dispatcher,
        } = self;
        log::warn!("job {} for {} rejected: {error}", id.0, info.tag);
        job.reject(error);
        dispatcher.finished(id);
    }
}

struct FinishOnDrop {
    dispatcher: Dispatcher,
    id: JobId,
}

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.dispatcher.finished(self.id);
    }
}

/// Runs admitted jobs.
pub trait Executor: Send + Sync {
    /// Starts the job, or hands it back if it can't be run.
    fn execute(&self, job: JobHandle) -> Result<(), JobHandle>;
}

/// Spawns jobs onto a tokio runtime.
#[derive(Debug, Default)]
pub struct TokioExecutor {
    runtime: Option<tokio::runtime::Handle>,
    shut_down: AtomicBool,
}

impl TokioExecutor {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime: Some(runtime),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Rejects every job submitted from now on.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Relaxed);
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: JobHandle) -> Result<(), JobHandle> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(job);
        }
        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => runtime,
                Err(_) => return Err(job),
            },
        };
        runtime.spawn(job.run());
        Ok(())
    }
}

/// Admission queue shared by all calls of a client.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    executor: Arc<dyn Executor>,
    state: TrackedMutex<DispatcherState>,
}

type IdleCallback = Arc<dyn Fn() + Send + Sync>;

struct DispatcherState {
    max_requests: usize,
    max_requests_per_host: usize,
    ready_async: VecDeque<QueuedJob>,
    waiting_sync: VecDeque<WaitingCall>,
    running: IndexMap<JobId, JobInfo>,
    idle_callback: Option<IdleCallback>,
    /// Whether anything was outstanding since the last idle notification.
    busy: bool,
}

struct QueuedJob {
    id: JobId,
    info: JobInfo,
    job: Box<dyn AsyncJob>,
}

struct WaitingCall {
    id: JobId,
    info: JobInfo,
    admit: oneshot::Sender<()>,
}

/// Jobs taken out of the queues under the lock, to be started after it is
/// released.
enum Admitted {
    Async(QueuedJob),
    Sync(WaitingCall),
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Dispatcher")
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .field("running", &state.running.len())
            .field("queued", &state.ready_async.len())
            .finish_non_exhaustive()
    }
}

impl DispatcherState {
    fn running_for_host(&self, host: &str) -> usize {
        self.running.values().filter(|info| info.host == host).count()
    }

    fn can_admit(&self, info: &JobInfo) -> bool {
        self.running.len() < self.max_requests
            && (info.websocket || self.running_for_host(&info.host) < self.max_requests_per_host)
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.ready_async.is_empty() && self.waiting_sync.is_empty()
    }

    /// Moves every waiting job the limits allow into the running set.
    ///
    /// Blocked synchronous calls go first, then queued jobs in FIFO order. Jobs
    /// that can't run yet keep their relative order.
    fn promote(&mut self) -> Vec<Admitted> {
        let mut admitted = Vec::new();

        let mut still_waiting = VecDeque::with_capacity(self.waiting_sync.len());
        while let Some(call) = self.waiting_sync.pop_front() {
            if self.can_admit(&call.info) {
                self.running.insert(call.id, call.info.clone());
                admitted.push(Admitted::Sync(call));
            } else {
                still_waiting.push_back(call);
            }
        }
        self.waiting_sync = still_waiting;

        let mut still_queued = VecDeque::with_capacity(self.ready_async.len());
        while let Some(job) = self.ready_async.pop_front() {
            if self.running.len() >= self.max_requests {
                still_queued.push_back(job);
                still_queued.extend(self.ready_async.drain(..));
                break;
            }
            if self.can_admit(&job.info) {
                self.running.insert(job.id, job.info.clone());
                admitted.push(Admitted::Async(job));
            } else {
                still_queued.push_back(job);
            }
        }
        self.ready_async = still_queued;

        admitted
    }

    /// Returns the idle callback if the dispatcher just became idle.
    fn settle(&mut self) -> Option<IdleCallback> {
        if self.busy && self.is_idle() {
            self.busy = false;
            return self.idle_callback.clone();
        }
        None
    }
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                executor,
                state: TrackedMutex::new(DispatcherState {
                    max_requests: DEFAULT_MAX_REQUESTS,
                    max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
                    ready_async: VecDeque::new(),
                    waiting_sync: VecDeque::new(),
                    running: IndexMap::new(),
                    idle_callback: None,
                    busy: false,
                }),
            }),
        }
    }

    pub fn with_limits(
        executor: Arc<dyn Executor>,
        max_requests: usize,
        max_requests_per_host: usize,
    ) -> Result<Self, InvalidLimit> {
        check_limit("max_requests", max_requests)?;
        check_limit("max_requests_per_host", max_requests_per_host)?;
        let dispatcher = Self::new(executor);
        {
            let mut state = dispatcher.inner.state.lock();
            state.max_requests = max_requests;
            state.max_requests_per_host = max_requests_per_host;
        }
        Ok(dispatcher)
    }

    pub fn max_requests(&self) -> usize {
        self.inner.state.lock().max_requests
    }

    pub fn max_requests_per_host(&self) -> usize {
        self.inner.state.lock().max_requests_per_host
    }

    /// Changes the overall limit; waiting jobs are promoted right away if it
    /// went up.
    pub fn set_max_requests(&self, max_requests: usize) -> Result<(), InvalidLimit> {
        check_limit("max_requests", max_requests)?;
        self.update(|state| state.max_requests = max_requests);
        Ok(())
    }

    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) -> Result<(), InvalidLimit> {
        check_limit("max_requests_per_host", max_requests_per_host)?;
        self.update(|state| state.max_requests_per_host = max_requests_per_host);
        Ok(())
    }

    /// Sets the callback invoked each time the dispatcher becomes idle.
    ///
    /// The callback is invoked without the dispatcher's lock held.
    pub fn set_idle_callback(&self, callback: Option<IdleCallback>) {
        self.inner.state.lock().idle_callback = callback;
    }

    /// Runs `job` as soon as the limits allow.
    pub fn enqueue(&self, job: Box<dyn AsyncJob>) -> JobId {
        let id = JobId::next();
        let info = job.info();
        log::debug!("enqueueing job {} for {}", id.0, info.tag);
        self.update(|state| {
            state.busy = true;
            state.ready_async.push_back(QueuedJob { id, info, job });
        });
        id
    }

    /// Runs `work` once admitted, counting it against the limits while it
    /// runs.
    ///
    /// Waiting for admission ends early with [`DispatchError::Cancelled`] if
    /// `info.cancel` is cancelled.
    pub async fn execute<F: Future>(
        &self,
        info: JobInfo,
        work: F,
    ) -> Result<F::Output, DispatchError> {
        let id = JobId::next();
        let cancel = info.cancel.clone();

        let admitted = {
            let mut state = self.inner.state.lock();
            state.busy = true;
            if state.can_admit(&info) && state.waiting_sync.is_empty() {
                state.running.insert(id, info);
                None
            } else {
                let (admit, admitted) = oneshot::channel();
                state.waiting_sync.push_back(WaitingCall { id, info, admit });
                Some(admitted)
            }
        };

        if let Some(admitted) = admitted {
            let outcome = tokio::select! {
                result = admitted => result.map_err(|_| DispatchError::Cancelled),
                () = cancel.cancelled() => Err(DispatchError::Cancelled),
            };
            if let Err(error) = outcome {
                if !self.withdraw_sync(id) {
                    // Admitted concurrently with the cancellation.
                    self.finished(id);
                }
                return Err(error);
            }
        }

        let _finished = FinishOnDrop {
            dispatcher: self.clone(),
            id,
        };
        Ok(work.await)
    }

    /// Reports a running job complete and starts whatever can run next.
    ///
    /// Unknown or already finished jobs are ignored.
    pub fn finished(&self, id: JobId) {
        let (admitted, idle) = {
            let mut state = self.inner.state.lock();
            if state.running.shift_remove(&id).is_none() {
                log::debug!("job {} finished more than once or never ran", id.0);
                return;
            }
            let admitted = state.promote();
            (admitted, state.settle())
        };
        self.start(admitted);
        if let Some(idle) = idle {
            idle();
        }
    }

    /// Cancels a job.
    ///
    /// A queued job is removed and rejected with [`DispatchError::Cancelled`].
    /// A running job only has its cancellation token flipped; it keeps its slot
    /// until it finishes.
    pub fn cancel(&self, id: JobId) {
        let (removed, idle) = {
            let mut state = self.inner.state.lock();
            if let Some(info) = state.running.get(&id) {
                info.cancel.cancel();
                return;
            }
            if let Some(waiting) = state.waiting_sync.iter().find(|call| call.id == id) {
                waiting.info.cancel.cancel();
                return;
            }
            let Some(index) = state.ready_async.iter().position(|job| job.id == id) else {
                return;
            };
            let removed = state.ready_async.remove(index);
            (removed, state.settle())
        };
        if let Some(job) = removed {
            job.job.reject(DispatchError::Cancelled);
        }
        if let Some(idle) = idle {
            idle();
        }
    }

    pub fn cancel_all(&self) {
        let (removed, idle) = {
            let mut state = self.inner.state.lock();
            for info in state.running.values() {
                info.cancel.cancel();
            }
            for call in &state.waiting_sync {
                call.info.cancel.cancel();
            }
            let removed: Vec<_> = state.ready_async.drain(..).collect();
            (removed, state.settle())
        };
        for job in removed {
            job.job.reject(DispatchError::Cancelled);
        }
        if let Some(idle) = idle {
            idle();
        }
    }

    pub fn running_jobs_count(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    /// Asynchronous jobs waiting for admission.
    pub fn queued_jobs_count(&self) -> usize {
        self.inner.state.lock().ready_async.len()
    }

    pub fn running_for_host(&self, host: &str) -> usize {
        self.inner.state.lock().running_for_host(host)
    }

    pub fn queued_tags(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.ready_async.iter().map(|job| job.info.tag.clone()).collect()
    }

    /// Tags of running jobs, in the order they were admitted.
    pub fn running_tags(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.running.values().map(|info| info.tag.clone()).collect()
    }

    fn update(&self, f: impl FnOnce(&mut DispatcherState)) {
        let (admitted, idle) = {
            let mut state = self.inner.state.lock();
            f(&mut state);
            let admitted = state.promote();
            (admitted, state.settle())
        };
        self.start(admitted);
        if let Some(idle) = idle {
            idle();
        }
    }

    fn withdraw_sync(&self, id: JobId) -> bool {
        let idle = {
            let mut state = self.inner.state.lock();
            let Some(index) = state.waiting_sync.iter().position(|call| call.id == id) else {
                return false;
            };
            state.waiting_sync.remove(index);
            state.settle()
        };
        if let Some(idle) = idle {
            idle();
        }
        true
    }

    fn start(&self, admitted: Vec<Admitted>) {
        for admitted in admitted {
            match admitted {
                Admitted::Sync(WaitingCall { id, admit, .. }) => {
                    if admit.send(()).is_err() {
                        // The waiting call went away.
                        self.finished(id);
                    }
                }
                Admitted::Async(QueuedJob { id, info, job }) => {
                    log::debug!("starting job {} for {}", id.0, info.tag);
                    let handle = JobHandle {
                        id,
                        info,
                        job,
                        dispatcher: self.clone(),
                    };
                    if let Err(handle) = self.inner.executor.execute(handle) {
                        handle.reject(DispatchError::Rejected);
                    }
                }
            }
        }
    }
}

impl LockProbe for Dispatcher {
    fn is_lock_held_by_current_thread(&self) -> bool {
        self.inner.state.is_held_by_current_thread()
    }
}

fn check_limit(name: &'static str, value: usize) -> Result<(), InvalidLimit> {
    if value == 0 {
        return Err(InvalidLimit { name });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::testutil::RecordingExecutor;

    struct FakeJob {
        info: JobInfo,
        rejections: Arc<Mutex<Vec<(String, DispatchError)>>>,
    }

    impl AsyncJob for FakeJob {
        fn info(&self) -> JobInfo {
            self.info.clone()
        }
        fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
        fn reject(self: Box<Self>, error: DispatchError) {
            self.rejections
                .lock()
                .expect("not poisoned")
                .push((self.info.tag.clone(), error));
        }
    }

    struct Fixture {
        executor: Arc<RecordingExecutor>,
        dispatcher: Dispatcher,
        rejections: Arc<Mutex<Vec<(String, DispatchError)>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let executor = Arc::new(RecordingExecutor::default());
            let dispatcher = Dispatcher::new(executor.clone());
            Self {
                executor,
                dispatcher,
                rejections: Default::default(),
            }
        }

        fn enqueue(&self, url: &str) -> JobId {
            self.enqueue_info(job_info(url))
        }

        fn enqueue_info(&self, info: JobInfo) -> JobId {
            self.dispatcher.enqueue(Box::new(FakeJob {
                info,
                rejections: self.rejections.clone(),
            }))
        }
    }

    fn job_info(url: &str) -> JobInfo {
        let host = url
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default();
        JobInfo::new(url, host)
    }

    #[test]
    fn max_requests_zero() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.dispatcher.set_max_requests(0),
            Err(InvalidLimit {
                name: "max_requests"
            })
        );
        assert_matches!(
            Dispatcher::with_limits(fixture.executor.clone(), 1, 0),
            Err(InvalidLimit {
                name: "max_requests_per_host"
            })
        );
    }

    #[test]
    fn enqueued_jobs_run_immediately_when_under_limits() {
        let fixture = Fixture::new();
        fixture.enqueue("http://a/1");
        assert_eq!(fixture.executor.started_tags(), ["http://a/1"]);
        assert_eq!(fixture.dispatcher.running_jobs_count(), 1);
        assert_eq!(fixture.dispatcher.queued_jobs_count(), 0);
    }

    #[test]
    fn max_requests_enforced() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests(3).expect("valid");
        for url in ["http://a/1", "http://a/2", "http://b/1", "http://b/2"] {
            fixture.enqueue(url);
        }
        assert_eq!(
            fixture.executor.started_tags(),
            ["http://a/1", "http://a/2", "http://b/1"]
        );
        assert_eq!(fixture.dispatcher.queued_tags(), ["http://b/2"]);
    }

    #[test]
    fn max_per_host_enforced_and_websockets_exempt() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests_per_host(2).expect("valid");
        fixture.enqueue("http://a/1");
        fixture.enqueue("http://a/2");
        fixture.enqueue("http://a/3");
        let mut websocket = job_info("http://a/ws");
        websocket.websocket = true;
        fixture.enqueue_info(websocket);

        assert_eq!(
            fixture.executor.started_tags(),
            ["http://a/1", "http://a/2", "http://a/ws"]
        );
        assert_eq!(fixture.dispatcher.queued_tags(), ["http://a/3"]);
        assert_eq!(fixture.dispatcher.running_for_host("a"), 3);
    }

    #[test]
    fn finishing_promotes_next_job_in_fifo_order() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests(1).expect("valid");
        fixture.enqueue("http://a/1");
        fixture.enqueue("http://b/1");
        fixture.enqueue("http://c/1");

        fixture.executor.finish_job("http://a/1");
        assert_eq!(fixture.dispatcher.running_tags(), ["http://b/1"]);
        assert_eq!(fixture.dispatcher.queued_tags(), ["http://c/1"]);
    }

    #[test]
    fn queued_jobs_for_a_busy_host_keep_their_order() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests_per_host(1).expect("valid");
        fixture.enqueue("http://a/1");
        fixture.enqueue("http://a/2");
        fixture.enqueue("http://b/1");
        fixture.enqueue("http://a/3");

        assert_eq!(fixture.executor.started_tags(), ["http://a/1", "http://b/1"]);
        fixture.executor.finish_job("http://a/1");
        assert_eq!(fixture.executor.started_tags(), ["http://a/2"]);
        assert_eq!(fixture.dispatcher.queued_tags(), ["http://a/3"]);
    }

    #[test]
    fn raising_limits_promotes_exactly_enough_jobs() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests(1).expect("valid");
        for url in ["http://a/1", "http://b/1", "http://c/1", "http://d/1", "http://e/1"] {
            fixture.enqueue(url);
        }
        assert_eq!(fixture.executor.started_tags(), ["http://a/1"]);

        fixture.dispatcher.set_max_requests(3).expect("valid");
        assert_eq!(fixture.executor.started_tags(), ["http://b/1", "http://c/1"]);
        assert_eq!(fixture.dispatcher.queued_tags(), ["http://d/1", "http://e/1"]);
    }

    #[test]
    fn raising_per_host_limit_promotes() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests_per_host(1).expect("valid");
        for url in ["http://a/1", "http://a/2", "http://a/3", "http://b/1"] {
            fixture.enqueue(url);
        }
        fixture.dispatcher.set_max_requests_per_host(2).expect("valid");
        assert_eq!(
            fixture.dispatcher.running_tags(),
            ["http://a/1", "http://b/1", "http://a/2"]
        );
    }

    #[test]
    fn cancelling_a_queued_job_rejects_only_that_job() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests(1).expect("valid");
        fixture.enqueue("http://a/1");
        let queued = fixture.enqueue("http://b/1");
        fixture.enqueue("http://c/1");

        fixture.dispatcher.cancel(queued);
        assert_eq!(fixture.dispatcher.queued_tags(), ["http://c/1"]);
        assert_eq!(
            *fixture.rejections.lock().expect("not poisoned"),
            [("http://b/1".to_owned(), DispatchError::Cancelled)]
        );

        fixture.executor.finish_job("http://a/1");
        assert_eq!(fixture.dispatcher.running_tags(), ["http://c/1"]);
    }

    #[test]
    fn cancelling_a_running_job_holds_its_slot_until_finished() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests(1).expect("valid");
        let info = job_info("http://a/1");
        let token = info.cancel.clone();
        let running = fixture.enqueue_info(info);
        fixture.enqueue("http://b/1");

        fixture.dispatcher.cancel(running);
        assert!(token.is_cancelled());
        assert_eq!(fixture.dispatcher.running_tags(), ["http://a/1"]);

        fixture.executor.finish_job("http://a/1");
        assert_eq!(fixture.dispatcher.running_tags(), ["http://b/1"]);

        // Cancelling something that already finished does nothing.
        fixture.dispatcher.cancel(running);
        assert_eq!(fixture.dispatcher.running_tags(), ["http://b/1"]);
    }

    #[test]
    fn idle_callback_fires_once_per_transition() {
        let fixture = Fixture::new();
        let idle_count = Arc::new(AtomicUsize::new(0));
        let dispatcher = fixture.dispatcher.clone();
        fixture.dispatcher.set_idle_callback(Some(Arc::new({
            let idle_count = idle_count.clone();
            move || {
                assert!(!dispatcher.is_lock_held_by_current_thread());
                idle_count.fetch_add(1, Ordering::SeqCst);
            }
        })));

        fixture.enqueue("http://a/1");
        fixture.enqueue("http://b/1");
        fixture.executor.finish_job("http://a/1");
        assert_eq!(idle_count.load(Ordering::SeqCst), 0);
        fixture.executor.finish_job("http://b/1");
        assert_eq!(idle_count.load(Ordering::SeqCst), 1);

        fixture.enqueue("http://c/1");
        fixture.executor.finish_job("http://c/1");
        assert_eq!(idle_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejected_jobs_are_reported_and_finished() {
        let fixture = Fixture::new();
        fixture.executor.shutdown();
        fixture.enqueue("http://a/1");

        assert_eq!(
            *fixture.rejections.lock().expect("not poisoned"),
            [("http://a/1".to_owned(), DispatchError::Rejected)]
        );
        assert_eq!(fixture.dispatcher.running_jobs_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_calls_wait_outside_the_queue() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests_per_host(1).expect("valid");
        fixture.enqueue("http://a/1");

        let dispatcher = fixture.dispatcher.clone();
        let sync_call = tokio::spawn(async move {
            dispatcher
                .execute(job_info("http://a/sync"), async { "done" })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sync_call.is_finished());
        assert_eq!(fixture.dispatcher.queued_jobs_count(), 0);
        assert_eq!(fixture.dispatcher.running_for_host("a"), 1);

        fixture.executor.finish_job("http://a/1");
        assert_eq!(sync_call.await.expect("no panic"), Ok("done"));
        assert_eq!(fixture.dispatcher.running_jobs_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_waiting_synchronous_call() {
        let fixture = Fixture::new();
        fixture.dispatcher.set_max_requests(1).expect("valid");
        fixture.enqueue("http://a/1");

        let info = job_info("http://b/sync");
        let cancel = info.cancel.clone();
        let (result, ()) = tokio::join!(
            fixture.dispatcher.execute(info, async { unreachable!("never admitted"); }),
            async { cancel.cancel() }
        );
        assert_eq!(result, Err::<(), _>(DispatchError::Cancelled));

        fixture.executor.finish_job("http://a/1");
        assert_eq!(fixture.dispatcher.running_jobs_count(), 0);
    }

    #[derive(Clone, Debug)]
    enum Step {
        Enqueue { host: usize },
        Finish { index: usize },
        SetMaxRequests(usize),
        SetMaxRequestsPerHost(usize),
    }

    const HOSTS: [&str; 3] = ["a", "b", "c"];

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (0..HOSTS.len()).prop_map(|host| Step::Enqueue { host }),
            3 => any::<usize>().prop_map(|index| Step::Finish { index }),
            1 => (1..6usize).prop_map(Step::SetMaxRequests),
            1 => (1..4usize).prop_map(Step::SetMaxRequestsPerHost),
        ]
    }

    proptest! {
        #[test]
        fn admission_respects_limits_and_order(steps in proptest::collection::vec(step(), 1..80)) {
            let fixture = Fixture::new();
            let dispatcher = &fixture.dispatcher;
            dispatcher.set_max_requests(3).expect("valid");
            dispatcher.set_max_requests_per_host(2).expect("valid");

            let mut enqueued: Vec<String> = Vec::new();
            let mut started: Vec<String> = Vec::new();
            let mut running: Vec<String> = Vec::new();
            for step in steps {
                match step {
                    Step::Enqueue { host } => {
                        let tag = format!("http://{}/{}", HOSTS[host], enqueued.len());
                        fixture.enqueue(&tag);
                        enqueued.push(tag);
                    }
                    Step::Finish { index } => {
                        if running.is_empty() {
                            continue;
                        }
                        let tag = running.remove(index % running.len());
                        fixture.executor.finish_job(&tag);
                    }
                    Step::SetMaxRequests(limit) => dispatcher.set_max_requests(limit).expect("valid"),
                    Step::SetMaxRequestsPerHost(limit) => {
                        dispatcher.set_max_requests_per_host(limit).expect("valid")
                    }
                }

                // Lowering a limit doesn't stop running jobs, but nothing new
                // starts beyond it.
                let newly_started = fixture.executor.started_tags();
                if !newly_started.is_empty() {
                    prop_assert!(dispatcher.running_jobs_count() <= dispatcher.max_requests());
                }
                for tag in &newly_started {
                    let host = job_info(tag).host;
                    prop_assert!(
                        dispatcher.running_for_host(&host) <= dispatcher.max_requests_per_host()
                    );
                }
                started.extend(newly_started.iter().cloned());
                running.extend(newly_started.iter().cloned());
                prop_assert_eq!(dispatcher.running_jobs_count(), running.len());

                // Nothing is left waiting that the limits would admit.
                let queued = dispatcher.queued_tags();
                for tag in &queued {
                    let host = job_info(tag).host;
                    prop_assert!(
                        dispatcher.running_jobs_count() >= dispatcher.max_requests()
                            || dispatcher.running_for_host(&host) >= dispatcher.max_requests_per_host()
                    );
                }
                prop_assert_eq!(started.len() + queued.len(), enqueued.len());

                // Jobs start in the order they were enqueued, per host and
                // within each promotion.
                let position = |tag: &String| enqueued.iter().position(|t| t == tag);
                prop_assert!(newly_started.iter().map(position).is_sorted());
                prop_assert!(queued.iter().map(position).is_sorted());
                for host in HOSTS {
                    prop_assert!(started
                        .iter()
                        .filter(|tag| job_info(tag).host == host)
                        .map(position)
                        .is_sorted());
                }
            }
        }
    }
}
