//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! An on-disk HTTP response cache.
//!
//! A [`Cache`] claims its directory in two steps. [`Cache::open`] fails fast if
//! another `Cache` in this process has the same directory. The first real use
//! (or an explicit [`Cache::initialize`]) then takes a file lock that keeps
//! other processes out, and replays the journal.
//!
//! Reads never fail: anything that can't be read back cleanly is a miss.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use http::{Method, Uri};
use sha2::{Digest as _, Sha256};

use crate::http::{combine_headers, Request, Response, ResponseSource};

mod disk;
mod entry;
mod lock;
mod strategy;

use disk::DiskStore;
use entry::EntryMetadata;
use lock::DirectoryLock;
pub use lock::LockContention;
pub use strategy::{invalidates_cache, is_cacheable, CacheControl, CacheStrategy};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum CacheError {
    /// cache directory {path:?} is already in use {contention}
    Locked {
        path: PathBuf,
        contention: LockContention,
    },
    /// cache I/O failed: {0}
    Io(#[from] io::Error),
    /// the cache has been closed
    Closed,
}

impl CacheError {
    pub fn lock_contention(&self) -> Option<LockContention> {
        match self {
            CacheError::Locked { contention, .. } => Some(*contention),
            CacheError::Io(_) | CacheError::Closed => None,
        }
    }
}

pub struct Cache {
    directory: PathBuf,
    max_size: u64,
    state: Mutex<CacheState>,
}

struct CacheState {
    /// `None` once closed.
    lock: Option<DirectoryLock>,
    /// `None` until initialized.
    store: Option<DiskStore>,
    stats: CacheStats,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    request_count: usize,
    network_count: usize,
    hit_count: usize,
    write_success_count: usize,
    write_abort_count: usize,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("directory", &self.directory)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl CacheState {
    fn initialized_store(&mut self, max_size: u64) -> Result<&mut DiskStore, CacheError> {
        let lock = self.lock.as_mut().ok_or(CacheError::Closed)?;
        if self.store.is_none() {
            lock.lock_across_processes()?;
            self.store = Some(DiskStore::open(lock.directory(), max_size)?);
        }
        Ok(self.store.as_mut().expect("just initialized"))
    }
}

impl Cache {
    /// Claims `directory` for a cache of at most `max_size` bytes.
    ///
    /// Only contention within this process is detected here; see
    /// [`initialize`](Self::initialize).
    pub fn open(directory: impl AsRef<Path>, max_size: u64) -> Result<Self, CacheError> {
        let lock = DirectoryLock::acquire(directory.as_ref())?;
        Ok(Self {
            directory: lock.directory().to_owned(),
            max_size,
            state: Mutex::new(CacheState {
                lock: Some(lock),
                store: None,
                stats: CacheStats::default(),
            }),
        })
    }

    /// Locks the directory against other processes and loads the journal.
    ///
    /// Happens implicitly on first use; calling it again is a no-op.
    pub fn initialize(&self) -> Result<(), CacheError> {
        self.with_store(|_| Ok(()))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn size(&self) -> Result<u64, CacheError> {
        self.with_store(|store| Ok(store.size()))
    }

    /// The cache key of `url`: the hex SHA-256 of its canonical text.
    ///
    /// The scheme and host are lowercased and an empty path is written as `/`,
    /// so spellings of the same resource share an entry.
    pub fn key(url: &Uri) -> String {
        let mut text = String::new();
        if let Some(scheme) = url.scheme_str() {
            text.push_str(&scheme.to_ascii_lowercase());
            text.push_str("://");
        }
        if let Some(authority) = url.authority() {
            text.push_str(&authority.as_str().to_ascii_lowercase());
        }
        match url.path() {
            "" => text.push('/'),
            path => text.push_str(path),
        }
        if let Some(query) = url.query() {
            text.push('?');
            text.push_str(query);
        }
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    /// The stored response for `request`, if there is one that can be read and
    /// that was stored for an equivalent request.
    pub fn get(&self, request: &Request) -> Option<Response> {
        let key = Self::key(&request.url);
        let (metadata, body) = match self.with_store(|store| Ok(store.get(&key)?)) {
            Ok(Some(contents)) => contents,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("cache read failed: {e}");
                return None;
            }
        };

        let decoded = std::str::from_utf8(&metadata)
            .map_err(|_| entry::EntryError::Malformed("encoding"))
            .and_then(EntryMetadata::decode);
        let metadata = match decoded {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("cache entry {key} is unreadable ({e}); treating it as a miss");
                return None;
            }
        };
        if !metadata.matches(request) {
            return None;
        }
        Some(metadata.into_response(body))
    }

    /// Stores `response` for later requests like the one that produced it.
    ///
    /// Responses to requests that invalidate the cache remove the stored entry
    /// instead. Returns whether the response was stored.
    pub fn put(&self, response: &Response) -> bool {
        let request = &response.request;
        if invalidates_cache(&request.method) {
            self.invalidate_for(&request.method, &request.url);
            return false;
        }
        if request.method != Method::GET {
            // Caching anything else is possible but rarely pays off.
            return false;
        }
        if response.has_vary_all() {
            return false;
        }

        let key = Self::key(&request.url);
        let metadata = EntryMetadata::from_response(response).encode();
        let written =
            self.with_store(|store| Ok(store.write(&key, metadata.as_bytes(), &response.body)?));
        let mut state = self.state();
        match written {
            Ok(()) => {
                state.stats.write_success_count += 1;
                true
            }
            Err(e) => {
                log::warn!("failed to store response for cache entry {key}: {e}");
                state.stats.write_abort_count += 1;
                false
            }
        }
    }

    /// Merges a `304 Not Modified` into the stored response it validated,
    /// stores the merged metadata, and returns the merged response.
    pub fn update(&self, cached: &Response, network: &Response) -> Response {
        let merged = Response {
            request: network.request.clone(),
            protocol: network.protocol,
            status: cached.status,
            headers: combine_headers(&cached.headers, &network.headers),
            body: cached.body.clone(),
            handshake: network.handshake.clone().or_else(|| cached.handshake.clone()),
            sent_request_at: network.sent_request_at,
            received_response_at: network.received_response_at,
            source: ResponseSource::ConditionalCache,
        };

        let key = Self::key(&merged.request.url);
        let metadata = EntryMetadata::from_response(&merged).encode();
        match self.with_store(|store| Ok(store.write_metadata(&key, metadata.as_bytes())?)) {
            Ok(true) => {}
            Ok(false) => log::debug!("cache entry {key} disappeared before it could be updated"),
            Err(e) => log::warn!("failed to update cache entry {key}: {e}"),
        }
        merged
    }

    pub fn remove(&self, request: &Request) -> Result<bool, CacheError> {
        let key = Self::key(&request.url);
        self.with_store(|store| Ok(store.remove(&key)?))
    }

    /// Drops the stored response for `url` if a `method` request makes it
    /// obsolete. Returns whether `method` invalidates.
    pub fn invalidate_for(&self, method: &Method, url: &Uri) -> bool {
        if !invalidates_cache(method) {
            return false;
        }
        let key = Self::key(url);
        if let Err(e) = self.with_store(|store| Ok(store.remove(&key)?)) {
            log::warn!("failed to invalidate cache entry {key}: {e}");
        }
        true
    }

    pub fn evict_all(&self) -> Result<(), CacheError> {
        self.with_store(|store| Ok(store.evict_all()?))
    }

    /// Releases the directory. Later operations fail or miss.
    pub fn close(&self) {
        let mut state = self.state();
        state.store = None;
        if state.lock.take().is_some() {
            log::info!("closed cache in {}", self.directory.display());
        }
    }

    /// Closes the cache and removes everything it stored.
    pub fn delete(&self) -> Result<(), CacheError> {
        let mut state = self.state();
        if state.lock.is_none() {
            return Err(CacheError::Closed);
        }
        match state.store.take() {
            Some(store) => store.delete()?,
            None => disk::clear_directory(&self.directory)?,
        }
        state.lock = None;
        Ok(())
    }

    /// Records that `strategy` was used to answer a request.
    pub fn track_response(&self, strategy: &CacheStrategy) {
        let mut state = self.state();
        state.stats.request_count += 1;
        if strategy.network_request.is_some() {
            state.stats.network_count += 1;
        } else if strategy.cache_response.is_some() {
            state.stats.hit_count += 1;
        }
    }

    pub fn track_conditional_cache_hit(&self) {
        self.state().stats.hit_count += 1;
    }

    pub fn request_count(&self) -> usize {
        self.stats().request_count
    }

    pub fn network_count(&self) -> usize {
        self.stats().network_count
    }

    pub fn hit_count(&self) -> usize {
        self.stats().hit_count
    }

    pub fn write_success_count(&self) -> usize {
        self.stats().write_success_count
    }

    pub fn write_abort_count(&self) -> usize {
        self.stats().write_abort_count
    }

    fn stats(&self) -> CacheStats {
        self.state().stats
    }

    /// Locks the cache state.
    ///
    /// If an operation panicked while holding the lock, the in-memory store is
    /// dropped so that the next use replays the journal instead of trusting
    /// state that may be half-updated.
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!(
                "cache in {} was interrupted by a panic; reloading it",
                self.directory.display()
            );
            self.state.clear_poison();
            let mut state = poisoned.into_inner();
            state.store = None;
            state
        })
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&mut DiskStore) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut state = self.state();
        f(state.initialized_store(self.max_size)?)
    }
}

#[cfg(test)]
mod test {
    use std::fs::File;

    use assert_matches::assert_matches;
    use chrono::{TimeDelta, Utc};
    use http::header::{self, HeaderValue};
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::http::format_http_date;

    const URL: &str = "http://a.example/page";

    fn response(body: &'static str) -> Response {
        let expires = format_http_date(Utc::now() + TimeDelta::hours(1));
        Response::new(Request::get(Uri::from_static(URL)), StatusCode::OK)
            .with_header(
                header::EXPIRES,
                HeaderValue::from_str(&expires).expect("valid"),
            )
            .with_body(body)
    }

    #[test_log::test]
    fn second_open_in_process_fails_until_first_is_closed() {
        let dir = tempfile::tempdir().expect("can create");
        let first = Cache::open(dir.path(), 1024).expect("unlocked");

        let error = Cache::open(dir.path(), 1024).expect_err("locked");
        assert_eq!(error.lock_contention(), Some(LockContention::SameProcess));
        assert!(error.to_string().contains("in this process"), "{error}");

        first.close();
        Cache::open(dir.path(), 1024).expect("unlocked again");
    }

    #[test]
    fn different_directories_do_not_contend() {
        let a = tempfile::tempdir().expect("can create");
        let b = tempfile::tempdir().expect("can create");
        let a = Cache::open(a.path(), 1024).expect("unlocked");
        let b = Cache::open(b.path(), 1024).expect("unlocked");
        a.initialize().expect("unlocked");
        b.initialize().expect("unlocked");
    }

    #[test]
    fn other_processes_are_locked_out_only_after_initialization() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        let lock_file = dir.path().join("journal.lock");
        assert!(!lock_file.exists());

        cache.initialize().expect("unlocked");
        // A second handle stands in for another process's.
        let other = File::open(&lock_file).expect("exists");
        assert_matches!(other.try_lock(), Err(std::fs::TryLockError::WouldBlock));

        cache.close();
        other.try_lock().expect("released");
    }

    #[test]
    fn initialization_fails_while_another_process_holds_the_directory() {
        let dir = tempfile::tempdir().expect("can create");
        let other = File::create(dir.path().join("journal.lock")).expect("can create");
        other.try_lock().expect("unlocked");

        let cache = Cache::open(dir.path(), 1024).expect("unlocked in this process");
        let error = cache.initialize().expect_err("locked");
        assert_eq!(error.lock_contention(), Some(LockContention::OtherProcess));
        assert_eq!(cache.get(&Request::get(Uri::from_static(URL))).map(|r| r.body), None);
    }

    #[test_log::test]
    fn stores_and_serves_responses() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        assert!(cache.put(&response("hello")));
        assert_eq!(cache.write_success_count(), 1);

        let served = cache
            .get(&Request::get(Uri::from_static(URL)))
            .expect("stored");
        assert_eq!(served.body, "hello");
        assert_eq!(served.source, ResponseSource::Cache);
        assert!(cache.size().expect("open") > 5);
        assert!(cache
            .get(&Request::get(Uri::from_static("http://a.example/other")))
            .is_none());
    }

    #[test_log::test]
    fn truncated_metadata_is_a_miss() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        assert!(cache.put(&response("hello")));

        let metadata_file = cache
            .directory()
            .join(format!("{}.0", Cache::key(&Uri::from_static(URL))));
        let metadata = std::fs::read(&metadata_file).expect("exists");
        std::fs::write(&metadata_file, &metadata[..metadata.len() / 4]).expect("can write");

        assert!(cache.get(&Request::get(Uri::from_static(URL))).is_none());
    }

    #[test]
    fn refuses_vary_star_and_other_methods() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");

        let varies = response("x").with_header(header::VARY, HeaderValue::from_static("*"));
        assert!(!cache.put(&varies));

        let mut head = response("x");
        head.request.method = Method::HEAD;
        assert!(!cache.put(&head));
        assert_eq!(cache.write_success_count(), 0);
    }

    #[test]
    fn invalidating_requests_remove_entries() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        assert!(cache.put(&response("hello")));

        let mut post = response("created");
        post.request.method = Method::POST;
        assert!(!cache.put(&post));
        assert!(cache.get(&Request::get(Uri::from_static(URL))).is_none());
        assert!(!cache.invalidate_for(&Method::GET, &Uri::from_static(URL)));
    }

    #[test]
    fn update_merges_headers_and_keeps_the_body() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        let stored = response("hello").with_header(header::ETAG, HeaderValue::from_static("\"v1\""));
        assert!(cache.put(&stored));

        let not_modified = Response::new(stored.request.clone(), StatusCode::NOT_MODIFIED)
            .with_header(header::ETAG, HeaderValue::from_static("\"v2\""));
        let merged = cache.update(&stored, &not_modified);
        assert_eq!(merged.status, StatusCode::OK);
        assert_eq!(merged.body, "hello");
        assert_eq!(merged.source, ResponseSource::ConditionalCache);

        let served = cache
            .get(&Request::get(Uri::from_static(URL)))
            .expect("stored");
        assert_eq!(served.header(&header::ETAG), Some("\"v2\""));
        assert_eq!(served.body, "hello");
    }

    #[test]
    fn counts_requests_by_outcome() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        let request = Request::get(Uri::from_static(URL));

        cache.track_response(&CacheStrategy::compute(Utc::now(), &request, None));
        let cached = Some(response("hello"));
        cache.track_response(&CacheStrategy::compute(Utc::now(), &request, cached));
        cache.track_conditional_cache_hit();

        assert_eq!(cache.request_count(), 2);
        assert_eq!(cache.network_count(), 1);
        assert_eq!(cache.hit_count(), 2);
    }

    #[test]
    fn closed_cache_misses_and_refuses_writes() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        assert!(cache.put(&response("hello")));
        cache.close();

        assert!(cache.get(&Request::get(Uri::from_static(URL))).is_none());
        assert!(!cache.put(&response("hello")));
        assert_eq!(cache.write_abort_count(), 1);
        assert_matches!(cache.size(), Err(CacheError::Closed));
    }

    #[test]
    fn delete_removes_stored_entries() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        assert!(cache.put(&response("hello")));
        cache.delete().expect("deletes");

        let reopened = Cache::open(dir.path(), 1024).expect("released");
        assert!(reopened.get(&Request::get(Uri::from_static(URL))).is_none());
        assert_eq!(reopened.size().expect("open"), 0);
    }

    #[test_log::test]
    fn journal_with_overflowing_lengths_is_discarded() {
        let dir = tempfile::tempdir().expect("can create");
        std::fs::write(
            dir.path().join("journal"),
            "tether.DiskStore\n1\n\nCLEAN aa 18446744073709551615 1\nCLEAN bb 5 5\n",
        )
        .expect("can write");

        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        cache.initialize().expect("replays");
        assert_eq!(cache.size().expect("open"), 0);
        assert!(cache.get(&Request::get(Uri::from_static(URL))).is_none());

        assert!(cache.put(&response("hello")));
        assert!(cache.get(&Request::get(Uri::from_static(URL))).is_some());
    }

    #[test_log::test]
    fn panic_while_holding_the_state_is_recovered() {
        let dir = tempfile::tempdir().expect("can create");
        let cache = Cache::open(dir.path(), 1024).expect("unlocked");
        assert!(cache.put(&response("hello")));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.with_store(|_| -> Result<(), CacheError> { panic!("interrupted") })
        }));
        assert!(result.is_err());
        assert!(cache.state.is_poisoned());

        let served = cache
            .get(&Request::get(Uri::from_static(URL)))
            .expect("reloaded from the journal");
        assert_eq!(served.body, "hello");
        assert!(!cache.state.is_poisoned());
        assert!(cache.put(&response("again")));
        assert_eq!(cache.write_success_count(), 2);
    }

    #[test_case("http://a.example", "http://a.example/"; "empty path")]
    #[test_case("HTTP://A.Example/page", "http://a.example/page"; "case of scheme and host")]
    fn equivalent_urls_share_a_key(a: &'static str, b: &'static str) {
        assert_eq!(Cache::key(&Uri::from_static(a)), Cache::key(&Uri::from_static(b)));
    }

    #[test_case("http://a.example/page", "http://a.example/Page"; "path case")]
    #[test_case("http://a.example/page", "http://a.example/page?q=1"; "query")]
    #[test_case("http://a.example/", "https://a.example/"; "scheme")]
    #[test_case("http://a.example/", "http://a.example:8080/"; "port")]
    fn distinct_urls_have_distinct_keys(a: &'static str, b: &'static str) {
        assert_ne!(Cache::key(&Uri::from_static(a)), Cache::key(&Uri::from_static(b)));
    }
}
