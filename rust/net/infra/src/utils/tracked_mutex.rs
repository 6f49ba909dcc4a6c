//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// A [`Mutex`] that knows whether the current thread holds it.
///
/// Not reentrant. The owner bookkeeping lets callbacks assert that they are
/// never invoked with the lock held.
#[derive(Debug, Default)]
pub struct TrackedMutex<T> {
    inner: Mutex<T>,
    owner: AtomicU64,
}

pub struct TrackedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a AtomicU64,
}

fn current_thread_token() -> u64 {
    static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

impl<T> TrackedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            owner: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) -> TrackedMutexGuard<'_, T> {
        let guard = self
            .inner
            .lock()
            .expect("no panics while the lock is held");
        self.owner.store(current_thread_token(), Ordering::Relaxed);
        TrackedMutexGuard {
            guard,
            owner: &self.owner,
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_token()
    }
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before `guard` is dropped, so no other thread can have taken
        // ownership yet.
        self.owner.store(0, Ordering::Relaxed);
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
