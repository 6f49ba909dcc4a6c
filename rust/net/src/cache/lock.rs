//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use crate::cache::CacheError;

/// Who else is using a cache directory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum LockContention {
    #[strum(to_string = "in this process")]
    SameProcess,
    #[strum(to_string = "in another process")]
    OtherProcess,
}

const LOCK_FILE: &str = "journal.lock";

/// Canonical paths of the directories locked by this process.
static LOCKED_DIRECTORIES: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Default::default);

/// Exclusive use of a cache directory.
///
/// Taken in two steps: [`acquire`](Self::acquire) claims the directory within
/// this process, [`lock_across_processes`](Self::lock_across_processes) adds an
/// advisory file lock that other processes respect. Both are released on drop.
#[derive(Debug)]
pub(crate) struct DirectoryLock {
    directory: PathBuf,
    file: Option<File>,
}

impl DirectoryLock {
    pub(crate) fn acquire(directory: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(directory)?;
        let directory = directory.canonicalize()?;

        let mut locked = LOCKED_DIRECTORIES.lock().expect("not poisoned");
        if !locked.insert(directory.clone()) {
            return Err(CacheError::Locked {
                path: directory,
                contention: LockContention::SameProcess,
            });
        }
        Ok(Self {
            directory,
            file: None,
        })
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    #[cfg(test)]
    pub(crate) fn is_locked_across_processes(&self) -> bool {
        self.file.is_some()
    }

    pub(crate) fn lock_across_processes(&mut self) -> Result<(), CacheError> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.directory.join(LOCK_FILE))?;
        match file.try_lock() {
            Ok(()) => {}
            Err(std::fs::TryLockError::WouldBlock) => {
                return Err(CacheError::Locked {
                    path: self.directory.clone(),
                    contention: LockContention::OtherProcess,
                })
            }
            Err(std::fs::TryLockError::Error(e)) => return Err(e.into()),
        }
        self.file = Some(file);
        Ok(())
    }

    pub(crate) fn is_lock_file(path: &Path) -> bool {
        path.file_name().is_some_and(|name| name == LOCK_FILE)
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                log::warn!("failed to unlock cache directory: {e}");
            }
        }
        LOCKED_DIRECTORIES
            .lock()
            .expect("not poisoned")
            .remove(&self.directory);
    }
}
