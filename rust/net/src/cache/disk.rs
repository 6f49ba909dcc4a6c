//
// Copyright 2026 Tether Contributors.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A size-bounded LRU store of entries on disk, made crash-safe by a journal.
//!
//! Each entry is two files, `<key>.0` (metadata) and `<key>.1` (body). The
//! journal records every change as one line:
//!
//! ```text
//! tether.DiskStore
//! 1
//!
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6 832 21054
//! DIRTY 335c4c6028171cfddfbaae1a9c313c52
//! CLEAN 335c4c6028171cfddfbaae1a9c313c52 3934 2342
//! REMOVE 335c4c6028171cfddfbaae1a9c313c52
//! DIRTY 1ab96a171faeeee38496d8b330771a7a
//! READ 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! ```
//!
//! `DIRTY` precedes a write and is followed by `CLEAN` (with the two file
//! lengths) once the files are in place, or `REMOVE` if the write failed. An
//! entry left dirty by a crash is discarded on the next open. `READ` only
//! records recency. Replay rebuilds the LRU order; a journal that can't be
//! replayed gets the whole directory wiped.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write as _};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use indexmap::IndexMap;
use itertools::Itertools as _;

use crate::cache::lock::DirectoryLock;

const JOURNAL_FILE: &str = "journal";
const JOURNAL_FILE_TMP: &str = "journal.tmp";
const MAGIC: &str = "tether.DiskStore";
const VERSION: &str = "1";

/// Once this many journal lines no longer describe live state (and they
/// outnumber the live entries), the journal is rewritten from scratch.
pub(crate) const COMPACTION_THRESHOLD: usize = 2000;

const METADATA: usize = 0;
const BODY: usize = 1;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum JournalError {
    /// {0}
    Io(#[from] io::Error),
    /// corrupt journal: {0}
    Corrupt(&'static str),
}

/// Lengths of an entry's metadata and body files.
type Lengths = [u64; 2];

#[derive(Debug)]
pub(crate) struct DiskStore {
    directory: PathBuf,
    max_size: u64,
    /// Least recently used first.
    entries: IndexMap<String, Lengths>,
    size: u64,
    journal: LineWriter<File>,
    redundant_op_count: usize,
}

impl DiskStore {
    /// Opens the store in `directory`, replaying its journal if there is one.
    pub(crate) fn open(directory: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(directory)?;

        let (entries, size) = match read_journal(&directory.join(JOURNAL_FILE)) {
            Ok(replayed) => replayed,
            Err(JournalError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                (IndexMap::new(), 0)
            }
            Err(e) => {
                log::warn!(
                    "cache directory {} is being cleared: {e}",
                    directory.display()
                );
                clear_directory(directory)?;
                (IndexMap::new(), 0)
            }
        };

        remove_stray_files(directory, &entries)?;
        let journal = write_fresh_journal(directory, &entries)?;
        log::debug!(
            "opened cache directory {} with {} entries ({size} bytes)",
            directory.display(),
            entries.len()
        );

        let mut store = Self {
            directory: directory.to_owned(),
            max_size,
            entries,
            size,
            journal,
            redundant_op_count: 0,
        };
        store.trim_to_size()?;
        Ok(store)
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Reads the metadata and body stored under `key`, marking it most
    /// recently used.
    ///
    /// Files that have disappeared from under the store make the entry absent.
    pub(crate) fn get(&mut self, key: &str) -> io::Result<Option<(Vec<u8>, Bytes)>> {
        let Some(index) = self.entries.get_index_of(key) else {
            return Ok(None);
        };

        let read = fs::read(self.entry_file(key, METADATA))
            .and_then(|metadata| Ok((metadata, fs::read(self.entry_file(key, BODY))?)));
        let (metadata, body) = match read {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("cache entry {key} lost its files");
                self.remove(key)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.append_journal(&format!("READ {key}"))?;
        self.redundant_op_count += 1;
        self.compact_if_needed()?;
        Ok(Some((metadata, body.into())))
    }

    /// Stores a new entry, replacing any previous one under `key`.
    pub(crate) fn write(&mut self, key: &str, metadata: &[u8], body: &[u8]) -> io::Result<()> {
        check_key(key)?;
        self.append_journal(&format!("DIRTY {key}"))?;

        let written = write_atomically(&self.entry_file(key, METADATA), metadata)
            .and_then(|()| write_atomically(&self.entry_file(key, BODY), body));
        if let Err(e) = written {
            self.abort(key);
            return Err(e);
        }
        self.commit(key, [metadata.len() as u64, body.len() as u64])
    }

    /// Replaces the metadata of an existing entry, keeping its body.
    ///
    /// Returns `false` if there is no entry under `key`.
    pub(crate) fn write_metadata(&mut self, key: &str, metadata: &[u8]) -> io::Result<bool> {
        let Some(&[_, body_len]) = self.entries.get(key) else {
            return Ok(false);
        };
        self.append_journal(&format!("DIRTY {key}"))?;
        if let Err(e) = write_atomically(&self.entry_file(key, METADATA), metadata) {
            self.abort(key);
            return Err(e);
        }
        self.commit(key, [metadata.len() as u64, body_len])?;
        Ok(true)
    }

    pub(crate) fn remove(&mut self, key: &str) -> io::Result<bool> {
        let Some(lengths) = self.entries.shift_remove(key) else {
            return Ok(false);
        };
        self.size = self.size.saturating_sub(entry_size(&lengths));
        self.delete_entry_files(key)?;
        self.append_journal(&format!("REMOVE {key}"))?;
        self.redundant_op_count += 2;
        self.compact_if_needed()?;
        Ok(true)
    }

    pub(crate) fn evict_all(&mut self) -> io::Result<()> {
        let keys = self.entries.keys().cloned().collect_vec();
        for key in keys {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Removes everything the store put in its directory.
    pub(crate) fn delete(self) -> io::Result<()> {
        let directory = self.directory.clone();
        drop(self);
        clear_directory(&directory)
    }

    fn commit(&mut self, key: &str, lengths: Lengths) -> io::Result<()> {
        if let Some(previous) = self.entries.shift_remove(key) {
            self.size = self.size.saturating_sub(entry_size(&previous));
            self.redundant_op_count += 1;
        }
        self.entries.insert(key.to_owned(), lengths);
        self.size = self.size.saturating_add(entry_size(&lengths));
        self.append_journal(&format!("CLEAN {key} {} {}", lengths[0], lengths[1]))?;
        // The DIRTY line is redundant now.
        self.redundant_op_count += 1;

        self.trim_to_size()?;
        self.compact_if_needed()
    }

    /// Best-effort cleanup of a write that didn't complete.
    fn abort(&mut self, key: &str) {
        if let Some(lengths) = self.entries.shift_remove(key) {
            self.size = self.size.saturating_sub(entry_size(&lengths));
        }
        if let Err(e) = self
            .delete_entry_files(key)
            .and_then(|()| self.append_journal(&format!("REMOVE {key}")))
        {
            log::warn!("failed to clean up aborted cache write for {key}: {e}");
        }
        self.redundant_op_count += 2;
    }

    fn trim_to_size(&mut self) -> io::Result<()> {
        while self.size > self.max_size {
            let Some(eldest) = self.entries.keys().next().cloned() else {
                break;
            };
            log::debug!("evicting cache entry {eldest}");
            self.remove(&eldest)?;
        }
        Ok(())
    }

    fn compact_if_needed(&mut self) -> io::Result<()> {
        if self.redundant_op_count >= COMPACTION_THRESHOLD
            && self.redundant_op_count >= self.entries.len()
        {
            self.journal = write_fresh_journal(&self.directory, &self.entries)?;
            self.redundant_op_count = 0;
        }
        Ok(())
    }

    fn append_journal(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.journal, "{line}")
    }

    fn entry_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}"))
    }

    fn delete_entry_files(&self, key: &str) -> io::Result<()> {
        for index in [METADATA, BODY] {
            match fs::remove_file(self.entry_file(key, index)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn check_key(key: &str) -> io::Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 120
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if !valid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid cache key {key:?}"),
        ));
    }
    Ok(())
}

/// Writes `contents` next to `path` and renames it into place, so readers see
/// either the old file or the new one.
fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

fn entry_size([metadata_len, body_len]: &Lengths) -> u64 {
    metadata_len.saturating_add(*body_len)
}

/// Replays the journal at `path`, returning the live entries (least recently
/// used first) and their total size.
fn read_journal(path: &Path) -> Result<(IndexMap<String, Lengths>, u64), JournalError> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData => JournalError::Corrupt("not UTF-8"),
        _ => JournalError::Io(e),
    })?;

    // A crash mid-append leaves a partial last line, which is ignored.
    let complete = match text.rfind('\n') {
        Some(end) => &text[..=end],
        None => "",
    };
    let mut lines = complete.lines();
    if lines.next() != Some(MAGIC) || lines.next() != Some(VERSION) || lines.next() != Some("") {
        return Err(JournalError::Corrupt("bad header"));
    }

    let mut entries = IndexMap::<String, Lengths>::new();
    let mut dirty = HashSet::new();
    for line in lines {
        let fields = line.split(' ').collect_vec();
        match fields.as_slice() {
            ["DIRTY", key] => {
                dirty.insert(key.to_string());
            }
            ["CLEAN", key, metadata_len, body_len] => {
                let lengths = [parse_length(metadata_len)?, parse_length(body_len)?];
                dirty.remove(*key);
                entries.shift_remove(*key);
                entries.insert(key.to_string(), lengths);
            }
            ["READ", key] => {
                if let Some(index) = entries.get_index_of(*key) {
                    let last = entries.len() - 1;
                    entries.move_index(index, last);
                }
            }
            ["REMOVE", key] => {
                dirty.remove(*key);
                entries.shift_remove(*key);
            }
            _ => return Err(JournalError::Corrupt("unexpected line")),
        }
    }

    for key in dirty {
        // The write never completed; whatever was there before is suspect too.
        entries.shift_remove(&key);
    }

    let size = entries
        .values()
        .try_fold(0u64, |total, [metadata_len, body_len]| {
            total.checked_add(*metadata_len)?.checked_add(*body_len)
        })
        .ok_or(JournalError::Corrupt("entry lengths overflow"))?;
    Ok((entries, size))
}

fn parse_length(field: &str) -> Result<u64, JournalError> {
    field
        .parse()
        .map_err(|_| JournalError::Corrupt("bad length"))
}

/// Writes a journal describing exactly `entries` and opens it for appending.
fn write_fresh_journal(
    directory: &Path,
    entries: &IndexMap<String, Lengths>,
) -> io::Result<LineWriter<File>> {
    let tmp = directory.join(JOURNAL_FILE_TMP);
    let mut contents = format!("{MAGIC}\n{VERSION}\n\n");
    for (key, [metadata_len, body_len]) in entries {
        contents.push_str(&format!("CLEAN {key} {metadata_len} {body_len}\n"));
    }
    fs::write(&tmp, contents)?;
    let path = directory.join(JOURNAL_FILE);
    fs::rename(&tmp, &path)?;
    Ok(LineWriter::new(OpenOptions::new().append(true).open(path)?))
}

/// Deletes files that no live entry accounts for: leftovers of interrupted
/// writes and entries dropped during replay.
fn remove_stray_files(directory: &Path, entries: &IndexMap<String, Lengths>) -> io::Result<()> {
    for dir_entry in fs::read_dir(directory)? {
        let path = dir_entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name == JOURNAL_FILE || DirectoryLock::is_lock_file(&path) {
            continue;
        }
        let live = name
            .rsplit_once('.')
            .is_some_and(|(key, index)| (index == "0" || index == "1") && entries.contains_key(key));
        if !live && path.is_file() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Removes every file in `directory` but the lock file.
pub(crate) fn clear_directory(directory: &Path) -> io::Result<()> {
    for dir_entry in fs::read_dir(directory)? {
        let path = dir_entry?.path();
        if DirectoryLock::is_lock_file(&path) {
            continue;
        }
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
