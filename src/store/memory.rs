//! In-memory artifact storage.
//!
//! Artifacts are byte blocks in a shared concurrent map. The producer lock
//! is a separate short-lived in-progress marker per key, and a tracked index
//! of live keys makes the sweep enumerable (the backing store is treated as
//! non-enumerable, mirroring a shared cache deployment).

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{ArtifactStore, WriteHandle};
use crate::error::{BalerError, Result};

pub struct MemoryStore {
    /// Committed artifacts by key
    blocks: Arc<DashMap<String, Arc<Vec<u8>>>>,
    /// Keys of committed artifacts, for the sweep
    index: Arc<Mutex<FxHashSet<String>>>,
    /// Producer locks: key → instant the write began
    in_progress: Arc<DashMap<String, Instant>>,
    /// Staleness bound for abandoned in-progress markers
    max_build: Duration,
}

impl MemoryStore {
    pub fn new(max_build: Duration) -> Self {
        Self {
            blocks: Arc::new(DashMap::new()),
            index: Arc::new(Mutex::new(FxHashSet::default())),
            in_progress: Arc::new(DashMap::new()),
            max_build,
        }
    }

    fn missing(key: &str) -> BalerError {
        BalerError::io(
            PathBuf::from(key),
            io::Error::new(io::ErrorKind::NotFound, "artifact not in memory store"),
        )
    }
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, key: &str) -> bool {
        self.blocks.contains_key(key)
    }

    fn open(&self, key: &str) -> Result<Vec<u8>> {
        self.blocks
            .get(key)
            .map(|block| block.as_ref().clone())
            .ok_or_else(|| Self::missing(key))
    }

    fn len(&self, key: &str) -> Result<u64> {
        self.blocks
            .get(key)
            .map(|block| block.len() as u64)
            .ok_or_else(|| Self::missing(key))
    }

    fn start_write(&self, key: &str) -> Result<Option<Box<dyn WriteHandle>>> {
        match self.in_progress.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().elapsed() < self.max_build {
                    // A live producer owns this key
                    return Ok(None);
                }
                // Marker outlived the maximum build duration: abandoned
                crate::debug!("store"; "seizing stale in-progress marker for {key}");
                occupied.insert(Instant::now());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Instant::now());
            }
        }

        Ok(Some(Box::new(MemoryWriteHandle {
            key: key.to_string(),
            buffer: Vec::new(),
            blocks: Arc::clone(&self.blocks),
            index: Arc::clone(&self.index),
            in_progress: Arc::clone(&self.in_progress),
            committed: false,
        })))
    }

    fn clear(&self, extension: &str) -> usize {
        let keys: Vec<String> = {
            let mut index = self.index.lock();
            let matching: Vec<String> = index
                .iter()
                .filter(|key| key.ends_with(extension))
                .cloned()
                .collect();
            for key in &matching {
                index.remove(key);
            }
            matching
        };

        for key in &keys {
            self.blocks.remove(key);
            self.in_progress.remove(key);
        }

        crate::log!("store"; "deleted {} cached artifacts from memory", keys.len());
        keys.len()
    }
}

struct MemoryWriteHandle {
    key: String,
    buffer: Vec<u8>,
    blocks: Arc<DashMap<String, Arc<Vec<u8>>>>,
    index: Arc<Mutex<FxHashSet<String>>>,
    in_progress: Arc<DashMap<String, Instant>>,
    committed: bool,
}

impl Write for MemoryWriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteHandle for MemoryWriteHandle {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let bytes = std::mem::take(&mut self.buffer);
        crate::debug!("store"; "saving artifact of {} bytes to memory as {}", bytes.len(), self.key);

        self.blocks.insert(self.key.clone(), Arc::new(bytes));
        self.index.lock().insert(self.key.clone());
        self.in_progress.remove(&self.key);
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryWriteHandle {
    fn drop(&mut self) {
        if !self.committed {
            self.in_progress.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(Duration::from_secs(60))
    }

    #[test]
    fn commit_publishes_bytes() {
        let store = store();
        let mut handle = store.start_write("k.js").unwrap().unwrap();
        handle.write_all(b"content").unwrap();

        assert!(!store.exists("k.js"));
        handle.commit().unwrap();

        assert!(store.exists("k.js"));
        assert_eq!(store.open("k.js").unwrap(), b"content");
        assert_eq!(store.len("k.js").unwrap(), 7);
    }

    #[test]
    fn second_writer_backs_off_while_first_is_live() {
        let store = store();
        let _first = store.start_write("k.js").unwrap().unwrap();
        assert!(store.start_write("k.js").unwrap().is_none());
    }

    #[test]
    fn stale_marker_is_seized() {
        let store = MemoryStore::new(Duration::from_millis(0));
        let _first = store.start_write("k.js").unwrap().unwrap();
        // Bound of zero: the first marker is immediately seizable
        assert!(store.start_write("k.js").unwrap().is_some());
    }

    #[test]
    fn dropped_handle_releases_the_lock() {
        let store = store();
        drop(store.start_write("k.js").unwrap().unwrap());
        assert!(store.start_write("k.js").unwrap().is_some());
        assert!(!store.exists("k.js"));
    }

    #[test]
    fn clear_removes_matching_extension_only() {
        let store = store();
        for key in ["a.js", "b.js", "c.css"] {
            let mut handle = store.start_write(key).unwrap().unwrap();
            handle.write_all(b"x").unwrap();
            handle.commit().unwrap();
        }

        assert_eq!(store.clear(".js"), 2);
        assert!(!store.exists("a.js"));
        assert!(!store.exists("b.js"));
        assert!(store.exists("c.css"));

        // Sweep again: index was pruned, nothing left to remove
        assert_eq!(store.clear(".js"), 0);
    }
}
