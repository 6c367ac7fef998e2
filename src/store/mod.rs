//! Pluggable artifact storage.
//!
//! The build engine is storage-agnostic: both backends expose the same
//! existence / read / exclusive-write / sweep surface, so on-disk files and
//! in-memory byte blocks are interchangeable at configuration time.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StorageKind;
use crate::error::Result;

/// Persists and retrieves artifact bytes by key.
///
/// Shared by all concurrent callers; only the producer holding a key's
/// write handle may mutate that key.
pub trait ArtifactStore: Send + Sync {
    /// Whether a committed artifact exists at `key`.
    fn exists(&self, key: &str) -> bool;

    /// Read a committed artifact in full.
    fn open(&self, key: &str) -> Result<Vec<u8>>;

    /// Size of a committed artifact in bytes.
    fn len(&self, key: &str) -> Result<u64>;

    /// Begin an exclusive write for `key`.
    ///
    /// Returns `None` when another producer is already mid-write (and its
    /// lock is not stale). Dropping the handle without committing releases
    /// the lock and publishes nothing.
    fn start_write(&self, key: &str) -> Result<Option<Box<dyn WriteHandle>>>;

    /// Remove committed artifacts carrying the given extension.
    ///
    /// Returns the number of artifacts removed. Only signed artifacts are
    /// touched; unrelated files sharing the location survive.
    fn clear(&self, extension: &str) -> usize;
}

/// Scoped write with deferred atomic publish.
pub trait WriteHandle: Write + Send {
    /// Atomically publish the artifact and release the producer lock.
    ///
    /// Concurrent readers either see the previous state or the complete new
    /// artifact, never a partial write.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Open the configured storage backend for one asset kind.
pub fn open_store(
    storage: StorageKind,
    out_dir: &Path,
    max_build: Duration,
) -> Arc<dyn ArtifactStore> {
    match storage {
        StorageKind::Disk => Arc::new(DiskStore::new(out_dir, max_build)),
        StorageKind::Memory => Arc::new(MemoryStore::new(max_build)),
    }
}
