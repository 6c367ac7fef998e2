//! Request-key → manifest registry.
//!
//! After reconciliation, the render publishes its ordered manifest under the
//! request key so the later artifact fetch can find it. Entries only need to
//! survive the gap between rendering and the browser's fetch, so they carry
//! a short TTL; an expired key is answered with `None` and the host serves a
//! benign explanation instead.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::key::CacheKey;
use crate::source::ResolvedManifest;

pub struct ManifestRegistry {
    entries: DashMap<String, (ResolvedManifest, Instant)>,
    ttl: Duration,
}

impl ManifestRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Register a manifest under its request key, resetting its TTL.
    pub fn insert(&self, key: &CacheKey, manifest: ResolvedManifest) {
        self.entries
            .insert(key.as_str().to_string(), (manifest, Instant::now()));
    }

    /// Look up a manifest; expired entries are dropped on the way out.
    pub fn get(&self, key: &str) -> Option<ResolvedManifest> {
        let expired = {
            let entry = self.entries.get(key)?;
            if entry.1.elapsed() <= self.ttl {
                return Some(entry.0.clone());
            }
            true
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
