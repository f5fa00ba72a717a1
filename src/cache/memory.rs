//! Memory cache (C2, spec §4.2).
//!
//! Grounded on `trovato-kernel/src/cache/mod.rs`'s L1 `moka::future::Cache`:
//! the teacher pairs Moka with Redis for its L2, this core pairs it with the
//! persistent image cache instead (SPEC_FULL.md §D) — `MemoryCache` itself
//! is just the L1 half, generalized to hold rendered-page bytes rather than
//! opaque strings.

use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::keys::TranslationKey;

const DEFAULT_MAX_ENTRIES: u64 = 256;

/// Bounded in-process map from translation key to rendered page bytes.
///
/// Reads proceed in parallel; Moka serializes writes to a given key
/// internally, matching the "reads parallel, writes exclusive" requirement
/// without an explicit lock.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, Vec<u8>>,
}

impl MemoryCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(max_entries).build(),
        }
    }

    pub async fn get(&self, key: &TranslationKey) -> Option<Vec<u8>> {
        let value = self.inner.get(&key.as_string()).await;
        if value.is_some() {
            debug!(key = %key.as_string(), "memory cache hit");
        }
        value
    }

    pub async fn put(&self, key: &TranslationKey, bytes: Vec<u8>) {
        self.inner.insert(key.as_string(), bytes).await;
    }

    pub async fn invalidate(&self, key: &TranslationKey) {
        self.inner.invalidate(&key.as_string()).await;
    }

    /// Remove every entry belonging to `manga_ref` (any page/language/engine).
    pub async fn invalidate_manga_ref(&self, manga_ref: &str) {
        let prefix = format!("translation:{manga_ref}:");
        self.inner.invalidate_entries_if(move |k, _v| k.starts_with(&prefix)).ok();
        self.inner.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}
