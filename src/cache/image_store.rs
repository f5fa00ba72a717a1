//! Persistent image cache (C3, spec §4.3).
//!
//! Content-addressed directory tree of lossy WebP pages plus a single JSON
//! sidecar mapping translation-key hash → metadata. Grounded on the
//! write-temp-then-rename durability pattern used throughout the teacher's
//! file-handling code (`trovato-kernel/src/file/service.rs`) and on the
//! `webp` crate (declared by `carjorvaz-pdf-translator-rs` in the pack) for
//! quality-controlled lossy encoding, since `image`'s built-in WebP codec is
//! decode-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::keys::{ImageFingerprint, TranslationKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCacheEntry {
    pub manga_ref: String,
    pub page_index: u32,
    pub language: String,
    pub engine_id: String,
    pub fingerprint: ImageFingerprint,
    pub file_path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// Content-addressed, sharded-directory persistent cache of rendered pages.
pub struct ImageStore {
    root: PathBuf,
    metadata: RwLock<HashMap<String, ImageCacheEntry>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl ImageStore {
    pub async fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .context("failed to create image cache root directory")?;

        let metadata = load_metadata(&root).await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to load image cache metadata; starting empty");
            HashMap::new()
        });

        Ok(Self {
            root,
            metadata: RwLock::new(metadata),
            locks: DashMap::new(),
            clock,
        })
    }

    /// `true` iff the WebP file exists (non-empty) and metadata is present.
    /// If the file is present but its metadata entry is missing — e.g. a
    /// `put` that crashed after `rename` but before the metadata write —
    /// metadata is rebuilt on the fly from the file itself and `key`, so the
    /// entry isn't permanently invisible just because the sidecar lost it.
    /// The rebuilt entry's fingerprint is unknown (the original source bytes
    /// aren't recoverable from the rendered WebP), so it's left empty: the
    /// coordinator's re-fingerprint check on the next lookup will then never
    /// match and will treat the entry as stale rather than silently wrong.
    pub async fn has(&self, key: &TranslationKey) -> bool {
        let hash = key.hash_hex();
        if self.metadata.read().await.contains_key(&hash) {
            return self.file_is_present(&hash).await;
        }

        let path = self.file_path(&hash);
        let Ok(stat) = tokio::fs::metadata(&path).await else {
            return false;
        };
        if stat.len() == 0 {
            return false;
        }

        let now = self.clock.now();
        let entry = ImageCacheEntry {
            manga_ref: key.manga_ref.clone(),
            page_index: key.page_index,
            language: key.language.clone(),
            engine_id: key.engine_id.clone(),
            fingerprint: String::new(),
            file_path: path.to_string_lossy().to_string(),
            size_bytes: stat.len(),
            created_at: now,
            last_accessed: now,
            access_count: 0,
        };

        let mut metadata = self.metadata.write().await;
        metadata.insert(hash, entry);
        let snapshot = metadata.clone();
        drop(metadata);
        if let Err(err) = persist_metadata(&self.root, &snapshot).await {
            warn!(error = %err, "failed to persist image cache metadata after rebuilding a lost entry");
        }
        true
    }

    async fn file_is_present(&self, hash: &str) -> bool {
        tokio::fs::metadata(self.file_path(hash))
            .await
            .map(|stat| stat.len() > 0)
            .unwrap_or(false)
    }

    pub async fn get(&self, key: &TranslationKey) -> Option<Vec<u8>> {
        let hash = key.hash_hex();
        let lock = self.key_lock(&hash);
        let _guard = lock.lock().await;

        let path = self.file_path(&hash);
        let bytes = tokio::fs::read(&path).await.ok()?;
        if bytes.is_empty() {
            return None;
        }

        let mut metadata = self.metadata.write().await;
        if let Some(entry) = metadata.get_mut(&hash) {
            entry.last_accessed = self.clock.now();
            entry.access_count += 1;
        }
        let snapshot = metadata.clone();
        drop(metadata);
        if let Err(err) = persist_metadata(&self.root, &snapshot).await {
            warn!(error = %err, "failed to persist image cache metadata after read");
        }

        debug!(key = %key.as_string(), "persistent image cache hit");
        Some(bytes)
    }

    /// Encode `pixels` (RGBA8) to lossy WebP at `quality` and atomically
    /// store it, updating the sidecar metadata.
    pub async fn put(
        &self,
        key: &TranslationKey,
        pixels: &[u8],
        width: u32,
        height: u32,
        source_fingerprint: &ImageFingerprint,
        quality: u8,
    ) -> Result<()> {
        let hash = key.hash_hex();
        let lock = self.key_lock(&hash);
        let _guard = lock.lock().await;

        let encoder = webp::Encoder::from_rgba(pixels, width, height);
        let encoded = encoder.encode(quality as f32);
        let bytes: Vec<u8> = encoded.to_vec();

        let shard_dir = self.shard_dir(&hash);
        tokio::fs::create_dir_all(&shard_dir)
            .await
            .context("failed to create image cache shard directory")?;

        let final_path = self.file_path(&hash);
        let tmp_path = shard_dir.join(format!("{hash}.webp.tmp"));
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .context("failed to write temp image cache file")?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .context("failed to atomically rename image cache file")?;

        let now = self.clock.now();
        let entry = ImageCacheEntry {
            manga_ref: key.manga_ref.clone(),
            page_index: key.page_index,
            language: key.language.clone(),
            engine_id: key.engine_id.clone(),
            fingerprint: source_fingerprint.clone(),
            file_path: final_path.to_string_lossy().to_string(),
            size_bytes: bytes.len() as u64,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        };

        let mut metadata = self.metadata.write().await;
        metadata.insert(hash, entry);
        let snapshot = metadata.clone();
        drop(metadata);
        persist_metadata(&self.root, &snapshot)
            .await
            .context("failed to persist image cache metadata after write")?;

        Ok(())
    }

    /// Delete a specific entry (used when its fingerprint goes stale).
    pub async fn remove(&self, key: &TranslationKey) {
        let hash = key.hash_hex();
        let lock = self.key_lock(&hash);
        let _guard = lock.lock().await;

        let path = self.file_path(&hash);
        let _ = tokio::fs::remove_file(&path).await;

        let mut metadata = self.metadata.write().await;
        metadata.remove(&hash);
        let snapshot = metadata.clone();
        drop(metadata);
        if let Err(err) = persist_metadata(&self.root, &snapshot).await {
            warn!(error = %err, "failed to persist image cache metadata after removal");
        }
    }

    /// Return the fingerprint currently recorded for `key`, if any.
    pub async fn fingerprint_of(&self, key: &TranslationKey) -> Option<ImageFingerprint> {
        self.metadata
            .read()
            .await
            .get(&key.hash_hex())
            .map(|e| e.fingerprint.clone())
    }

    /// Remove every entry whose (manga_ref, engine_id) matches both fields.
    pub async fn clear_work(&self, manga_ref: &str, engine_id: &str) -> usize {
        let manga_ref = crate::keys::normalize_manga_ref(manga_ref);
        let engine_id = engine_id.trim().to_lowercase();

        let mut metadata = self.metadata.write().await;
        let matching: Vec<String> = metadata
            .iter()
            .filter(|(_, e)| e.manga_ref == manga_ref && e.engine_id == engine_id)
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &matching {
            metadata.remove(hash);
            let _ = tokio::fs::remove_file(self.file_path(hash)).await;
        }
        let removed = matching.len();
        let snapshot = metadata.clone();
        drop(metadata);
        if let Err(err) = persist_metadata(&self.root, &snapshot).await {
            warn!(error = %err, "failed to persist image cache metadata after clear_work");
        }
        removed
    }

    /// Age-based eviction: drop entries whose `created_at` predates the cutoff.
    pub async fn cleanup_old(&self, max_age_days: i64) -> usize {
        let cutoff = self.clock.now() - chrono::Duration::days(max_age_days);
        let mut metadata = self.metadata.write().await;
        let stale: Vec<String> = metadata
            .iter()
            .filter(|(_, e)| e.created_at < cutoff)
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &stale {
            metadata.remove(hash);
            let _ = tokio::fs::remove_file(self.file_path(hash)).await;
        }
        let removed = stale.len();
        let snapshot = metadata.clone();
        drop(metadata);
        if let Err(err) = persist_metadata(&self.root, &snapshot).await {
            warn!(error = %err, "failed to persist image cache metadata after cleanup_old");
        }
        removed
    }

    /// Size-based LRU eviction once `max_cache_size_bytes` is exceeded.
    pub async fn evict_to_budget(&self, max_cache_size_bytes: u64) -> usize {
        let mut metadata = self.metadata.write().await;
        let total: u64 = metadata.values().map(|e| e.size_bytes).sum();
        if total <= max_cache_size_bytes {
            return 0;
        }

        let mut entries: Vec<(String, ImageCacheEntry)> =
            metadata.iter().map(|(h, e)| (h.clone(), e.clone())).collect();
        entries.sort_by_key(|(_, e)| e.last_accessed);

        let mut freed = 0u64;
        let mut removed = 0usize;
        let mut remaining = total;
        for (hash, entry) in entries {
            if remaining <= max_cache_size_bytes {
                break;
            }
            metadata.remove(&hash);
            let _ = tokio::fs::remove_file(self.file_path(&hash)).await;
            remaining -= entry.size_bytes;
            freed += entry.size_bytes;
            removed += 1;
        }
        debug!(bytes_freed = freed, entries_removed = removed, "image cache evicted to budget");

        let snapshot = metadata.clone();
        drop(metadata);
        if let Err(err) = persist_metadata(&self.root, &snapshot).await {
            warn!(error = %err, "failed to persist image cache metadata after eviction");
        }
        removed
    }

    fn shard_dir(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[0..2.min(hash.len())])
    }

    fn file_path(&self, hash: &str) -> PathBuf {
        self.shard_dir(hash).join(format!("{hash}.webp"))
    }

    fn key_lock(&self, hash: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

const METADATA_FILE_NAME: &str = "cache_metadata.json";

async fn load_metadata(root: &Path) -> Result<HashMap<String, ImageCacheEntry>> {
    let path = root.join(METADATA_FILE_NAME);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = tokio::fs::read(&path).await.context("failed to read metadata sidecar")?;
    serde_json::from_slice(&bytes).context("failed to parse metadata sidecar")
}

async fn persist_metadata(root: &Path, metadata: &HashMap<String, ImageCacheEntry>) -> Result<()> {
    let path = root.join(METADATA_FILE_NAME);
    let tmp_path = root.join(format!("{METADATA_FILE_NAME}.tmp"));
    let json = serde_json::to_vec_pretty(metadata).context("failed to serialize metadata sidecar")?;
    tokio::fs::write(&tmp_path, json)
        .await
        .context("failed to write temp metadata sidecar")?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .context("failed to atomically rename metadata sidecar")?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;

    fn rgba_pixels(w: u32, h: u32) -> Vec<u8> {
        vec![128u8; (w * h * 4) as usize]
    }

    async fn store() -> (ImageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let store = ImageStore::open(dir.path(), clock).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let (store, _dir) = store().await;
        let key = TranslationKey::new("/m/one.zip", 0, "zh", "google");
        store
            .put(&key, &rgba_pixels(4, 4), 4, 4, &"fp1".to_string(), 80)
            .await
            .unwrap();

        assert!(store.has(&key).await);
        let bytes = store.get(&key).await.unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(store.fingerprint_of(&key).await.as_deref(), Some("fp1"));
    }

    #[tokio::test]
    async fn has_is_false_without_put() {
        let (store, _dir) = store().await;
        let key = TranslationKey::new("/m/one.zip", 0, "zh", "google");
        assert!(!store.has(&key).await);
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn clear_work_removes_only_matching_entries() {
        let (store, _dir) = store().await;
        let k1 = TranslationKey::new("/m/one.zip", 0, "zh", "google");
        let k2 = TranslationKey::new("/m/one.zip", 1, "zh", "google");
        let k3 = TranslationKey::new("/m/two.zip", 0, "zh", "google");
        for k in [&k1, &k2, &k3] {
            store
                .put(k, &rgba_pixels(2, 2), 2, 2, &"fp".to_string(), 80)
                .await
                .unwrap();
        }

        let removed = store.clear_work("/m/one.zip", "google").await;
        assert_eq!(removed, 2);
        assert!(!store.has(&k1).await);
        assert!(!store.has(&k2).await);
        assert!(store.has(&k3).await);
    }

    #[tokio::test]
    async fn remove_deletes_single_entry() {
        let (store, _dir) = store().await;
        let key = TranslationKey::new("/m/one.zip", 0, "zh", "google");
        store
            .put(&key, &rgba_pixels(2, 2), 2, 2, &"fp".to_string(), 80)
            .await
            .unwrap();
        store.remove(&key).await;
        assert!(!store.has(&key).await);
    }

    #[tokio::test]
    async fn has_rebuilds_metadata_for_an_orphaned_file() {
        let (store, _dir) = store().await;
        let key = TranslationKey::new("/m/one.zip", 0, "zh", "google");
        store
            .put(&key, &rgba_pixels(2, 2), 2, 2, &"fp".to_string(), 80)
            .await
            .unwrap();

        // Simulate a `put` that crashed after the rename but before the
        // metadata write by dropping just the sidecar entry.
        store.metadata.write().await.remove(&key.hash_hex());
        assert!(store.file_path(&key.hash_hex()).exists());

        assert!(store.has(&key).await);
        let rebuilt = store.metadata.read().await.get(&key.hash_hex()).cloned().unwrap();
        assert_eq!(rebuilt.manga_ref, "/m/one.zip");
        assert_eq!(rebuilt.fingerprint, "");
        assert!(rebuilt.size_bytes > 0);
    }
}
