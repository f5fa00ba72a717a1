//! Cache coordinator (C5, spec §4.5).
//!
//! Unifies the in-memory hot path (C2), the persistent WebP store (C3), and
//! the structured result cache (C4) behind one `lookup`/`store`/`invalidate`
//! façade, re-fingerprinting the source page on every lookup so a changed
//! source image is treated as a miss rather than served stale (spec §4.1
//! "fingerprint drives invalidation, not a TTL"). Grounded on the teacher's
//! two-tier "L1 then promote" cache shape (`kernel/src/cache/mod.rs`),
//! generalized from one L1/L2 pair to three layers and a re-fingerprint
//! gate the teacher's Redis-backed cache has no equivalent of.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::image_store::ImageStore;
use crate::cache::memory::MemoryCache;
use crate::cache::result_store::{CachedArtifact, ResultCache, TranslationArtifact};
use crate::events::{EventBus, TaskEvent};
use crate::keys::{content_fingerprint, ImageFingerprint, TranslationKey};

/// Fetches the current bytes of a source page, so the coordinator can
/// re-fingerprint it against what a cached entry was computed from.
/// Implementation is an external collaborator (the embedding application's
/// archive/source reader); only the contract lives here.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read_source(&self, manga_ref: &str, page_index: u32) -> Result<Vec<u8>>;
}

/// Which cache layer served a hit (spec §6 `get_translated_page`'s
/// `source_layer` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSourceLayer {
    Memory,
    PersistentImage,
}

/// Result of a coordinated lookup.
pub enum CacheLookup {
    /// Rendered page bytes, ready to serve as-is.
    Rendered(Vec<u8>, CacheSourceLayer),
    /// The structured translation is still valid but its rendered bytes
    /// were evicted or never written; the caller only needs to re-render,
    /// not re-OCR or re-translate.
    ArtifactOnly(CachedArtifact),
    Miss,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: u64,
}

pub struct CacheCoordinator {
    memory: MemoryCache,
    images: ImageStore,
    results: ResultCache,
    source: Arc<dyn SourceReader>,
    events: EventBus,
}

impl CacheCoordinator {
    pub fn new(
        memory: MemoryCache,
        images: ImageStore,
        results: ResultCache,
        source: Arc<dyn SourceReader>,
        events: EventBus,
    ) -> Self {
        Self {
            memory,
            images,
            results,
            source,
            events,
        }
    }

    async fn current_fingerprint(&self, key: &TranslationKey) -> Result<ImageFingerprint> {
        let bytes = self
            .source
            .read_source(&key.manga_ref, key.page_index)
            .await
            .context("failed to read current source page for fingerprinting")?;
        content_fingerprint(&bytes)
    }

    /// Look up `key`, validating every hit against the source's *current*
    /// fingerprint before returning it.
    pub async fn lookup(&self, key: &TranslationKey) -> Result<CacheLookup> {
        let current_fp = self.current_fingerprint(key).await?;

        if let Some(bytes) = self.memory.get(key).await {
            match self.images.fingerprint_of(key).await {
                Some(fp) if fp == current_fp => {
                    debug!(key = %key.as_string(), "cache coordinator: L1 hit");
                    return Ok(CacheLookup::Rendered(bytes, CacheSourceLayer::Memory));
                }
                _ => {
                    self.memory.invalidate(key).await;
                }
            }
        }

        if self.images.has(key).await {
            match self.images.fingerprint_of(key).await {
                Some(fp) if fp == current_fp => {
                    if let Some(bytes) = self.images.get(key).await {
                        self.memory.put(key, bytes.clone()).await;
                        debug!(key = %key.as_string(), "cache coordinator: L2 hit, promoted to L1");
                        return Ok(CacheLookup::Rendered(bytes, CacheSourceLayer::PersistentImage));
                    }
                }
                _ => {
                    debug!(key = %key.as_string(), "cache coordinator: L2 entry stale, evicting");
                    self.images.remove(key).await;
                }
            }
        }

        if let Some(cached) = self.results.get(key).await {
            if cached.source_fingerprint == current_fp {
                debug!(key = %key.as_string(), "cache coordinator: L3 hit, render needed");
                return Ok(CacheLookup::ArtifactOnly(cached));
            }
            self.results.remove(key).await;
        }

        Ok(CacheLookup::Miss)
    }

    /// Write a freshly computed artifact and its rendered bytes into every
    /// layer at once.
    pub async fn store(
        &self,
        key: &TranslationKey,
        source_fingerprint: &ImageFingerprint,
        artifact: &TranslationArtifact,
        rendered_pixels: &[u8],
        width: u32,
        height: u32,
        webp_quality: u8,
    ) -> Result<()> {
        self.results.put(key, source_fingerprint, artifact).await?;
        self.images
            .put(key, rendered_pixels, width, height, source_fingerprint, webp_quality)
            .await?;
        let encoded = webp::Encoder::from_rgba(rendered_pixels, width, height).encode(webp_quality as f32);
        self.memory.put(key, encoded.to_vec()).await;
        Ok(())
    }

    /// Write only a rendered-image layer refresh, for the `ArtifactOnly`
    /// re-render path where OCR/translation are unchanged.
    pub async fn store_rendered_only(
        &self,
        key: &TranslationKey,
        source_fingerprint: &ImageFingerprint,
        rendered_pixels: &[u8],
        width: u32,
        height: u32,
        webp_quality: u8,
    ) -> Result<()> {
        self.images
            .put(key, rendered_pixels, width, height, source_fingerprint, webp_quality)
            .await?;
        let encoded = webp::Encoder::from_rgba(rendered_pixels, width, height).encode(webp_quality as f32);
        self.memory.put(key, encoded.to_vec()).await;
        Ok(())
    }

    pub async fn invalidate(&self, key: &TranslationKey) {
        self.memory.invalidate(key).await;
        self.images.remove(key).await;
        self.results.remove(key).await;
        self.events.emit(TaskEvent::CacheCleared {
            cache_type: format!("entry:{}", key.as_string()),
            at: chrono::Utc::now(),
        });
    }

    /// Drop every cached layer for `manga_ref`/`engine_id`. The in-memory
    /// layer is cleared for the whole `manga_ref` regardless of engine,
    /// since over-invalidating a hot-path cache is harmless.
    pub async fn clear_work(&self, manga_ref: &str, engine_id: &str) -> Result<usize> {
        self.memory.invalidate_manga_ref(manga_ref).await;
        let images_removed = self.images.clear_work(manga_ref, engine_id).await;
        let results_removed = self.results.clear_work(manga_ref, engine_id).await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to clear result cache rows");
            0
        });
        self.events.emit(TaskEvent::CacheCleared {
            cache_type: format!("work:{manga_ref}:{engine_id}"),
            at: chrono::Utc::now(),
        });
        Ok(images_removed + results_removed as usize)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.entry_count(),
        }
    }

    /// Run the persistent image cache's age- and size-based eviction (spec
    /// §4.3 "not invoked inline — invoked by scheduled maintenance or
    /// explicit call"). Returns (entries dropped for age, entries dropped
    /// for budget).
    pub async fn run_eviction(&self, max_age_days: i64, max_cache_size_bytes: u64) -> (usize, usize) {
        let aged_out = self.images.cleanup_old(max_age_days).await;
        let evicted = self.images.evict_to_budget(max_cache_size_bytes).await;
        (aged_out, evicted)
    }
}
