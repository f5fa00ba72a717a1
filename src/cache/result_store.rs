//! Structured result cache (C4, spec §4.4).
//!
//! Stores the full per-page translation artifact — text groups, the
//! translations aligned to them, and the layout hints the renderer used —
//! as a JSON blob keyed by [`TranslationKey`], sqlx-backed against the same
//! SQLite pool as the task store (C6), following the teacher's
//! `kernel::db` pool-sharing convention rather than opening a second
//! connection pool for a second table.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::warn;

use crate::keys::{ImageFingerprint, TranslationKey};
use crate::pipeline::{LayoutHints, TextGroup};

/// Everything needed to re-render a page without repeating OCR/translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationArtifact {
    pub text_groups: Vec<TextGroup>,
    /// Translated text aligned 1:1 with `text_groups`.
    pub translations: Vec<String>,
    /// Layout hints the renderer derived for each group, aligned 1:1.
    pub layout_hints: Vec<ArtifactLayoutHints>,
}

/// Serializable mirror of [`LayoutHints`] (which is `Copy` but not itself
/// `Serialize`, to keep the renderer module free of a cache-format
/// dependency).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArtifactLayoutHints {
    pub font_size: f32,
    pub columns: usize,
    pub line_spacing: f32,
    pub char_spacing: f32,
}

impl From<LayoutHints> for ArtifactLayoutHints {
    fn from(h: LayoutHints) -> Self {
        Self {
            font_size: h.font_size,
            columns: h.columns,
            line_spacing: h.line_spacing,
            char_spacing: h.char_spacing,
        }
    }
}

impl From<ArtifactLayoutHints> for LayoutHints {
    fn from(h: ArtifactLayoutHints) -> Self {
        Self {
            font_size: h.font_size,
            columns: h.columns,
            line_spacing: h.line_spacing,
            char_spacing: h.char_spacing,
        }
    }
}

/// A cached artifact plus the source fingerprint it was computed against.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub artifact: TranslationArtifact,
    pub source_fingerprint: ImageFingerprint,
}

pub struct ResultCache {
    pool: SqlitePool,
}

impl ResultCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &TranslationKey) -> Option<CachedArtifact> {
        let cache_key = key.hash_hex();
        let row = sqlx::query(
            "SELECT result_json, source_fingerprint FROM result_cache WHERE cache_key = ?",
        )
        .bind(&cache_key)
        .fetch_optional(&self.pool)
        .await
        .ok()??;

        let result_json: String = row.try_get("result_json").ok()?;
        let source_fingerprint: String = row.try_get("source_fingerprint").ok()?;
        let artifact = match serde_json::from_str(&result_json) {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, key = %key.as_string(), "failed to parse cached result artifact");
                return None;
            }
        };

        let now = chrono::Utc::now().to_rfc3339();
        if let Err(err) = sqlx::query("UPDATE result_cache SET last_accessed_at = ? WHERE cache_key = ?")
            .bind(now)
            .bind(&cache_key)
            .execute(&self.pool)
            .await
        {
            warn!(error = %err, "failed to update result cache last_accessed_at");
        }

        Some(CachedArtifact {
            artifact,
            source_fingerprint,
        })
    }

    pub async fn put(
        &self,
        key: &TranslationKey,
        source_fingerprint: &ImageFingerprint,
        artifact: &TranslationArtifact,
    ) -> Result<()> {
        let cache_key = key.hash_hex();
        let result_json = serde_json::to_string(artifact).context("failed to serialize result artifact")?;
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO result_cache
                (cache_key, manga_ref, page_index, language, engine_id, source_fingerprint, result_json, created_at, last_accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                source_fingerprint = excluded.source_fingerprint,
                result_json = excluded.result_json,
                last_accessed_at = excluded.last_accessed_at",
        )
        .bind(&cache_key)
        .bind(&key.manga_ref)
        .bind(key.page_index)
        .bind(&key.language)
        .bind(&key.engine_id)
        .bind(source_fingerprint)
        .bind(result_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to upsert result cache row")?;

        Ok(())
    }

    pub async fn remove(&self, key: &TranslationKey) {
        let cache_key = key.hash_hex();
        if let Err(err) = sqlx::query("DELETE FROM result_cache WHERE cache_key = ?")
            .bind(cache_key)
            .execute(&self.pool)
            .await
        {
            warn!(error = %err, "failed to delete result cache row");
        }
    }

    pub async fn clear_work(&self, manga_ref: &str, engine_id: &str) -> Result<u64> {
        let manga_ref = crate::keys::normalize_manga_ref(manga_ref);
        let engine_id = engine_id.trim().to_lowercase();
        let result = sqlx::query("DELETE FROM result_cache WHERE manga_ref = ? AND engine_id = ?")
            .bind(manga_ref)
            .bind(engine_id)
            .execute(&self.pool)
            .await
            .context("failed to clear result cache for manga_ref/engine_id")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::{Quad, TextDirection};

    async fn pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_artifact() -> TranslationArtifact {
        TranslationArtifact {
            text_groups: vec![TextGroup {
                quad: Quad::from_bbox(0, 0, 10, 10),
                direction: TextDirection::Vertical,
                source_text: "こんにちは".to_string(),
                member_count: 1,
                merged_count: 1,
            }],
            translations: vec!["Hello".to_string()],
            layout_hints: vec![ArtifactLayoutHints {
                font_size: 24.0,
                columns: 1,
                line_spacing: 1.1,
                char_spacing: 1.2,
            }],
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let cache = ResultCache::new(pool().await);
        let key = TranslationKey::new("/m/one.zip", 0, "en", "google");
        cache.put(&key, &"fp1".to_string(), &sample_artifact()).await.unwrap();

        let cached = cache.get(&key).await.unwrap();
        assert_eq!(cached.source_fingerprint, "fp1");
        assert_eq!(cached.artifact.translations, vec!["Hello".to_string()]);
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let cache = ResultCache::new(pool().await);
        let key = TranslationKey::new("/m/one.zip", 0, "en", "google");
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn put_upserts_existing_entry() {
        let cache = ResultCache::new(pool().await);
        let key = TranslationKey::new("/m/one.zip", 0, "en", "google");
        cache.put(&key, &"fp1".to_string(), &sample_artifact()).await.unwrap();

        let mut updated = sample_artifact();
        updated.translations = vec!["Hi".to_string()];
        cache.put(&key, &"fp2".to_string(), &updated).await.unwrap();

        let cached = cache.get(&key).await.unwrap();
        assert_eq!(cached.source_fingerprint, "fp2");
        assert_eq!(cached.artifact.translations, vec!["Hi".to_string()]);
    }

    #[tokio::test]
    async fn clear_work_removes_only_matching_rows() {
        let cache = ResultCache::new(pool().await);
        let k1 = TranslationKey::new("/m/one.zip", 0, "en", "google");
        let k2 = TranslationKey::new("/m/two.zip", 0, "en", "google");
        cache.put(&k1, &"fp".to_string(), &sample_artifact()).await.unwrap();
        cache.put(&k2, &"fp".to_string(), &sample_artifact()).await.unwrap();

        let removed = cache.clear_work("/m/one.zip", "google").await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&k1).await.is_none());
        assert!(cache.get(&k2).await.is_some());
    }
}
