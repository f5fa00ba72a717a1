//! Translation provider contract and batching service (C11, spec §4.11).
//!
//! `TranslationEngine` is the narrow external-collaborator contract (a
//! single engine call); `TranslationService` is the internal orchestration
//! that spec §4.11 requires of it: per-string cache probe, sub-batching,
//! rate-limit pacing, the numbered-response protocol, and sensitive-content
//! fallback. Batching/pacing concerns are grounded on the chunking and
//! rate-limiter shape in `jserv-cjk-token-reducer`'s translator module; the
//! per-string durable cache follows the teacher's sqlx row-per-key pattern.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_BATCH_SIZE: usize = 20;
const MIN_BATCH_SPACING: Duration = Duration::from_secs(2);

/// Classified reason an engine declined to translate a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRefusal {
    SensitiveContent,
    Other,
}

/// A single translation engine call. Implementations are external
/// collaborators (spec §1); only the contract is specified here.
#[async_trait]
pub trait TranslationEngine: Send + Sync {
    /// Translate `texts` to `target_lang`. On a classified refusal, return
    /// `Err` carrying [`EngineRefusal::SensitiveContent`] via the engine's
    /// own error type downcast — simplified here to a bool flag so the
    /// batching layer can decide whether to fall back.
    async fn translate_batch(&self, texts: &[String], target_lang: &str) -> Result<Vec<String>, EngineError>;

    fn engine_id(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine refused: sensitive content")]
    SensitiveContent,
    #[error("engine error: {0}")]
    Other(#[from] anyhow::Error),
}

fn failure_marker(source: &str) -> String {
    format!("[Translation Failed: {source}]")
}

/// True if `text` is the literal per-string failure marker [`TranslationService`]
/// substitutes for a string it could not translate. Used by the scheduler to
/// fall back to source text at the pipeline level (spec §4.12: "pipeline
/// proceeds using source text as translated text for missing entries").
pub fn is_failure_marker(text: &str) -> bool {
    text.starts_with("[Translation Failed: ") && text.ends_with(']')
}

/// Durable per-string translation cache keyed by `(sha256(source), lang, engine)`.
pub struct StringCache {
    pool: SqlitePool,
}

impl StringCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn hash(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, text: &str, target_lang: &str, engine_id: &str) -> Option<String> {
        let hash = Self::hash(text);
        let row = sqlx::query(
            "SELECT translated_text FROM translation_string_cache WHERE source_hash = ? AND target_lang = ? AND engine_id = ?",
        )
        .bind(&hash)
        .bind(target_lang)
        .bind(engine_id)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        row.try_get("translated_text").ok()
    }

    pub async fn put(&self, text: &str, target_lang: &str, engine_id: &str, translated: &str, now: chrono::DateTime<chrono::Utc>) {
        let hash = Self::hash(text);
        let result = sqlx::query(
            "INSERT OR REPLACE INTO translation_string_cache (source_hash, target_lang, engine_id, translated_text, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(hash)
        .bind(target_lang)
        .bind(engine_id)
        .bind(translated)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(error = %err, "failed to write translation string cache entry");
        }
    }
}

/// Orchestrates batched, cached, paced, fallback-aware translation.
pub struct TranslationService {
    primary: Arc<dyn TranslationEngine>,
    fallback: Option<Arc<dyn TranslationEngine>>,
    cache: Arc<StringCache>,
    batch_size: usize,
    last_batch_at: AsyncMutex<Option<Instant>>,
}

impl TranslationService {
    pub fn new(
        primary: Arc<dyn TranslationEngine>,
        fallback: Option<Arc<dyn TranslationEngine>>,
        cache: Arc<StringCache>,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache,
            batch_size: DEFAULT_BATCH_SIZE,
            last_batch_at: AsyncMutex::new(None),
        }
    }

    /// Translate every string in `texts`, preserving order and length.
    /// Never returns an error: unrecoverable per-string failures become the
    /// literal `"[Translation Failed: <source>]"` marker.
    pub async fn translate_batch(&self, texts: &[String], target_lang: &str) -> Vec<String> {
        let mut results: Vec<Option<String>> = vec![None; texts.len()];
        let mut uncached_indices = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(cached) = self.cache.get(text, target_lang, self.primary.engine_id()).await {
                results[i] = Some(cached);
            } else {
                uncached_indices.push(i);
            }
        }

        for chunk in uncached_indices.chunks(self.batch_size) {
            let chunk_texts: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
            self.pace().await;
            let translated = self.translate_subbatch(&chunk_texts, target_lang).await;
            for (&i, translated) in chunk.iter().zip(translated.into_iter()) {
                results[i] = Some(translated);
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.unwrap_or_else(|| failure_marker(&texts[i])))
            .collect()
    }

    async fn pace(&self) {
        let mut last = self.last_batch_at.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_BATCH_SPACING {
                tokio::time::sleep(MIN_BATCH_SPACING - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Translate one sub-batch, applying the numbered-response protocol,
    /// sensitive-content fallback, and per-string cache writes.
    async fn translate_subbatch(&self, texts: &[String], target_lang: &str) -> Vec<String> {
        match self.call_engine(&self.primary, texts, target_lang).await {
            Ok(translated) => {
                self.cache_results(texts, target_lang, self.primary.engine_id(), &translated).await;
                translated
            }
            Err(EngineError::SensitiveContent) => {
                debug!("primary engine refused sensitive content; retrying via fallback");
                if let Some(fallback) = &self.fallback {
                    match self.call_engine(fallback, texts, target_lang).await {
                        Ok(translated) => {
                            self.cache_results(texts, target_lang, fallback.engine_id(), &translated).await;
                            translated
                        }
                        Err(_) => self.per_string_fallback(texts, target_lang).await,
                    }
                } else {
                    self.per_string_fallback(texts, target_lang).await
                }
            }
            Err(EngineError::Other(err)) => {
                warn!(error = %err, "sub-batch translation failed; falling back to per-string calls");
                self.per_string_fallback(texts, target_lang).await
            }
        }
    }

    async fn call_engine(
        &self,
        engine: &Arc<dyn TranslationEngine>,
        texts: &[String],
        target_lang: &str,
    ) -> Result<Vec<String>, EngineError> {
        let translated = engine.translate_batch(texts, target_lang).await?;
        if translated.len() != texts.len() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "numbered-response count mismatch: expected {}, got {}",
                texts.len(),
                translated.len()
            )));
        }
        Ok(translated)
    }

    /// Numbered-response count mismatch (or any other sub-batch error) falls
    /// back to one call per string, so a single bad string doesn't fail the
    /// whole batch.
    async fn per_string_fallback(&self, texts: &[String], target_lang: &str) -> Vec<String> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match self.call_engine(&self.primary, std::slice::from_ref(text), target_lang).await {
                Ok(mut translated) if translated.len() == 1 => {
                    let value = translated.remove(0);
                    self.cache.put(text, target_lang, self.primary.engine_id(), &value, chrono::Utc::now()).await;
                    out.push(value);
                }
                _ => out.push(failure_marker(text)),
            }
        }
        out
    }

    async fn cache_results(&self, texts: &[String], target_lang: &str, engine_id: &str, translated: &[String]) {
        let now = chrono::Utc::now();
        for (source, value) in texts.iter().zip(translated.iter()) {
            self.cache.put(source, target_lang, engine_id, value, now).await;
        }
    }
}

/// Parse a numbered-response protocol reply (`"1. foo"` / `"1) foo"` per
/// line) into an ordered list, tolerating either prefix style, surrounding
/// whitespace, and reordering (matches by number, not by line position).
/// Exported for concrete [`TranslationEngine`] implementations whose
/// underlying API is a numbered-prompt model call rather than a
/// structured-response API: such an engine builds the numbered prompt
/// itself and can use this to parse the reply before returning the
/// length-preserving `Vec<String>` this trait's contract requires. Returns
/// `None` on any malformed line or a count mismatch, signaling the engine
/// to fall back to per-string calls for that sub-batch.
pub fn parse_numbered_response(reply: &str, expected_count: usize) -> Option<Vec<String>> {
    let mut out: Vec<(usize, String)> = Vec::new();
    for line in reply.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (index, rest) = split_index_prefix(trimmed)?;
        out.push((index, rest.trim().to_string()));
    }

    if out.len() != expected_count {
        return None;
    }
    out.sort_by_key(|(i, _)| *i);
    if out.iter().enumerate().any(|(pos, (i, _))| *i != pos + 1) {
        return None;
    }
    Some(out.into_iter().map(|(_, text)| text).collect())
}

fn split_index_prefix(line: &str) -> Option<(usize, &str)> {
    let digits_end = line.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let index: usize = line[..digits_end].parse().ok()?;
    let sep = line.as_bytes().get(digits_end).copied()?;
    if sep != b'.' && sep != b')' {
        return None;
    }
    Some((index, &line[digits_end + 1..]))
}
