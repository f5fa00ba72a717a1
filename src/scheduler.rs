//! Scheduler worker pool (C8, spec §4.8).
//!
//! Grounded on the teacher's `cron::tasks::CronTasks` shape: a struct holding
//! `Arc`-wrapped collaborators, driven by a loop a caller spawns onto the
//! tokio runtime. Generalized from one periodic sweep into a fixed pool of
//! worker slots that each pull from `TaskStore::next()` and drive the
//! per-page pipeline (OCR → grouping → translation → render), rechecking the
//! task's cooperative-cancellation flag at every stage boundary per spec
//! §4.8 steps 2-3 and §5's suspension-point list.
//!
//! The OCR/translation stages are split into [`PipelineGatherer`], which
//! holds no font, so they can be driven and unit-tested independently of the
//! renderer's glyph-rasterization dependency.

use std::sync::Arc;
use std::time::Duration;

use ab_glyph::FontArc;
use chrono::Duration as ChronoDuration;
use sqlx::sqlite::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::coordinator::SourceReader;
use crate::cache::result_store::{ArtifactLayoutHints, CachedArtifact, TranslationArtifact};
use crate::cache::{CacheCoordinator, CacheLookup};
use crate::config::CoreConfig;
use crate::harmonize::HarmonizationMap;
use crate::keys::{content_fingerprint, ImageFingerprint, TranslationKey};
use crate::pipeline::{
    build_groups, compute_layout, is_failure_marker, render_page, OcrOptions, OcrProvider, TextGroup,
    TranslationService,
};
use crate::task::model::TranslationTask;
use crate::task::persistence;
use crate::task::store::TaskStore;

/// Result of [`PipelineGatherer::gather`]: everything needed to render a
/// page, short of the font itself.
pub struct GatheredArtifact {
    pub source_bytes: Vec<u8>,
    pub fingerprint: ImageFingerprint,
    pub groups: Vec<TextGroup>,
    pub translations: Vec<String>,
    /// True if at least one group fell back to source text because the
    /// translation provider could not translate it (spec §4.12 "partial").
    pub partial: bool,
}

/// OCR → grouping → translation, the part of the pipeline with no rendering
/// dependency. Split out from [`Scheduler`] so it can be exercised without a
/// loaded font (spec §4.8 steps 1-3, up to the render stage boundary).
pub struct PipelineGatherer {
    source: Arc<dyn SourceReader>,
    ocr: Arc<dyn OcrProvider>,
    translation: Arc<TranslationService>,
    harmonization: Arc<HarmonizationMap>,
}

impl PipelineGatherer {
    pub fn new(
        source: Arc<dyn SourceReader>,
        ocr: Arc<dyn OcrProvider>,
        translation: Arc<TranslationService>,
        harmonization: Arc<HarmonizationMap>,
    ) -> Self {
        Self {
            source,
            ocr,
            translation,
            harmonization,
        }
    }

    /// Runs OCR, grouping, and translation for `task`. Returns `Ok(None)` if
    /// the task's cancellation flag is observed at a stage boundary.
    pub async fn gather(&self, task: &TranslationTask) -> anyhow::Result<Option<GatheredArtifact>> {
        if task.is_cancelled() {
            return Ok(None);
        }
        let source_bytes = self.source.read_source(&task.manga_ref, task.page_index).await?;
        let fingerprint = content_fingerprint(&source_bytes)?;

        if task.is_cancelled() {
            return Ok(None);
        }
        let options = OcrOptions {
            language_hint: Some(task.language.clone()),
        };
        let regions = self
            .ocr
            .recognize(&source_bytes, &options)
            .await
            .map_err(|err| err.context("OCR stage failed"))?;
        let groups = build_groups(&regions);

        if task.is_cancelled() {
            return Ok(None);
        }
        let source_texts: Vec<String> = groups.iter().map(|g| g.source_text.clone()).collect();
        let engine_translations = self.translation.translate_batch(&source_texts, &task.language).await;

        let mut translations = Vec::with_capacity(groups.len());
        let mut partial = false;
        for (group, translated) in groups.iter().zip(engine_translations.iter()) {
            if is_failure_marker(translated) {
                partial = true;
                translations.push(group.source_text.clone());
            } else {
                translations.push(self.harmonization.apply(translated).await);
            }
        }

        Ok(Some(GatheredArtifact {
            source_bytes,
            fingerprint,
            groups,
            translations,
            partial,
        }))
    }
}

/// Everything one worker slot needs to run the pipeline end to end.
pub struct Scheduler {
    store: Arc<TaskStore>,
    coordinator: Arc<CacheCoordinator>,
    gatherer: PipelineGatherer,
    font: Arc<FontArc>,
    config: CoreConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        coordinator: Arc<CacheCoordinator>,
        gatherer: PipelineGatherer,
        font: Arc<FontArc>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            gatherer,
            font,
            config,
        }
    }

    /// Spawn `config.max_concurrent_tasks` worker loops (spec §4.8: "a fixed
    /// set of worker slots"). Each loop exits once `TaskStore::next()`
    /// returns `None`, i.e. after the store is shut down.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.max_concurrent_tasks)
            .map(|slot| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.worker_loop(slot).await })
            })
            .collect()
    }

    /// Spawn the background maintenance loop (timeout sweep + history
    /// pruning, spec §5), ticking every `cleanup_interval_seconds`.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.maintenance_loop().await })
    }

    /// Spawn the background persistence flusher (spec §4.6: "a background
    /// flusher writes the full pending+processing set to durable storage
    /// every `persistence_interval`"), ticking every
    /// `persistence_interval_seconds`.
    pub fn spawn_persistence_flusher(self: &Arc<Self>, pool: SqlitePool) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.persistence_loop(pool).await })
    }

    /// Snapshot the task store's pending+processing set and overwrite the
    /// durable `tasks` table with it. Public so a caller can also invoke it
    /// once on graceful shutdown, outside the periodic loop.
    pub async fn persist_now(&self, pool: &SqlitePool) {
        let (pending, mut processing) = self.store.snapshot_for_persistence();
        let mut all = pending;
        all.append(&mut processing);
        if let Err(err) = persistence::replace_all(pool, &all).await {
            warn!(error = %err, "failed to persist task queue snapshot");
        }
    }

    async fn persistence_loop(&self, pool: SqlitePool) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.persistence_interval_seconds));
        loop {
            interval.tick().await;
            self.persist_now(&pool).await;
            if self.store.is_shutdown() {
                debug!("persistence loop exiting: task store shut down");
                return;
            }
        }
    }

    async fn worker_loop(&self, slot: usize) {
        debug!(slot, "scheduler worker starting");
        loop {
            let Some(task) = self.store.next().await else {
                debug!(slot, "task store shut down; worker exiting");
                return;
            };
            self.run_task(task).await;
        }
    }

    async fn maintenance_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.cleanup_interval_seconds));
        let timeout = ChronoDuration::seconds(self.config.task_timeout_seconds as i64);
        loop {
            interval.tick().await;
            if self.store.is_shutdown() {
                debug!("maintenance loop exiting: task store shut down");
                return;
            }
            let timed_out = self.store.sweep_timeouts(timeout);
            if !timed_out.is_empty() {
                warn!(count = timed_out.len(), "swept timed-out running tasks");
            }
            self.store.prune_history();

            let (aged_out, evicted) = self
                .coordinator
                .run_eviction(self.config.image_cache_max_age_days, self.config.max_cache_size_bytes)
                .await;
            if aged_out > 0 || evicted > 0 {
                debug!(aged_out, evicted, "persistent image cache eviction pass");
            }
        }
    }

    async fn run_task(&self, task: TranslationTask) {
        let task_id = task.task_id;
        if task.is_cancelled() {
            self.store.finalize_cancelled(task_id);
            return;
        }

        match self.process(&task).await {
            Ok(Some(result_meta)) => {
                self.store.complete(task_id, true, None, Some(result_meta));
            }
            Ok(None) => {
                debug!(task_id = %task_id, "task observed cancellation mid-flight");
                self.store.finalize_cancelled(task_id);
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "translation task failed");
                self.store.complete(task_id, false, Some(err.to_string()), None);
            }
        }
    }

    /// Run the per-page pipeline for `task`. Returns `Ok(None)` if the task
    /// was cancelled between stages, never `Err` for a provider-level
    /// translation failure (spec §4.12: translation failure degrades to
    /// source text, the task still succeeds).
    async fn process(&self, task: &TranslationTask) -> anyhow::Result<Option<serde_json::Value>> {
        let key = TranslationKey::new(&task.manga_ref, task.page_index, &task.language, &task.engine_id);

        if !task.force_retranslate {
            match self.coordinator.lookup(&key).await? {
                CacheLookup::Rendered(_, _) => {
                    debug!(key = %key.as_string(), "scheduler: served from cache, no pipeline run");
                    return Ok(Some(serde_json::json!({"cache": "hit"})));
                }
                CacheLookup::ArtifactOnly(cached) => {
                    if task.is_cancelled() {
                        return Ok(None);
                    }
                    return self.render_only(task, &key, cached).await.map(Some);
                }
                CacheLookup::Miss => {}
            }
        }

        let Some(gathered) = self.gatherer.gather(task).await? else {
            return Ok(None);
        };

        if task.is_cancelled() {
            return Ok(None);
        }
        let image = image::load_from_memory(&gathered.source_bytes)
            .map_err(|err| anyhow::anyhow!(err).context("failed to decode source page for rendering"))?
            .to_rgba8();
        let rendered = render_page(image, &gathered.groups, &gathered.translations, &task.language, &self.font)
            .map_err(|err| err.context("render stage failed"))?;

        let layout_hints: Vec<ArtifactLayoutHints> = gathered
            .groups
            .iter()
            .zip(gathered.translations.iter())
            .map(|(group, translated)| compute_layout(group, translated, &task.language).into())
            .collect();
        let artifact = TranslationArtifact {
            text_groups: gathered.groups,
            translations: gathered.translations,
            layout_hints,
        };

        self.coordinator
            .store(
                &key,
                &gathered.fingerprint,
                &artifact,
                rendered.as_raw(),
                rendered.width(),
                rendered.height(),
                self.config.webp_quality,
            )
            .await?;

        Ok(Some(serde_json::json!({"cache": "miss", "partial": gathered.partial})))
    }

    /// Re-render a page whose structured artifact is still valid but whose
    /// rendered bytes were evicted; no re-OCR or re-translation needed.
    async fn render_only(
        &self,
        task: &TranslationTask,
        key: &TranslationKey,
        cached: CachedArtifact,
    ) -> anyhow::Result<serde_json::Value> {
        let source_bytes = self.coordinator_source_bytes(task).await?;
        let image = image::load_from_memory(&source_bytes)
            .map_err(|err| anyhow::anyhow!(err).context("failed to decode source page for rendering"))?
            .to_rgba8();

        let rendered = render_page(
            image,
            &cached.artifact.text_groups,
            &cached.artifact.translations,
            &task.language,
            &self.font,
        )
        .map_err(|err| err.context("render-only stage failed"))?;

        self.coordinator
            .store_rendered_only(
                key,
                &cached.source_fingerprint,
                rendered.as_raw(),
                rendered.width(),
                rendered.height(),
                self.config.webp_quality,
            )
            .await?;

        info!(key = %key.as_string(), "re-rendered page from cached artifact");
        Ok(serde_json::json!({"cache": "artifact_only"}))
    }

    async fn coordinator_source_bytes(&self, task: &TranslationTask) -> anyhow::Result<Vec<u8>> {
        self.gatherer.source.read_source(&task.manga_ref, task.page_index).await
    }
}
