//! External interface façade (spec §6).
//!
//! Everything an embedding API layer needs, collected behind one struct so
//! it never has to reach past it into the scheduler, task store, or cache
//! coordinator directly. Grounded on the teacher's `AppState`-style handle
//! (`kernel/src/lib.rs`): one `Arc`-cloneable struct holding every
//! long-lived collaborator, constructed once at process start and shared
//! across request handlers.
//!
//! Translation engine construction (`start_service`'s `translator_type` /
//! `api_key` / `model`) is itself an external collaborator per spec §1 ("the
//! translation engine [is] treated as a replaceable capability provider;
//! only [its] interface is specified") — [`EngineFactory`] is that contract.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::coordinator::SourceReader;
use crate::cache::{CacheCoordinator, CacheLookup, CacheSourceLayer, CacheStats};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::harmonize::HarmonizationMap;
use crate::keys::TranslationKey;
use crate::pipeline::{OcrProvider, StringCache, TranslationEngine, TranslationService};
use crate::scheduler::{PipelineGatherer, Scheduler};
use crate::task::model::{Metadata, Priority, TaskStatus, TranslationTask};
use crate::task::persistence;
use crate::task::priority::ReadingDirection;
use crate::task::store::{EnqueueRejection, TaskStore};

/// Builds a [`TranslationEngine`] for a named provider. The actual HTTP
/// clients for Google/DeepL/zhipu-glm4/etc. are out of scope for this core
/// (spec §1); an embedding application supplies this factory.
pub trait EngineFactory: Send + Sync {
    fn build(
        &self,
        translator_type: &str,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Result<Arc<dyn TranslationEngine>>;
}

/// `{ok, message}` response shape shared by `start_service`/`stop_service`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceAck {
    pub ok: bool,
    pub message: String,
}

/// `get_translated_page` response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TranslatedPage {
    pub is_translated: bool,
    pub image_bytes: Option<Vec<u8>>,
    pub source_layer: Option<CacheSourceLayer>,
}

/// `check_cache_status` response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatus {
    pub has_cache: bool,
    pub source_layer: Option<CacheSourceLayer>,
}

/// `get_service_status` response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub queue_length: usize,
    pub processing_count: usize,
    pub stats: CacheStats,
    pub worker_count: usize,
}

struct RunningScheduler {
    scheduler: Arc<Scheduler>,
    workers: Vec<JoinHandle<()>>,
    maintenance: JoinHandle<()>,
    persistence: JoinHandle<()>,
}

/// The translation coordination core's external surface. One instance per
/// embedding process; cheap to clone (everything inside is an `Arc`).
pub struct Service {
    store: Arc<TaskStore>,
    coordinator: Arc<CacheCoordinator>,
    source: Arc<dyn SourceReader>,
    ocr: Arc<dyn OcrProvider>,
    harmonization: Arc<HarmonizationMap>,
    string_cache: Arc<StringCache>,
    engine_factory: Arc<dyn EngineFactory>,
    /// Backing store for the task queue's durable snapshot (spec §4.6). Kept
    /// separate from the result cache's pool since the two durable stores
    /// (`task_queue.<db>`, `structured_results.<db>`) are distinct per spec §6.
    task_pool: SqlitePool,
    /// Loaded lazily in [`Service::start_service`], not at construction —
    /// nothing before that point needs a rasterized font.
    font_path: PathBuf,
    config: CoreConfig,
    running: AsyncMutex<Option<RunningScheduler>>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        coordinator: Arc<CacheCoordinator>,
        source: Arc<dyn SourceReader>,
        ocr: Arc<dyn OcrProvider>,
        harmonization: Arc<HarmonizationMap>,
        string_cache: Arc<StringCache>,
        engine_factory: Arc<dyn EngineFactory>,
        task_pool: SqlitePool,
        font_path: impl Into<PathBuf>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            source,
            ocr,
            harmonization,
            string_cache,
            engine_factory,
            task_pool,
            font_path: font_path.into(),
            config,
            running: AsyncMutex::new(None),
        }
    }

    /// Load the durable task snapshot back into the in-memory store,
    /// demoting anything that was Running at last shutdown to Pending (spec
    /// §4.6, §8 invariant 6). Intended to be called once by the embedder
    /// after construction and before the first `start_service`, mirroring
    /// the teacher's own startup loader (`db::run_migrations` then a
    /// one-shot reload pass in `main.rs`).
    pub async fn restore_from_disk(&self) -> CoreResult<()> {
        let tasks = persistence::load_tasks(&self.task_pool).await.map_err(CoreError::Cache)?;
        let restored = tasks.len();
        self.store.restore(tasks);
        info!(restored, "restored persisted task queue");
        Ok(())
    }

    /// Build the primary (and, if distinct from it, a fallback) translation
    /// engine and spawn the worker pool + maintenance loop. A no-op, ok=true
    /// call if the service is already running.
    pub async fn start_service(
        &self,
        translator_type: &str,
        api_key: Option<String>,
        model: Option<String>,
    ) -> CoreResult<ServiceAck> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(ServiceAck {
                ok: true,
                message: "service already running".to_string(),
            });
        }

        let primary = self
            .engine_factory
            .build(translator_type, api_key, model)
            .map_err(CoreError::Cache)?;

        let fallback = if translator_type != self.config.default_engine {
            self.engine_factory
                .build(&self.config.default_engine, None, None)
                .ok()
        } else {
            None
        };

        let font_bytes = tokio::fs::read(&self.font_path)
            .await
            .with_context(|| format!("failed to read font file at {}", self.font_path.display()))
            .map_err(CoreError::Cache)?;
        let font = ab_glyph::FontArc::try_from_vec(font_bytes)
            .map_err(|err| CoreError::Cache(anyhow::anyhow!("failed to parse font file: {err:?}")))?;

        let translation = Arc::new(TranslationService::new(primary, fallback, self.string_cache.clone()));
        let gatherer = PipelineGatherer::new(
            self.source.clone(),
            self.ocr.clone(),
            translation,
            self.harmonization.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            self.store.clone(),
            self.coordinator.clone(),
            gatherer,
            Arc::new(font),
            self.config.clone(),
        ));

        let workers = scheduler.spawn_workers();
        let maintenance = scheduler.spawn_maintenance();
        let persistence = scheduler.spawn_persistence_flusher(self.task_pool.clone());
        info!(translator_type, workers = workers.len(), "service started");

        *running = Some(RunningScheduler {
            scheduler,
            workers,
            maintenance,
            persistence,
        });
        Ok(ServiceAck {
            ok: true,
            message: "service started".to_string(),
        })
    }

    /// Stop the worker pool and maintenance loop. The task store itself is
    /// left untouched (pending/processing tasks survive) so a later
    /// `start_service` resumes draining the same queue.
    pub async fn stop_service(&self) -> CoreResult<ServiceAck> {
        let mut running = self.running.lock().await;
        let Some(scheduler) = running.take() else {
            return Ok(ServiceAck {
                ok: true,
                message: "service was not running".to_string(),
            });
        };
        // Final flush to durable storage before tearing the loops down
        // (spec §4.6: "...and on graceful shutdown").
        scheduler.scheduler.persist_now(&self.task_pool).await;
        drop(scheduler.scheduler);
        for worker in scheduler.workers {
            worker.abort();
        }
        scheduler.maintenance.abort();
        scheduler.persistence.abort();
        info!("service stopped");
        Ok(ServiceAck {
            ok: true,
            message: "service stopped".to_string(),
        })
    }

    /// Permanently end this service: stop the worker pool (if running) and
    /// signal the task store itself, so any call still suspended in
    /// `TaskStore::next()` returns `None` (spec §4.8 step 1: "wait ... until
    /// a task is admitted or shutdown is signalled"). Unlike
    /// [`Service::stop_service`], this cannot be undone by a later
    /// `start_service` — call it once, at process exit.
    pub async fn shutdown(&self) -> CoreResult<()> {
        self.stop_service().await?;
        self.store.shutdown();
        Ok(())
    }

    /// Re-anchor priority calculation to `(manga_ref, current_page_index)`
    /// and re-sort the pending queue.
    pub fn set_current_manga(&self, manga_ref: &str, current_page_index: u32) -> CoreResult<()> {
        self.store.reorder(manga_ref, current_page_index);
        Ok(())
    }

    pub fn set_reading_direction(&self, direction: ReadingDirection) {
        self.store.set_reading_direction(direction);
    }

    /// Enqueue one task per page in `page_indices`. `priority_hint` is
    /// advisory only: `TaskStore::enqueue` always recomputes priority from
    /// the current reading position, so a hint can't make a stale request
    /// outrank a page the reader is actually on.
    pub fn request_translation(
        &self,
        manga_ref: &str,
        page_indices: &[u32],
        language: &str,
        engine_id: Option<&str>,
        force_retranslate: bool,
        priority_hint: Option<Priority>,
    ) -> CoreResult<Vec<Uuid>> {
        let engine_id = engine_id.unwrap_or(&self.config.default_engine);
        let now = chrono::Utc::now();
        let mut task_ids = Vec::with_capacity(page_indices.len());

        for &page_index in page_indices {
            let task = TranslationTask::new(
                manga_ref,
                page_index,
                language,
                engine_id,
                priority_hint.unwrap_or(Priority::P2SameWork),
                force_retranslate,
                now,
                Metadata::new(),
            );
            match self.store.enqueue(task) {
                Ok(id) => task_ids.push(id),
                Err(rejection) => {
                    // Roll back whatever this call already admitted, so a
                    // partial failure never strands live tasks the caller
                    // has no id to track or cancel.
                    for id in &task_ids {
                        self.store.cancel(*id);
                    }
                    return Err(match rejection {
                        EnqueueRejection::QueueFull => CoreError::QueueFull,
                        EnqueueRejection::Duplicate => CoreError::DuplicateTask,
                    });
                }
            }
        }

        debug!(manga_ref, count = task_ids.len(), "requested translation for pages");
        Ok(task_ids)
    }

    /// Synchronous cache lookup only — never enqueues work.
    pub async fn get_translated_page(
        &self,
        manga_ref: &str,
        page_index: u32,
        language: &str,
        engine_id: &str,
    ) -> CoreResult<TranslatedPage> {
        let key = TranslationKey::new(manga_ref, page_index, language, engine_id);
        match self.coordinator.lookup(&key).await.map_err(CoreError::Cache)? {
            CacheLookup::Rendered(bytes, layer) => Ok(TranslatedPage {
                is_translated: true,
                image_bytes: Some(bytes),
                source_layer: Some(layer),
            }),
            CacheLookup::ArtifactOnly(_) | CacheLookup::Miss => Ok(TranslatedPage {
                is_translated: false,
                image_bytes: None,
                source_layer: None,
            }),
        }
    }

    pub async fn check_cache_status(
        &self,
        manga_ref: &str,
        page_index: u32,
        language: &str,
        engine_id: &str,
    ) -> CoreResult<CacheStatus> {
        let key = TranslationKey::new(manga_ref, page_index, language, engine_id);
        match self.coordinator.lookup(&key).await.map_err(CoreError::Cache)? {
            CacheLookup::Rendered(_, layer) => Ok(CacheStatus {
                has_cache: true,
                source_layer: Some(layer),
            }),
            CacheLookup::ArtifactOnly(_) => Ok(CacheStatus {
                has_cache: true,
                source_layer: None,
            }),
            CacheLookup::Miss => Ok(CacheStatus {
                has_cache: false,
                source_layer: None,
            }),
        }
    }

    pub fn cancel_task(&self, task_id: Uuid) -> CoreResult<()> {
        if self.store.cancel(task_id) {
            Ok(())
        } else {
            Err(CoreError::TaskNotFound)
        }
    }

    pub fn status_of(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.store.status_of(task_id)
    }

    pub async fn get_service_status(&self) -> ServiceStatus {
        let worker_count = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.workers.len())
            .unwrap_or(0);

        ServiceStatus {
            queue_length: self.store.queue_length(),
            processing_count: self.store.processing_count(),
            stats: self.coordinator.stats(),
            worker_count,
        }
    }
}
