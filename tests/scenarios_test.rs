//! End-to-end scenario tests for the translation coordination core.
//!
//! Each test below corresponds to one of the concrete seeds in the design
//! notes' testable-properties section. None of them drives a real font
//! through the renderer: no font asset exists to construct one from, and
//! `render_page`/`render_group` are already exercised font-free at the unit
//! level in `pipeline::render`'s own tests. These scenarios instead assemble
//! the layers around the render boundary — task queue, cache coordinator,
//! pipeline gathering — the same way `scheduler`'s own tests do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use panelwright::cache::{
    CacheCoordinator, CacheLookup, CacheSourceLayer, ImageStore, MemoryCache, ResultCache, SourceReader, TranslationArtifact,
};
use panelwright::events::EventBus;
use panelwright::harmonize::HarmonizationMap;
use panelwright::keys::{content_fingerprint, TranslationKey};
use panelwright::pipeline::ocr::{OcrOptions, Quad, TextDirection, TextRegion};
use panelwright::pipeline::{EngineError, OcrProvider, StringCache, TranslationEngine, TranslationService};
use panelwright::scheduler::PipelineGatherer;
use panelwright::task::{Metadata, Priority, ReadingDirection, TaskStore, TranslationTask};

async fn sqlite_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn page_bytes(shade: u8) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(16, 16, image::Rgba([shade, shade, shade, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

struct FixedSource {
    bytes: std::sync::Mutex<Vec<u8>>,
}

#[async_trait]
impl SourceReader for FixedSource {
    async fn read_source(&self, _manga_ref: &str, _page_index: u32) -> anyhow::Result<Vec<u8>> {
        Ok(self.bytes.lock().unwrap().clone())
    }
}

fn sample_artifact(translation: &str) -> TranslationArtifact {
    TranslationArtifact {
        text_groups: vec![],
        translations: vec![translation.to_string()],
        layout_hints: vec![],
    }
}

async fn coordinator(dir: &tempfile::TempDir, source_bytes: Vec<u8>) -> (Arc<CacheCoordinator>, Arc<FixedSource>) {
    let clock = Arc::new(panelwright::clock::SystemClock);
    let images = ImageStore::open(dir.path(), clock).await.unwrap();
    let memory = MemoryCache::default();
    let results = ResultCache::new(sqlite_pool().await);
    let source = Arc::new(FixedSource {
        bytes: std::sync::Mutex::new(source_bytes),
    });
    (
        Arc::new(CacheCoordinator::new(memory, images, results, source.clone())),
        source,
    )
}

/// Scenario A — cold cache single page: after the coordinator stores a
/// freshly rendered artifact, a lookup serves it from the memory layer and
/// the stats reflect the new entry.
#[tokio::test]
async fn scenario_a_cold_cache_then_hit() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _source) = coordinator(&dir, page_bytes(10)).await;
    let key = TranslationKey::new("/m/one.zip", 3, "zh", "google");
    let fp = content_fingerprint(&page_bytes(10)).unwrap();
    let pixels = vec![255u8; 16 * 16 * 4];

    assert!(matches!(coordinator.lookup(&key).await.unwrap(), CacheLookup::Miss));

    coordinator
        .store(&key, &fp, &sample_artifact("hello"), &pixels, 16, 16, 80)
        .await
        .unwrap();

    match coordinator.lookup(&key).await.unwrap() {
        CacheLookup::Rendered(bytes, layer) => {
            assert!(!bytes.is_empty());
            assert_eq!(layer, CacheSourceLayer::Memory);
        }
        _ => panic!("expected a rendered hit"),
    }
    assert_eq!(coordinator.stats().memory_entries, 1);
}

/// Scenario B — prefetch ordering: with one worker slot, dequeue order
/// follows distance from the current page, rtl breaking ties toward the
/// lower index.
#[tokio::test]
async fn scenario_b_prefetch_ordering_favors_distance_then_rtl_direction() {
    let clock = Arc::new(panelwright::clock::SystemClock);
    let events = EventBus::new();
    let store = Arc::new(TaskStore::new(clock, events, 100, 1, 5));
    store.set_reading_direction(ReadingDirection::Rtl);
    store.reorder("/m/a.zip", 10);

    let now = Utc::now();
    for page in [8u32, 9, 11, 12, 7] {
        let task = TranslationTask::new("/m/a.zip", page, "en", "google", Priority::P2SameWork, false, now, Metadata::new());
        store.enqueue(task).unwrap();
    }

    let mut observed = Vec::new();
    for _ in 0..5 {
        let task = store.next().await.unwrap();
        observed.push(task.page_index);
        store.complete(task.task_id, true, None, None);
    }

    assert_eq!(observed, vec![9, 11, 8, 12, 7]);
}

/// Scenario C — cache invalidation on source change: mutating the source
/// image invalidates a prior hit by fingerprint mismatch rather than TTL.
#[tokio::test]
async fn scenario_c_source_mutation_invalidates_cached_hit() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, source) = coordinator(&dir, page_bytes(10)).await;
    let key = TranslationKey::new("/m/one.zip", 0, "en", "google");
    let fp = content_fingerprint(&page_bytes(10)).unwrap();
    let pixels = vec![200u8; 16 * 16 * 4];
    coordinator
        .store(&key, &fp, &sample_artifact("hi"), &pixels, 16, 16, 80)
        .await
        .unwrap();
    assert!(matches!(coordinator.lookup(&key).await.unwrap(), CacheLookup::Rendered(_, _)));

    source.set(page_bytes(99));
    assert!(matches!(coordinator.lookup(&key).await.unwrap(), CacheLookup::Miss));
}

impl FixedSource {
    fn set(&self, bytes: Vec<u8>) {
        *self.bytes.lock().unwrap() = bytes;
    }
}

struct SensitiveOcr;

#[async_trait]
impl OcrProvider for SensitiveOcr {
    async fn recognize(&self, _image_bytes: &[u8], _options: &OcrOptions) -> anyhow::Result<Vec<TextRegion>> {
        Ok(vec![TextRegion {
            quad: Quad::from_bbox(0, 0, 10, 10),
            text: "spicy content".to_string(),
            confidence: 0.9,
            direction: TextDirection::Horizontal,
            merged_count: 1,
        }])
    }
}

struct RefusingEngine {
    id: String,
    refuse_on: Vec<String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TranslationEngine for RefusingEngine {
    async fn translate_batch(&self, texts: &[String], _target_lang: &str) -> Result<Vec<String>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|t| self.refuse_on.contains(t)) {
            return Err(EngineError::SensitiveContent);
        }
        Ok(texts.iter().map(|t| format!("{t} ({})", self.id)).collect())
    }

    fn engine_id(&self) -> &str {
        &self.id
    }
}

/// Scenario D — provider sensitive-content fallback, exercised through the
/// gathering stage rather than the raw `TranslationService` directly: OCR
/// surfaces one region, the primary engine refuses it, the fallback engine
/// completes it, and no failure marker survives into the gathered artifact.
#[tokio::test]
async fn scenario_d_sensitive_content_falls_back_without_failure_markers() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FixedSource {
        bytes: std::sync::Mutex::new(page_bytes(50)),
    });
    let ocr = Arc::new(SensitiveOcr);
    let primary_calls = Arc::new(AtomicUsize::new(0));
    let fallback_calls = Arc::new(AtomicUsize::new(0));
    let primary = Arc::new(RefusingEngine {
        id: "primary".to_string(),
        refuse_on: vec!["spicy content".to_string()],
        calls: primary_calls.clone(),
    });
    let fallback = Arc::new(RefusingEngine {
        id: "fallback".to_string(),
        refuse_on: vec![],
        calls: fallback_calls.clone(),
    });
    let string_cache = Arc::new(StringCache::new(sqlite_pool().await));
    let translation = Arc::new(TranslationService::new(primary, Some(fallback), string_cache));
    let harmonization = Arc::new(HarmonizationMap::open(dir.path().join("harmonization_map.json")).await.unwrap());
    let gatherer = PipelineGatherer::new(source, ocr, translation, harmonization);

    let task = TranslationTask::new("/m/one.zip", 0, "en", "primary", Priority::P0Current, false, Utc::now(), Metadata::new());
    let gathered = gatherer.gather(&task).await.unwrap().unwrap();

    assert_eq!(gathered.translations.len(), 1);
    assert!(!gathered.translations[0].starts_with("[Translation Failed"));
    assert!(!gathered.partial);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
}

/// Scenario E — queue-full rejection: with `max_queue_size = 2`, a third
/// distinct enqueue is refused and `queue_length` stays at the admitted cap.
#[tokio::test]
async fn scenario_e_queue_full_rejects_third_distinct_task() {
    let clock = Arc::new(panelwright::clock::SystemClock);
    let events = EventBus::new();
    let store = TaskStore::new(clock, events, 2, 3, 5);
    let now = Utc::now();

    for page in [0u32, 1] {
        let task = TranslationTask::new("/m/one.zip", page, "en", "google", Priority::P2SameWork, false, now, Metadata::new());
        store.enqueue(task).unwrap();
    }
    let third = TranslationTask::new("/m/one.zip", 2, "en", "google", Priority::P2SameWork, false, now, Metadata::new());
    assert!(store.enqueue(third).is_err());
    assert_eq!(store.queue_length(), 2);
}

/// Scenario F — cooperative cancellation: a task cancelled before gathering
/// starts observes cancellation at the very first stage boundary and never
/// reaches translation, let alone the render/store stage.
#[tokio::test]
async fn scenario_f_cancelled_task_never_reaches_translation_or_cache_store() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FixedSource {
        bytes: std::sync::Mutex::new(page_bytes(10)),
    });
    let ocr = Arc::new(SensitiveOcr);
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Arc::new(RefusingEngine {
        id: "primary".to_string(),
        refuse_on: vec![],
        calls: calls.clone(),
    });
    let string_cache = Arc::new(StringCache::new(sqlite_pool().await));
    let translation = Arc::new(TranslationService::new(engine, None, string_cache));
    let harmonization = Arc::new(HarmonizationMap::open(dir.path().join("harmonization_map.json")).await.unwrap());
    let gatherer = PipelineGatherer::new(source, ocr, translation, harmonization);

    let task = TranslationTask::new("/m/one.zip", 0, "en", "primary", Priority::P0Current, false, Utc::now(), Metadata::new());
    task.mark_cancelled();

    let gathered = gatherer.gather(&task).await.unwrap();
    assert!(gathered.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0, "translation engine must not be called once cancellation is observed");
}
