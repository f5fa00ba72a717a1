//! Task data model (spec §3, §4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tagged, bounded "duck-typed" value used in [`TranslationTask::metadata`].
///
/// Grounded on SPEC_FULL.md design note D: a schema-bounded sum type rather
/// than an open `serde_json::Value`, so a malformed value fails to
/// deserialize at load time instead of silently round-tripping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetadataValue>),
    Map(HashMap<String, MetadataValue>),
}

pub type Metadata = HashMap<String, MetadataValue>;

/// Priority class (spec §4.7). Declaration order is the sort order: `P0Current`
/// is smallest/highest-priority, `P3Other` is largest/lowest-priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0Current,
    P1Adjacent,
    P2SameWork,
    P3Other,
}

/// Lifecycle status (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The four-tuple that identifies a unit of translation work, used for
/// deduplication (`keys_in_flight`) and as the join key with the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub manga_ref: String,
    pub page_index: u32,
    pub language: String,
    pub engine_id: String,
}

/// A unit of translation work tracked by the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationTask {
    pub task_id: Uuid,
    pub manga_ref: String,
    pub page_index: u32,
    pub language: String,
    pub engine_id: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub request_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub force_retranslate: bool,
    pub metadata: Metadata,

    /// Cooperative cancellation flag. Not persisted: a reloaded task starts
    /// with cancellation cleared (spec §3: Running tasks reload as Pending
    /// and are idempotently reprocessed).
    #[serde(skip, default = "default_cancel_flag")]
    pub cancelled: Arc<AtomicBool>,
}

fn default_cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

impl TranslationTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manga_ref: impl Into<String>,
        page_index: u32,
        language: impl Into<String>,
        engine_id: impl Into<String>,
        priority: Priority,
        force_retranslate: bool,
        request_time: DateTime<Utc>,
        metadata: Metadata,
    ) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            manga_ref: crate::keys::normalize_manga_ref(&manga_ref.into()),
            page_index,
            language: language.into().trim().to_lowercase(),
            engine_id: engine_id.into().trim().to_lowercase(),
            priority,
            status: TaskStatus::Pending,
            request_time,
            start_time: None,
            end_time: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            force_retranslate,
            metadata,
            cancelled: default_cancel_flag(),
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            manga_ref: self.manga_ref.clone(),
            page_index: self.page_index,
            language: self.language.clone(),
            engine_id: self.engine_id.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
