//! Outbound event bus (spec §6).
//!
//! Grounded on the teacher's `tracing`-structured lifecycle logging
//! (`batch/service.rs`, `cron/tasks.rs`) generalized into a typed event plus
//! a subscriber list. Subscriber callbacks must never be able to affect
//! scheduler state (spec §4.6): [`EventBus::emit`] runs each callback behind
//! `catch_unwind` and only logs a panicking subscriber.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::task::model::TranslationTask;

/// A point-in-time copy of a task, attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: uuid::Uuid,
    pub manga_ref: String,
    pub page_index: u32,
    pub language: String,
    pub engine_id: String,
    pub status: crate::task::model::TaskStatus,
    pub retry_count: u32,
}

impl From<&TranslationTask> for TaskSnapshot {
    fn from(task: &TranslationTask) -> Self {
        Self {
            task_id: task.task_id,
            manga_ref: task.manga_ref.clone(),
            page_index: task.page_index,
            language: task.language.clone(),
            engine_id: task.engine_id.clone(),
            status: task.status,
            retry_count: task.retry_count,
        }
    }
}

/// Every transition in the task lifecycle emits one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    TaskAdded {
        task: TaskSnapshot,
        at: DateTime<Utc>,
    },
    TaskStarted {
        task: TaskSnapshot,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        task: TaskSnapshot,
        result_meta: serde_json::Value,
        at: DateTime<Utc>,
    },
    TaskFailed {
        task: TaskSnapshot,
        error: String,
        at: DateTime<Utc>,
    },
    TaskCancelled {
        task: TaskSnapshot,
        at: DateTime<Utc>,
    },
    TaskRetried {
        task: TaskSnapshot,
        attempt: u32,
        at: DateTime<Utc>,
    },
    QueueCleared {
        at: DateTime<Utc>,
    },
    CacheCleared {
        cache_type: String,
        at: DateTime<Utc>,
    },
}

/// A subscriber callback. Boxed so [`EventBus`] can hold a heterogeneous list.
pub type Subscriber = Arc<dyn Fn(TaskEvent) + Send + Sync>;

/// Fan-out point for [`TaskEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Returns nothing resembling a handle: this core
    /// never unregisters subscribers itself — the embedding API layer's
    /// WebSocket broadcaster is expected to live for the process lifetime.
    pub fn subscribe(&self, callback: Subscriber) {
        self.subscribers.write().push(callback);
    }

    /// Emit an event to every subscriber. A panicking subscriber is caught
    /// and logged; it never propagates into scheduler state.
    pub fn emit(&self, event: TaskEvent) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            let subscriber = subscriber.clone();
            let event = event.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "event subscriber panicked; ignoring");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscribers.read().len())
            .finish()
    }
}
