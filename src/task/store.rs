//! Task model & store (C6, spec §4.6).
//!
//! Grounded on `trovato-kernel/src/batch/service.rs` for the
//! create/transition/save lifecycle shape, generalized from a single Redis
//! record per operation into an in-memory priority queue with its own
//! background flusher (SPEC_FULL.md §D). The reentrant-mutex-guarded state
//! machine described in spec §5 is a `parking_lot::Mutex<Inner>`; `next()`
//! is the only method that suspends, via `tokio::sync::Notify`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::events::{EventBus, TaskEvent, TaskSnapshot};
use crate::task::model::{DedupKey, Priority, TaskStatus, TranslationTask};
use crate::task::priority::{self, ReadingDirection};

/// Why [`TaskStore::enqueue`] refused to admit a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejection {
    QueueFull,
    Duplicate,
}

struct Inner {
    pending: Vec<TranslationTask>,
    processing: HashMap<Uuid, TranslationTask>,
    completed: VecDeque<TranslationTask>,
    failed: VecDeque<TranslationTask>,
    cancelled: VecDeque<TranslationTask>,
    keys_in_flight: HashMap<DedupKey, u32>,
    current_manga_ref: String,
    current_page_index: u32,
    reading_direction: ReadingDirection,
}

/// The durable priority queue described in spec §4.6.
pub struct TaskStore {
    inner: Mutex<Inner>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    events: EventBus,
    max_queue_size: usize,
    max_concurrent_tasks: usize,
    max_preload_distance: u32,
    history_retention: ChronoDuration,
    shutdown: std::sync::atomic::AtomicBool,
}

impl TaskStore {
    pub fn new(
        clock: Arc<dyn Clock>,
        events: EventBus,
        max_queue_size: usize,
        max_concurrent_tasks: usize,
        max_preload_distance: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: Vec::new(),
                processing: HashMap::new(),
                completed: VecDeque::new(),
                failed: VecDeque::new(),
                cancelled: VecDeque::new(),
                keys_in_flight: HashMap::new(),
                current_manga_ref: String::new(),
                current_page_index: 0,
                reading_direction: ReadingDirection::Ltr,
            }),
            notify: Notify::new(),
            clock,
            events,
            max_queue_size,
            max_concurrent_tasks,
            max_preload_distance,
            history_retention: ChronoDuration::hours(24),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Admit a task. Rejects duplicates (unless `force_retranslate`) and a
    /// full pending queue.
    pub fn enqueue(&self, mut task: TranslationTask) -> Result<Uuid, EnqueueRejection> {
        let mut inner = self.inner.lock();

        if inner.pending.len() >= self.max_queue_size {
            return Err(EnqueueRejection::QueueFull);
        }

        let dedup_key = task.dedup_key();
        if !task.force_retranslate && inner.keys_in_flight.contains_key(&dedup_key) {
            return Err(EnqueueRejection::Duplicate);
        }

        // Priority is evaluated against whatever reading position the store
        // currently knows about, so a late `reorder()` isn't required just
        // to get a sane initial class.
        task.priority = priority::priority_class(
            &task.manga_ref,
            task.page_index,
            &inner.current_manga_ref,
            inner.current_page_index,
        );

        let task_id = task.task_id;
        *inner.keys_in_flight.entry(dedup_key).or_insert(0) += 1;
        inner.pending.push(task.clone());
        Self::sort_pending(&mut inner, self.max_preload_distance);

        debug!(task_id = %task_id, manga_ref = %task.manga_ref, page = task.page_index, "task enqueued");
        self.events.emit(TaskEvent::TaskAdded {
            task: TaskSnapshot::from(&task),
            at: self.clock.now(),
        });
        self.notify.notify_waiters();
        Ok(task_id)
    }

    /// Dequeue the highest-priority pending task, suspending until one is
    /// admitted (or the store is shut down).
    pub async fn next(&self) -> Option<TranslationTask> {
        loop {
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock();
                if self.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                    return None;
                }
                if inner.processing.len() < self.max_concurrent_tasks && !inner.pending.is_empty() {
                    let mut task = inner.pending.remove(0);
                    task.status = TaskStatus::Running;
                    task.start_time = Some(self.clock.now());
                    inner.processing.insert(task.task_id, task.clone());
                    self.events.emit(TaskEvent::TaskStarted {
                        task: TaskSnapshot::from(&task),
                        at: self.clock.now(),
                    });
                    return Some(task);
                }
                if self.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Transition a Running task to Completed or Failed (re-enqueuing on a
    /// retryable failure).
    pub fn complete(
        &self,
        task_id: Uuid,
        success: bool,
        error: Option<String>,
        result_meta: Option<serde_json::Value>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut task) = inner.processing.remove(&task_id) else {
            return false;
        };

        if success {
            task.status = TaskStatus::Completed;
            task.end_time = Some(self.clock.now());
            self.decrement_in_flight(&mut inner, &task);
            self.events.emit(TaskEvent::TaskCompleted {
                task: TaskSnapshot::from(&task),
                result_meta: result_meta.unwrap_or(serde_json::Value::Null),
                at: self.clock.now(),
            });
            inner.completed.push_back(task);
        } else {
            task.last_error = error.clone();
            if task.retry_count < task.max_retries {
                task.retry_count += 1;
                task.status = TaskStatus::Pending;
                task.start_time = None;
                task.end_time = None;
                let attempt = task.retry_count;
                inner.pending.push(task.clone());
                Self::sort_pending(&mut inner, self.max_preload_distance);
                self.events.emit(TaskEvent::TaskRetried {
                    task: TaskSnapshot::from(&task),
                    attempt,
                    at: self.clock.now(),
                });
            } else {
                task.status = TaskStatus::Failed;
                task.end_time = Some(self.clock.now());
                self.decrement_in_flight(&mut inner, &task);
                self.events.emit(TaskEvent::TaskFailed {
                    task: TaskSnapshot::from(&task),
                    error: error.unwrap_or_else(|| "unknown error".to_string()),
                    at: self.clock.now(),
                });
                inner.failed.push_back(task);
            }
        }

        self.notify.notify_waiters();
        true
    }

    /// Cancel a task. Pending tasks are removed immediately; a Running task
    /// is only flagged — the worker observes it at the next stage boundary
    /// and calls [`TaskStore::finalize_cancelled`].
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let mut inner = self.inner.lock();

        if let Some(pos) = inner.pending.iter().position(|t| t.task_id == task_id) {
            let mut task = inner.pending.remove(pos);
            task.status = TaskStatus::Cancelled;
            task.end_time = Some(self.clock.now());
            self.decrement_in_flight(&mut inner, &task);
            self.events.emit(TaskEvent::TaskCancelled {
                task: TaskSnapshot::from(&task),
                at: self.clock.now(),
            });
            inner.cancelled.push_back(task);
            self.notify.notify_waiters();
            return true;
        }

        if let Some(task) = inner.processing.get(&task_id) {
            task.mark_cancelled();
            return true;
        }

        false
    }

    /// Called by a worker once it has observed a Running task's cancellation
    /// flag and unwound the pipeline for it.
    pub fn finalize_cancelled(&self, task_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut task) = inner.processing.remove(&task_id) else {
            return false;
        };
        task.status = TaskStatus::Cancelled;
        task.end_time = Some(self.clock.now());
        self.decrement_in_flight(&mut inner, &task);
        self.events.emit(TaskEvent::TaskCancelled {
            task: TaskSnapshot::from(&task),
            at: self.clock.now(),
        });
        inner.cancelled.push_back(task);
        self.notify.notify_waiters();
        true
    }

    /// Re-evaluate priority of every pending task against a new reading
    /// position and re-sort. Does not preempt Running tasks.
    pub fn reorder(&self, current_manga_ref: &str, current_page_index: u32) {
        let mut inner = self.inner.lock();
        inner.current_manga_ref = crate::keys::normalize_manga_ref(current_manga_ref);
        inner.current_page_index = current_page_index;

        let current_ref = inner.current_manga_ref.clone();
        let current_page = inner.current_page_index;
        for task in inner.pending.iter_mut() {
            task.priority =
                priority::priority_class(&task.manga_ref, task.page_index, &current_ref, current_page);
        }
        Self::sort_pending(&mut inner, self.max_preload_distance);
    }

    pub fn set_reading_direction(&self, direction: ReadingDirection) {
        let mut inner = self.inner.lock();
        inner.reading_direction = direction;
        Self::sort_pending(&mut inner, self.max_preload_distance);
    }

    /// Purge queue state. `None` clears everything except in-flight Running
    /// tasks; `Some(status)` clears only that bucket.
    pub fn clear(&self, status_filter: Option<TaskStatus>) {
        let mut inner = self.inner.lock();
        match status_filter {
            None => {
                for task in inner.pending.drain(..).collect::<Vec<_>>() {
                    Self::decrement_in_flight_static(&mut inner.keys_in_flight, &task);
                }
                inner.completed.clear();
                inner.failed.clear();
                inner.cancelled.clear();
                self.events.emit(TaskEvent::QueueCleared { at: self.clock.now() });
            }
            Some(TaskStatus::Pending) => {
                for task in inner.pending.drain(..).collect::<Vec<_>>() {
                    Self::decrement_in_flight_static(&mut inner.keys_in_flight, &task);
                }
                self.events.emit(TaskEvent::QueueCleared { at: self.clock.now() });
            }
            Some(TaskStatus::Completed) => inner.completed.clear(),
            Some(TaskStatus::Failed) => inner.failed.clear(),
            Some(TaskStatus::Cancelled) => inner.cancelled.clear(),
            Some(TaskStatus::Running) => { /* Running tasks are live; not purged by clear(). */ }
        }
    }

    pub fn queue_length(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn processing_count(&self) -> usize {
        self.inner.lock().processing.len()
    }

    pub fn status_of(&self, task_id: Uuid) -> Option<TaskStatus> {
        let inner = self.inner.lock();
        if let Some(t) = inner.pending.iter().find(|t| t.task_id == task_id) {
            return Some(t.status);
        }
        if let Some(t) = inner.processing.get(&task_id) {
            return Some(t.status);
        }
        if inner.completed.iter().any(|t| t.task_id == task_id) {
            return Some(TaskStatus::Completed);
        }
        if inner.failed.iter().any(|t| t.task_id == task_id) {
            return Some(TaskStatus::Failed);
        }
        if inner.cancelled.iter().any(|t| t.task_id == task_id) {
            return Some(TaskStatus::Cancelled);
        }
        None
    }

    /// Snapshot of (pending, processing) for the background flusher.
    pub fn snapshot_for_persistence(&self) -> (Vec<TranslationTask>, Vec<TranslationTask>) {
        let inner = self.inner.lock();
        (
            inner.pending.clone(),
            inner.processing.values().cloned().collect(),
        )
    }

    /// Reload tasks from durable storage. Running tasks demote to Pending
    /// (spec §3: idempotent reprocessing is relied upon).
    pub fn restore(&self, tasks: Vec<TranslationTask>) {
        let mut inner = self.inner.lock();
        for mut task in tasks {
            task.status = TaskStatus::Pending;
            task.start_time = None;
            let dedup_key = task.dedup_key();
            *inner.keys_in_flight.entry(dedup_key).or_insert(0) += 1;
            inner.pending.push(task);
        }
        Self::sort_pending(&mut inner, self.max_preload_distance);
    }

    /// Background maintenance: fail Running tasks older than `timeout`.
    pub fn sweep_timeouts(&self, timeout: ChronoDuration) -> Vec<Uuid> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let timed_out: Vec<Uuid> = inner
            .processing
            .values()
            .filter(|t| {
                t.start_time
                    .map(|start| now - start > timeout)
                    .unwrap_or(false)
            })
            .map(|t| t.task_id)
            .collect();
        drop(inner);

        for task_id in &timed_out {
            self.complete(*task_id, false, Some("timeout".to_string()), None);
        }
        timed_out
    }

    /// Background maintenance: prune completed/failed/cancelled history
    /// older than the retention window (24h, spec §3).
    pub fn prune_history(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let retention = self.history_retention;
        inner
            .completed
            .retain(|t| t.end_time.map(|e| now - e < retention).unwrap_or(true));
        inner
            .failed
            .retain(|t| t.end_time.map(|e| now - e < retention).unwrap_or(true));
        inner
            .cancelled
            .retain(|t| t.end_time.map(|e| now - e < retention).unwrap_or(true));
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn decrement_in_flight(&self, inner: &mut Inner, task: &TranslationTask) {
        Self::decrement_in_flight_static(&mut inner.keys_in_flight, task);
    }

    fn decrement_in_flight_static(keys_in_flight: &mut HashMap<DedupKey, u32>, task: &TranslationTask) {
        let key = task.dedup_key();
        if let Some(count) = keys_in_flight.get_mut(&key) {
            if *count <= 1 {
                keys_in_flight.remove(&key);
            } else {
                *count -= 1;
            }
        }
    }

    /// Sort by `(priority class, reading weight descending, request_time)`.
    /// The weight already folds in distance decay, direction favoredness,
    /// and spec §4.7's flattening rule (`reading_weight` returns the same
    /// flat weight for every task past `max_preload_distance`, so those
    /// ties correctly fall through to submission order instead of keeping
    /// the raw distance as an unbounded tie-breaker).
    fn sort_pending(inner: &mut Inner, max_preload_distance: u32) {
        let current_ref = inner.current_manga_ref.clone();
        let current_page = inner.current_page_index;
        let direction = inner.reading_direction;

        inner.pending.sort_by(|a, b| {
            let ka = sort_key(a, &current_ref, current_page, direction, max_preload_distance);
            let kb = sort_key(b, &current_ref, current_page, direction, max_preload_distance);
            ka.0.cmp(&kb.0)
                .then_with(|| kb.1.partial_cmp(&ka.1).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| ka.2.cmp(&kb.2))
        });
    }
}

fn sort_key(
    task: &TranslationTask,
    current_ref: &str,
    current_page: u32,
    direction: ReadingDirection,
    max_preload_distance: u32,
) -> (Priority, f64, chrono::DateTime<chrono::Utc>) {
    let weight = priority::reading_weight(
        &task.manga_ref,
        task.page_index,
        current_ref,
        current_page,
        direction,
        max_preload_distance,
    );
    (task.priority, weight, task.request_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::task::model::Metadata;

    fn store() -> (TaskStore, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let store = TaskStore::new(clock.clone(), EventBus::new(), 100, 3, 5);
        (store, clock)
    }

    fn task(manga_ref: &str, page: u32, clock: &FakeClock) -> TranslationTask {
        TranslationTask::new(
            manga_ref,
            page,
            "zh",
            "google",
            Priority::P3Other,
            false,
            clock.now(),
            Metadata::new(),
        )
    }

    #[tokio::test]
    async fn enqueue_then_next_respects_priority_and_fifo() {
        let (store, clock) = store();
        store.reorder("/m/a.zip", 10);

        let t_other = task("/m/b.zip", 0, &clock);
        let t_current = task("/m/a.zip", 10, &clock);
        store.enqueue(t_other).unwrap();
        store.enqueue(t_current.clone()).unwrap();

        let first = store.next().await.unwrap();
        assert_eq!(first.task_id, t_current.task_id);
    }

    #[tokio::test]
    async fn tasks_beyond_preload_distance_tie_and_fall_back_to_fifo() {
        let (store, clock) = store();
        store.reorder("/m/a.zip", 10);

        // Both pages are farther than max_preload_distance (5) from the
        // current page, so reading_weight flattens them to the same
        // constant weight regardless of how far each actually is.
        let far = task("/m/a.zip", 100, &clock);
        store.enqueue(far.clone()).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let farther = task("/m/a.zip", 50, &clock);
        store.enqueue(farther).unwrap();

        let first = store.next().await.unwrap();
        assert_eq!(
            first.task_id, far.task_id,
            "equal flattened weight falls back to submission order, not raw distance"
        );
    }

    #[tokio::test]
    async fn duplicate_without_force_retranslate_is_rejected() {
        let (store, clock) = store();
        let t1 = task("/m/a.zip", 3, &clock);
        let t2 = task("/m/a.zip", 3, &clock);
        store.enqueue(t1).unwrap();
        let err = store.enqueue(t2).unwrap_err();
        assert_eq!(err, EnqueueRejection::Duplicate);
    }

    #[tokio::test]
    async fn duplicate_with_force_retranslate_is_admitted() {
        let (store, clock) = store();
        let t1 = task("/m/a.zip", 3, &clock);
        let mut t2 = task("/m/a.zip", 3, &clock);
        t2.force_retranslate = true;
        store.enqueue(t1).unwrap();
        assert!(store.enqueue(t2).is_ok());
    }

    #[tokio::test]
    async fn queue_full_rejects_admission() {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let store = TaskStore::new(clock.clone(), EventBus::new(), 2, 3, 5);
        store.enqueue(task("/m/a.zip", 0, &clock)).unwrap();
        store.enqueue(task("/m/a.zip", 1, &clock)).unwrap();
        let err = store.enqueue(task("/m/a.zip", 2, &clock)).unwrap_err();
        assert_eq!(err, EnqueueRejection::QueueFull);
        assert_eq!(store.queue_length(), 2);
    }

    #[tokio::test]
    async fn failed_task_retries_until_max_retries_then_moves_to_failed() {
        let (store, clock) = store();
        let t = task("/m/a.zip", 0, &clock);
        let id = store.enqueue(t).unwrap();

        for expected_retry in 1..=3 {
            let running = store.next().await.unwrap();
            assert_eq!(running.task_id, id);
            store.complete(id, false, Some("boom".into()), None);
            let status = store.status_of(id).unwrap();
            if expected_retry <= 3 {
                assert!(matches!(status, TaskStatus::Pending | TaskStatus::Failed));
            }
        }

        // Exhausted max_retries (3): final attempt fails terminally.
        let running = store.next().await.unwrap();
        store.complete(id, false, Some("boom".into()), None);
        assert_eq!(running.task_id, id);
        assert_eq!(store.status_of(id), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn cancel_pending_task_removes_it_immediately() {
        let (store, clock) = store();
        let t = task("/m/a.zip", 0, &clock);
        let id = store.enqueue(t).unwrap();
        assert!(store.cancel(id));
        assert_eq!(store.status_of(id), Some(TaskStatus::Cancelled));
        assert_eq!(store.queue_length(), 0);
    }

    #[tokio::test]
    async fn cancel_running_task_is_cooperative() {
        let (store, clock) = store();
        let t = task("/m/a.zip", 0, &clock);
        let id = store.enqueue(t).unwrap();
        let running = store.next().await.unwrap();
        assert!(store.cancel(id));
        // Still Running until the worker acknowledges via finalize_cancelled.
        assert_eq!(store.status_of(id), Some(TaskStatus::Running));
        assert!(running.is_cancelled());
        store.finalize_cancelled(id);
        assert_eq!(store.status_of(id), Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn restore_demotes_running_to_pending() {
        let (store, clock) = store();
        let mut t = task("/m/a.zip", 0, &clock);
        t.status = TaskStatus::Running;
        store.restore(vec![t]);
        assert_eq!(store.queue_length(), 1);
        assert_eq!(store.processing_count(), 0);
    }

    #[tokio::test]
    async fn sweep_timeouts_fails_stale_running_tasks() {
        let (store, clock) = store();
        let t = task("/m/a.zip", 0, &clock);
        let id = store.enqueue(t).unwrap();
        store.next().await;
        clock.advance(ChronoDuration::seconds(301));
        let timed_out = store.sweep_timeouts(ChronoDuration::seconds(300));
        assert_eq!(timed_out, vec![id]);
        assert_eq!(store.status_of(id), Some(TaskStatus::Failed));
    }
}
