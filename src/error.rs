//! Crate-level error types.
//!
//! Internal operations thread `anyhow::Result` with `.context(...)` at each
//! boundary (matching the per-function style used throughout the cache and
//! cron modules this crate is grounded on). `CoreError` is the narrower,
//! matchable type returned across the external-interface boundary in
//! [`crate::service`].

use thiserror::Error;

/// Errors observable by a caller of the external interfaces (§6).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("queue is full")]
    QueueFull,

    #[error("a task for this (manga_ref, page_index, language, engine_id) is already in flight")]
    DuplicateTask,

    #[error("task not found")]
    TaskNotFound,

    #[error("cache layer error")]
    Cache(#[from] anyhow::Error),

    #[error("storage I/O error")]
    Io(#[from] std::io::Error),

    #[error("durable store error")]
    Store(#[from] sqlx::Error),
}

/// Result type alias using [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;
