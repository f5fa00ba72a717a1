//! Task model, priority calculation, the in-memory store, and its durable
//! backing (C6, C7).

pub mod model;
pub mod persistence;
pub mod priority;
pub mod store;

pub use model::{DedupKey, Metadata, MetadataValue, Priority, TaskStatus, TranslationTask};
pub use priority::ReadingDirection;
pub use store::{EnqueueRejection, TaskStore};
