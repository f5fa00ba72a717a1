//! Layered cache: memory (C2) → persistent image store (C3) → structured
//! result cache (C4), unified by the coordinator (C5).

pub mod coordinator;
pub mod image_store;
pub mod memory;
pub mod result_store;

pub use coordinator::{CacheCoordinator, CacheLookup, CacheSourceLayer, CacheStats, SourceReader};
pub use image_store::{ImageCacheEntry, ImageStore};
pub use memory::MemoryCache;
pub use result_store::{ArtifactLayoutHints, CachedArtifact, ResultCache, TranslationArtifact};
