//! Configuration surface (spec §6).
//!
//! Grounded on `trovato-kernel/src/config.rs`'s `Config::from_env` pattern.
//! Unlike the teacher, this core has no HTTP surface of its own, so the
//! struct is primarily constructed by the embedding application; `from_env`
//! is kept as a convenience for embedders that do want process-environment
//! configuration.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Resource limits and tunables for the translation coordination core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Worker slots (default 3).
    pub max_concurrent_tasks: usize,

    /// Admission limit for the pending queue (default 100).
    pub max_queue_size: usize,

    /// Running-task age at which the timeout sweep marks a task Failed (default 300).
    pub task_timeout_seconds: u64,

    /// Interval between full task-store flushes to durable storage (default 10).
    pub persistence_interval_seconds: u64,

    /// Interval between maintenance sweeps: timeout + history pruning (default 60).
    pub cleanup_interval_seconds: u64,

    /// Delay before a retried task becomes eligible again (default 30).
    ///
    /// Not a hard scheduling gate (the task store has no per-task timers);
    /// used by the scheduler to avoid hot-looping on a task that just failed.
    pub retry_delay_seconds: u64,

    /// WebP quality used by the persistent image cache (1..=100, default 80).
    pub webp_quality: u8,

    /// Preload horizon in pages (default 5).
    pub max_preload_distance: u32,

    /// Eviction target for the persistent image cache, in bytes.
    pub max_cache_size_bytes: u64,

    /// Age-based eviction cutoff for the persistent image cache, in days.
    pub image_cache_max_age_days: i64,

    /// Engine used when a request does not name one.
    pub default_engine: String,

    /// Root directory for the persistent image cache and its sidecar.
    pub image_cache_dir: PathBuf,

    /// Path to the harmonization map JSON file.
    pub harmonization_map_path: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_queue_size: 100,
            task_timeout_seconds: 300,
            persistence_interval_seconds: 10,
            cleanup_interval_seconds: 60,
            retry_delay_seconds: 30,
            webp_quality: 80,
            max_preload_distance: 5,
            max_cache_size_bytes: 2 * 1024 * 1024 * 1024,
            image_cache_max_age_days: 30,
            default_engine: "google".to_string(),
            image_cache_dir: PathBuf::from("./cache/image_cache"),
            harmonization_map_path: PathBuf::from("./cache/harmonization_map.json"),
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables, falling back to
    /// [`CoreConfig::default`] for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_concurrent_tasks = env::var("MAX_CONCURRENT_TASKS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("MAX_CONCURRENT_TASKS must be a valid usize")?
            .unwrap_or(defaults.max_concurrent_tasks);

        let max_queue_size = env::var("MAX_QUEUE_SIZE")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("MAX_QUEUE_SIZE must be a valid usize")?
            .unwrap_or(defaults.max_queue_size);

        let task_timeout_seconds = env::var("TASK_TIMEOUT_SECONDS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("TASK_TIMEOUT_SECONDS must be a valid u64")?
            .unwrap_or(defaults.task_timeout_seconds);

        let persistence_interval_seconds = env::var("PERSISTENCE_INTERVAL_SECONDS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("PERSISTENCE_INTERVAL_SECONDS must be a valid u64")?
            .unwrap_or(defaults.persistence_interval_seconds);

        let cleanup_interval_seconds = env::var("CLEANUP_INTERVAL_SECONDS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("CLEANUP_INTERVAL_SECONDS must be a valid u64")?
            .unwrap_or(defaults.cleanup_interval_seconds);

        let retry_delay_seconds = env::var("RETRY_DELAY_SECONDS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("RETRY_DELAY_SECONDS must be a valid u64")?
            .unwrap_or(defaults.retry_delay_seconds);

        let webp_quality = env::var("WEBP_QUALITY")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("WEBP_QUALITY must be a valid u8")?
            .unwrap_or(defaults.webp_quality);

        let max_preload_distance = env::var("MAX_PRELOAD_DISTANCE")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("MAX_PRELOAD_DISTANCE must be a valid u32")?
            .unwrap_or(defaults.max_preload_distance);

        let max_cache_size_bytes = env::var("MAX_CACHE_SIZE_BYTES")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("MAX_CACHE_SIZE_BYTES must be a valid u64")?
            .unwrap_or(defaults.max_cache_size_bytes);

        let image_cache_max_age_days = env::var("IMAGE_CACHE_MAX_AGE_DAYS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("IMAGE_CACHE_MAX_AGE_DAYS must be a valid i64")?
            .unwrap_or(defaults.image_cache_max_age_days);

        let default_engine =
            env::var("DEFAULT_ENGINE").unwrap_or(defaults.default_engine.clone());

        let image_cache_dir = env::var("IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.image_cache_dir.clone());

        let harmonization_map_path = env::var("HARMONIZATION_MAP_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.harmonization_map_path.clone());

        Ok(Self {
            max_concurrent_tasks,
            max_queue_size,
            task_timeout_seconds,
            persistence_interval_seconds,
            cleanup_interval_seconds,
            retry_delay_seconds,
            webp_quality,
            max_preload_distance,
            max_cache_size_bytes,
            image_cache_max_age_days,
            default_engine,
            image_cache_dir,
            harmonization_map_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_concurrent_tasks, 3);
        assert_eq!(cfg.max_queue_size, 100);
        assert_eq!(cfg.task_timeout_seconds, 300);
        assert_eq!(cfg.persistence_interval_seconds, 10);
        assert_eq!(cfg.retry_delay_seconds, 30);
        assert_eq!(cfg.webp_quality, 80);
        assert_eq!(cfg.max_preload_distance, 5);
        assert_eq!(cfg.cleanup_interval_seconds, 60);
        assert_eq!(cfg.image_cache_max_age_days, 30);
    }
}
