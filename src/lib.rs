//! Translation coordination core: priority queue, layered cache coordinator,
//! and per-page OCR → translate → render pipeline for a manga translation
//! viewer.
//!
//! This library never calls `tracing_subscriber::init` itself — an embedding
//! binary owns process-wide logging setup. [`init_tracing`] is provided as a
//! convenience default for binaries/tests that want this crate's own filter,
//! grounded on the teacher's `main.rs::init_tracing`.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod harmonize;
pub mod keys;
pub mod pipeline;
pub mod scheduler;
pub mod service;
pub mod task;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use service::{CacheStatus, EngineFactory, Service, ServiceAck, ServiceStatus, TranslatedPage};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a default `tracing` subscriber honoring `RUST_LOG`, falling back
/// to `info` for this crate and `warn` for `sqlx`'s query logging.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
