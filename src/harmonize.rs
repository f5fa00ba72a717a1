//! Harmonization map (spec §4.7, supplemented from `original_source/`).
//!
//! A small user-maintained find/replace table applied to translated text
//! before it reaches the renderer, letting an operator correct or soften
//! specific phrases without retraining an engine. Ported from
//! `core/harmonization_map_manager.py`'s JSON-file-backed dictionary: same
//! longest-match-first substitution order (so `"apple pie"` is replaced
//! before `"apple"`), same persist-on-every-mutation behavior, rewritten
//! with the write-temp-then-rename durability pattern used by
//! [`crate::cache::image_store`] instead of the original's plain
//! `open().write()`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A durable original-text → harmonized-text substitution table.
pub struct HarmonizationMap {
    path: PathBuf,
    mappings: RwLock<HashMap<String, String>>,
}

impl HarmonizationMap {
    /// Load `path`, creating an empty map if it doesn't exist yet or fails
    /// to parse (matching the original's "log and start empty" recovery).
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create harmonization map directory {}", parent.display()))?;
        }

        let mappings = load_mappings(&path).await;
        Ok(Self {
            path,
            mappings: RwLock::new(mappings),
        })
    }

    /// Add or update a mapping and persist immediately. Rejects an empty
    /// `original_text`, matching the original's guard.
    pub async fn add_or_update(&self, original_text: &str, harmonized_text: &str) -> Result<()> {
        if original_text.is_empty() {
            anyhow::bail!("harmonization mapping original text must not be empty");
        }
        let mut mappings = self.mappings.write().await;
        mappings.insert(original_text.to_string(), harmonized_text.to_string());
        let snapshot = mappings.clone();
        drop(mappings);
        persist_mappings(&self.path, &snapshot).await
    }

    pub async fn delete(&self, original_text: &str) -> Result<bool> {
        let mut mappings = self.mappings.write().await;
        if mappings.remove(original_text).is_none() {
            return Ok(false);
        }
        let snapshot = mappings.clone();
        drop(mappings);
        persist_mappings(&self.path, &snapshot).await?;
        Ok(true)
    }

    pub async fn get(&self, original_text: &str) -> Option<String> {
        self.mappings.read().await.get(original_text).cloned()
    }

    pub async fn all(&self) -> HashMap<String, String> {
        self.mappings.read().await.clone()
    }

    pub async fn clear(&self) -> Result<()> {
        let mut mappings = self.mappings.write().await;
        mappings.clear();
        persist_mappings(&self.path, &mappings).await
    }

    pub async fn reload(&self) {
        let fresh = load_mappings(&self.path).await;
        *self.mappings.write().await = fresh;
        info!(path = %self.path.display(), "reloaded harmonization map from disk");
    }

    /// Apply every mapping to `text`, longest original-text first so a
    /// longer phrase is substituted before a shorter substring of it.
    pub async fn apply(&self, text: &str) -> String {
        let mappings = self.mappings.read().await;
        if mappings.is_empty() || text.is_empty() {
            return text.to_string();
        }

        let mut entries: Vec<(&String, &String)> = mappings.iter().collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut result = text.to_string();
        for (original, harmonized) in entries {
            if result.contains(original.as_str()) {
                result = result.replace(original.as_str(), harmonized);
            }
        }

        if result != text {
            debug!("applied harmonization map to text");
        }
        result
    }
}

async fn load_mappings(path: &Path) -> HashMap<String, String> {
    if !path.exists() {
        warn!(path = %path.display(), "harmonization map file does not exist; starting with an empty map");
        return HashMap::new();
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to parse harmonization map; starting empty");
                HashMap::new()
            }
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read harmonization map; starting empty");
            HashMap::new()
        }
    }
}

async fn persist_mappings(path: &Path, mappings: &HashMap<String, String>) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(mappings).context("failed to serialize harmonization map")?;
    tokio::fs::write(&tmp_path, json)
        .await
        .context("failed to write temp harmonization map file")?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .context("failed to atomically rename harmonization map file")?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn map() -> (HarmonizationMap, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let map = HarmonizationMap::open(dir.path().join("harmonization_map.json")).await.unwrap();
        (map, dir)
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let (map, _dir) = map().await;
        assert!(map.all().await.is_empty());
    }

    #[tokio::test]
    async fn add_then_get_roundtrips() {
        let (map, _dir) = map().await;
        map.add_or_update("foo", "bar").await.unwrap();
        assert_eq!(map.get("foo").await, Some("bar".to_string()));
    }

    #[tokio::test]
    async fn empty_original_text_is_rejected() {
        let (map, _dir) = map().await;
        assert!(map.add_or_update("", "bar").await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_existing_mapping() {
        let (map, _dir) = map().await;
        map.add_or_update("foo", "bar").await.unwrap();
        assert!(map.delete("foo").await.unwrap());
        assert!(!map.delete("foo").await.unwrap());
    }

    #[tokio::test]
    async fn longer_phrases_are_substituted_before_their_substrings() {
        let (map, _dir) = map().await;
        map.add_or_update("apple", "APPLE").await.unwrap();
        map.add_or_update("apple pie", "PIE").await.unwrap();
        assert_eq!(map.apply("I like apple pie").await, "I like PIE");
    }

    #[tokio::test]
    async fn reload_picks_up_external_changes() {
        let (map, dir) = map().await;
        map.add_or_update("foo", "bar").await.unwrap();

        let other = HarmonizationMap::open(dir.path().join("harmonization_map.json")).await.unwrap();
        other.add_or_update("baz", "qux").await.unwrap();

        map.reload().await;
        assert_eq!(map.get("baz").await, Some("qux".to_string()));
    }
}
