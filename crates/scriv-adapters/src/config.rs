//! Configuration for the reconciliation pipeline.
//!
//! Stored as JSON under the user config directory. Every field has a
//! default, so a missing or partial file never blocks startup; a corrupt
//! file is backed up and replaced with defaults.

use scriv_core::document::MergeGuard;
use scriv_core::trim::DEFAULT_MAX_CHARS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Character-equivalent budget for resubmitted histories.
    pub trim_budget: usize,
    /// Staleness thresholds for replace-mode document writes.
    pub merge_guard: MergeGuard,
    /// Time-to-live for memoized repair outcomes, in seconds.
    pub repair_cache_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trim_budget: DEFAULT_MAX_CHARS,
            merge_guard: MergeGuard::default(),
            repair_cache_ttl_secs: 600,
        }
    }
}

impl PipelineConfig {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("scriv"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load from disk, or return defaults.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &PathBuf) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<PipelineConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "config file corrupted; backing up and using defaults");
                preserve_corrupt_config(path, &content);
                Self::default()
            }
        }
    }

    /// Save to disk. Best-effort; failure leaves the previous file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| anyhow::anyhow!("no config directory available"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn preserve_corrupt_config(path: &PathBuf, content: &str) {
    let backup = path.with_extension("json.corrupt");
    if let Err(err) = fs::write(&backup, content) {
        warn!(%err, "failed to back up corrupt config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_named_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.trim_budget, 120_000);
        assert_eq!(config.merge_guard.guarded_min_chars, 500);
        assert_eq!(config.merge_guard.recent_clash_secs, 30);
        assert_eq!(config.merge_guard.length_loss_secs, 180);
        assert_eq!(config.repair_cache_ttl_secs, 600);
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = PipelineConfig::default();
        config.trim_budget = 50_000;
        config.save_to(&path).unwrap();

        let loaded = PipelineConfig::load_from(&path);
        assert_eq!(loaded.trim_budget, 50_000);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"trim_budget": 9000}"#).unwrap();

        let loaded = PipelineConfig::load_from(&path);
        assert_eq!(loaded.trim_budget, 9_000);
        assert_eq!(loaded.repair_cache_ttl_secs, 600);
    }

    #[test]
    fn corrupt_file_backed_up_and_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json at all").unwrap();

        let loaded = PipelineConfig::load_from(&path);
        assert_eq!(loaded.trim_budget, 120_000);
        assert!(dir.path().join("config.json.corrupt").exists());
    }
}
