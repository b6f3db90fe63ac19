use crate::errors::{SyncError, SyncResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    pub autosave_delay_ms: u64,
    pub paced_debounce_ms: u64,
    pub slow_commit_warn_ms: u64,
    pub log_filter: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            autosave_delay_ms: 2000,
            paced_debounce_ms: 1000,
            slow_commit_warn_ms: 5000,
            log_filter: "info".to_string(),
        }
    }
}

impl SyncSettings {
    pub fn from_yaml_str(raw: &str) -> SyncResult<Self> {
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()
    }

    pub fn from_json_str(raw: &str) -> SyncResult<Self> {
        let settings: Self = serde_json::from_str(raw)
            .map_err(|error| SyncError::Config(error.to_string()))?;
        settings.validate()
    }

    /// Reads `.json` files as JSON and everything else as YAML.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sync settings from {}", path.display()))
            .map_err(|error| SyncError::Config(format!("{error:#}")))?;
        let is_json = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    /// Applies a partial update such as `{"pacedDebounceMs": 500}`.
    pub fn merge_patch(&self, update: serde_json::Value) -> SyncResult<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, update);
        let settings: Self = serde_json::from_value(merged)
            .map_err(|error| SyncError::Config(error.to_string()))?;
        settings.validate()
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn paced_debounce(&self) -> Duration {
        Duration::from_millis(self.paced_debounce_ms)
    }

    pub fn slow_commit_warn(&self) -> Duration {
        Duration::from_millis(self.slow_commit_warn_ms)
    }

    fn validate(self) -> SyncResult<Self> {
        if self.slow_commit_warn_ms == 0 {
            return Err(SyncError::Config(
                "slowCommitWarnMs must be greater than zero".to_string(),
            ));
        }
        if self.log_filter.trim().is_empty() {
            return Err(SyncError::Config("logFilter must not be empty".to_string()));
        }
        Ok(self)
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
