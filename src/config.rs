use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::dispatch::RetryPolicy;
use crate::error::{Result, WorkflowError};
use crate::session::FeasibilityStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub store: StoreConfig,
    pub gate: GateConfig,
    pub dispatch: DispatchConfig,
    pub delivery: DeliveryConfig,
    /// TOML role table to load. None falls back to the builtin roles.
    pub roles_path: Option<PathBuf>,
}

impl PilotConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| WorkflowError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.gate.min_keywords == 0 {
            errors.push("gate.min_keywords must be greater than 0");
        }
        if self.gate.min_scope_elements == 0 {
            errors.push("gate.min_scope_elements must be greater than 0");
        }

        if self.dispatch.default_workers == 0 {
            errors.push("dispatch.default_workers must be greater than 0");
        }
        if self.dispatch.stream_workers == 0 {
            errors.push("dispatch.stream_workers must be greater than 0");
        }
        if self.dispatch.queue_depth == 0 {
            errors.push("dispatch.queue_depth must be greater than 0");
        }
        if self.dispatch.result_cache_ttl_secs == 0 {
            errors.push("dispatch.result_cache_ttl_secs must be greater than 0");
        }
        if self.dispatch.retry.max_attempts == 0 {
            errors.push("dispatch.retry.max_attempts must be greater than 0");
        }
        if self.dispatch.retry.max_delay_ms < self.dispatch.retry.base_delay_ms {
            errors.push("dispatch.retry.max_delay_ms must be >= base_delay_ms");
        }

        if self.delivery.stream_buffer == 0 {
            errors.push("delivery.stream_buffer must be greater than 0");
        }
        if self.delivery.state_buffer == 0 {
            errors.push("delivery.state_buffer must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::Config(format!(
                "Invalid configuration:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file for snapshot persistence. None keeps sessions in memory
    /// only, which is what tests and the demo use.
    pub snapshot_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub min_keywords: usize,
    pub min_scope_elements: usize,
    pub min_feasibility: FeasibilityStatus,
    /// User reflections required to enter Collection.
    pub collection_reflections: usize,
    /// User reflections required to enter Presentation.
    pub presentation_reflections: usize,
    pub allow_rollback: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_keywords: 3,
            min_scope_elements: 2,
            min_feasibility: FeasibilityStatus::Medium,
            collection_reflections: 1,
            presentation_reflections: 2,
            allow_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_workers: usize,
    pub stream_workers: usize,
    /// Pending tasks a lane will hold beyond the ones being executed.
    pub queue_depth: usize,
    /// How long a completed idempotency key keeps answering duplicates.
    pub result_cache_ttl_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_workers: 4,
            stream_workers: 2,
            queue_depth: 64,
            result_cache_ttl_secs: 600,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-subscriber stream channel capacity; overflow drops oldest.
    pub stream_buffer: usize,
    /// Per-subscriber state channel capacity; overflow forces a resync.
    pub state_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            stream_buffer: 256,
            state_buffer: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PilotConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = PilotConfig::default();
        config.dispatch.default_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_workers"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = PilotConfig::default();
        config.gate.min_keywords = 0;
        config.delivery.state_buffer = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("min_keywords"));
        assert!(err.contains("state_buffer"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: PilotConfig = toml::from_str(
            r#"
            [gate]
            min_keywords = 5
            allow_rollback = false
            "#,
        )
        .unwrap();
        assert_eq!(config.gate.min_keywords, 5);
        assert!(!config.gate.allow_rollback);
        assert_eq!(config.gate.min_scope_elements, 2);
        assert_eq!(config.dispatch.default_workers, 4);
    }

    #[test]
    fn test_retry_bounds_checked() {
        let mut config = PilotConfig::default();
        config.dispatch.retry.base_delay_ms = 60_000;
        config.dispatch.retry.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }
}
