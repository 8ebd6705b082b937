//! Orchestrator configuration.
//!
//! Stored as camelCase JSON. Every field has a default, so an empty object,
//! a partial file or no file at all yields a working configuration.

use crate::agent::DEFAULT_MAX_CONCURRENT_TASKS;
use crate::approval::ApprovalConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecutionOptions, RetryPolicy, ValidationLimits};
use crate::rate_limit::{RateLimitConfig, TransactionLimits};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the config file when none is passed explicitly.
pub const CONFIG_ENV_VAR: &str = "CHAIN_ORCHESTRATOR_CONFIG";

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_max_concurrent_tasks() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}

fn default_true() -> bool {
    true
}

fn default_confirmations() -> u64 {
    1
}

fn default_confirmation_timeout_ms() -> u64 {
    60_000
}

/// Scheduling loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Delay between scheduling passes
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Concurrency cap for agents registered without one
    #[serde(default = "default_max_concurrent_tasks")]
    pub default_max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            default_max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Transaction execution defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    /// Shape limits applied before signing
    #[serde(default)]
    pub validation: ValidationLimits,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confirmations: default_confirmations(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            validation: ValidationLimits::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn options(&self) -> ExecutionOptions {
        ExecutionOptions {
            retry: self.retry,
            confirmations: self.confirmations,
            confirmation_timeout_ms: self.confirmation_timeout_ms,
        }
    }
}

/// Transaction rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub transactions: TransactionLimits,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transactions: TransactionLimits::default(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,
}

impl OrchestratorConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: OrchestratorConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(Error::invalid_config("scheduler.tickIntervalMs must be positive"));
        }
        if self.scheduler.default_max_concurrent_tasks == 0 {
            return Err(Error::invalid_config(
                "scheduler.defaultMaxConcurrentTasks must be positive",
            ));
        }

        let execution = &self.execution;
        if execution.confirmations == 0 {
            return Err(Error::invalid_config("execution.confirmations must be positive"));
        }
        if execution.confirmation_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "execution.confirmationTimeoutMs must be positive",
            ));
        }
        if execution.retry.initial_backoff_ms > execution.retry.max_backoff_ms {
            return Err(Error::invalid_config(format!(
                "execution.retry.initialBackoffMs ({}) exceeds maxBackoffMs ({})",
                execution.retry.initial_backoff_ms, execution.retry.max_backoff_ms
            )));
        }
        if execution.validation.max_gas_limit == 0 {
            return Err(Error::invalid_config(
                "execution.validation.maxGasLimit must be positive",
            ));
        }

        let limits = &self.rate_limits.transactions;
        let windows = [
            ("perAgent", limits.per_agent),
            ("perNetwork", limits.per_network),
            ("perDestination", limits.per_destination),
        ];
        for (name, window) in windows {
            if let Some(RateLimitConfig { window_ms: 0, .. }) = window {
                return Err(Error::invalid_config(format!(
                    "rateLimits.{name}.windowMs must be positive"
                )));
            }
        }

        if self.approval.ttl_ms == 0 {
            return Err(Error::invalid_config("approval.ttlMs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.approval.ttl_ms, 300_000);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orchestrator.json");
        std::fs::write(
            &path,
            r#"{
                "scheduler": { "tickIntervalMs": 250 },
                "execution": { "retry": { "maxRetries": 5 } },
                "rateLimits": { "enabled": false, "hourlyPerAddress": 7 }
            }"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 250);
        assert_eq!(config.scheduler.default_max_concurrent_tasks, 3);
        assert_eq!(config.execution.retry.max_retries, 5);
        assert_eq!(config.execution.retry.initial_backoff_ms, 1_000);
        assert_eq!(config.execution.confirmation_timeout_ms, 60_000);
        assert!(!config.rate_limits.enabled);
        assert_eq!(config.rate_limits.transactions.hourly_per_address, 7);
        assert_eq!(config.rate_limits.transactions.daily_per_address, 1_000);
    }

    #[test]
    fn save_then_load_preserves_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = OrchestratorConfig::default();
        config.execution.confirmations = 3;
        config.save(&path).unwrap();
        assert_eq!(OrchestratorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut config = OrchestratorConfig::default();
        config.execution.retry.initial_backoff_ms = 20_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("initialBackoffMs"));

        let mut config = OrchestratorConfig::default();
        config.rate_limits.transactions.per_network = Some(RateLimitConfig::new(5, 0));
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.scheduler.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(OrchestratorConfig::load(&path), Err(Error::Json(_))));
    }
}
