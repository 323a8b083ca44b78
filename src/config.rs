//! Configuration loaded from a JSON file. Every field has a default, so a
//! file only needs the values it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::events::Address;
use crate::persistence::DEFAULT_JOURNAL_PATH;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Total attempts per operation. `None` retries transient failures
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped
    /// at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Whether another attempt may run after `failed` attempts failed.
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed < max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Width of one backfill block range.
    pub batch_size: u64,
    /// Checkpoint assumed for a store that has never committed.
    pub genesis_height: u64,
    pub retry: RetryPolicy,
    /// Capacity of the live block channel.
    pub live_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            genesis_height: 0,
            retry: RetryPolicy::default(),
            live_buffer: 64,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batchSize must be greater than 0".into()));
        }
        if self.live_buffer == 0 {
            return Err(ConfigError::Invalid("liveBuffer must be greater than 0".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initialBackoffMs exceeds retry.maxBackoffMs".into(),
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid("retry.maxAttempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Deployed contract addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContractsConfig {
    pub ipft_redeemable: Address,
    pub open_store: Address,
    /// Persona stores are not synced when absent.
    pub persona: Option<Address>,
    /// Restricts app-scoped events to this app.
    pub app: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub rpc_url: String,
    pub journal_path: String,
    pub poll_interval_ms: u64,
    pub contracts: ContractsConfig,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            journal_path: DEFAULT_JOURNAL_PATH.to_string(),
            poll_interval_ms: 2_000,
            contracts: ContractsConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_url.is_empty() {
            return Err(ConfigError::Invalid("rpcUrl is empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("pollIntervalMs must be greater than 0".into()));
        }
        self.sync.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
