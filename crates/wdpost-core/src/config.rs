//! Provider configuration, loaded from TOML.
//!
//! 全フィールドにデフォルトがあるので、空ファイルでも起動できる。
//! 各コンポーネントの設定型への変換もここで行う。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::{EngineConfig, RetryPolicy, SchedulerConfig};
use crate::domain::{Address, ChainEpoch, TokenAmount};
use crate::message::SenderConfig;
use crate::wdpost::{ComputeConfig, FaultTrackerConfig, SubmitConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub subsystems: SubsystemsConfig,
    pub fees: FeeConfig,
    pub proving: ProvingConfig,
    pub addresses: AddressConfig,
    pub chain: ChainConfig,
    pub engine: EngineSection,
    pub outbox: OutboxSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemsConfig {
    pub enable_window_post: bool,
    /// Compute tasks one process runs at once.
    pub window_post_max_tasks: usize,
}

impl Default for SubsystemsConfig {
    fn default() -> Self {
        Self {
            enable_window_post: true,
            window_post_max_tasks: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub max_window_post_gas_fee: TokenAmount,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            // 5 FIL in nanoFIL
            max_window_post_gas_fee: 5_000_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvingConfig {
    pub parallel_check_limit: usize,
    pub single_check_timeout_secs: u64,
    pub partition_check_timeout_secs: u64,
    pub health_ttl_secs: u64,
    pub max_sector_retries: u32,
    pub partitions_per_task: usize,
    /// How far ahead fault and recovery declarations look; 0 turns them off.
    pub declare_lookahead_epochs: ChainEpoch,
}

impl Default for ProvingConfig {
    fn default() -> Self {
        Self {
            parallel_check_limit: 32,
            single_check_timeout_secs: 5,
            partition_check_timeout_secs: 300,
            health_ttl_secs: 600,
            max_sector_retries: 5,
            partitions_per_task: 1,
            declare_lookahead_epochs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    pub provider_addresses: Vec<Address>,
    /// Candidate payers for proof submissions.
    pub sender_addresses: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub finality_lag: ChainEpoch,
    pub scheduler_lease_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            finality_lag: 2,
            scheduler_lease_secs: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub poll_interval_ms: u64,
    pub liveness_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            liveness_timeout_secs: 120,
            heartbeat_interval_secs: 20,
            max_retries: 5,
            retry_base_delay_ms: 2_000,
            retry_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSection {
    pub poll_interval_ms: u64,
    pub rebroadcast_interval_secs: u64,
    pub max_broadcast_retries: u32,
    pub hold_timeout_secs: u64,
    pub confirm_poll_interval_ms: u64,
}

impl Default for OutboxSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            rebroadcast_interval_secs: 60,
            max_broadcast_retries: 10,
            hold_timeout_secs: 600,
            confirm_poll_interval_ms: 2_000,
        }
    }
}

impl ProviderConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.engine.liveness_timeout_secs <= self.engine.heartbeat_interval_secs {
            return invalid("engine.liveness_timeout_secs must exceed engine.heartbeat_interval_secs");
        }
        if self.subsystems.window_post_max_tasks == 0 {
            return invalid("subsystems.window_post_max_tasks must be at least 1");
        }
        if self.proving.parallel_check_limit == 0 {
            return invalid("proving.parallel_check_limit must be at least 1");
        }
        if self.proving.partitions_per_task == 0 {
            return invalid("proving.partitions_per_task must be at least 1");
        }
        if self.proving.declare_lookahead_epochs < 0 {
            return invalid("proving.declare_lookahead_epochs must not be negative");
        }
        if self.chain.finality_lag < 0 {
            return invalid("chain.finality_lag must not be negative");
        }
        if self.engine.retry_multiplier < 1.0 {
            return invalid("engine.retry_multiplier must be at least 1.0");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let e = &self.engine;
        EngineConfig {
            poll_interval: Duration::from_millis(e.poll_interval_ms),
            liveness_timeout: Duration::from_secs(e.liveness_timeout_secs),
            heartbeat_interval: Duration::from_secs(e.heartbeat_interval_secs),
            max_retries: e.max_retries,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(e.retry_base_delay_ms),
                multiplier: e.retry_multiplier,
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            finality_lag: self.chain.finality_lag,
            lease_ttl: Duration::from_secs(self.chain.scheduler_lease_secs),
            ..SchedulerConfig::default()
        }
    }

    pub fn fault_tracker_config(&self) -> FaultTrackerConfig {
        let p = &self.proving;
        FaultTrackerConfig {
            parallel_check_limit: p.parallel_check_limit,
            single_check_timeout: Duration::from_secs(p.single_check_timeout_secs),
            partition_check_timeout: Duration::from_secs(p.partition_check_timeout_secs),
            health_ttl: Duration::from_secs(p.health_ttl_secs),
        }
    }

    pub fn compute_config(&self) -> ComputeConfig {
        ComputeConfig {
            max_sector_retries: self.proving.max_sector_retries,
            partitions_per_task: self.proving.partitions_per_task,
            declare_lookahead: self.proving.declare_lookahead_epochs,
        }
    }

    pub fn submit_config(&self) -> SubmitConfig {
        SubmitConfig {
            max_fee: self.fees.max_window_post_gas_fee,
            senders: self.addresses.sender_addresses.clone(),
            confirm_poll_interval: Duration::from_millis(self.outbox.confirm_poll_interval_ms),
            hold_timeout: Duration::from_secs(self.outbox.hold_timeout_secs),
        }
    }

    pub fn sender_config(&self) -> SenderConfig {
        let o = &self.outbox;
        SenderConfig {
            poll_interval: Duration::from_millis(o.poll_interval_ms),
            rebroadcast_interval: Duration::from_secs(o.rebroadcast_interval_secs),
            max_broadcast_retries: o.max_broadcast_retries,
            ..SenderConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ProviderConfig::from_toml_str("").unwrap();
        assert_eq!(config, ProviderConfig::default());
        assert_eq!(config.proving.parallel_check_limit, 32);
        assert_eq!(
            config.fault_tracker_config().partition_check_timeout,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn sections_override_defaults() {
        let config = ProviderConfig::from_toml_str(
            r#"
            [subsystems]
            window_post_max_tasks = 4

            [fees]
            max_window_post_gas_fee = 200

            [addresses]
            provider_addresses = ["f01000"]
            sender_addresses = ["f3aaa", "f3bbb"]

            [chain]
            finality_lag = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.subsystems.window_post_max_tasks, 4);
        assert!(config.subsystems.enable_window_post);
        assert_eq!(config.submit_config().max_fee, 200);
        assert_eq!(config.submit_config().senders.len(), 2);
        assert_eq!(config.scheduler_config().finality_lag, 5);
        assert_eq!(config.addresses.provider_addresses[0].as_str(), "f01000");
    }

    #[test]
    fn liveness_must_exceed_heartbeat() {
        let err = ProviderConfig::from_toml_str(
            r#"
            [engine]
            liveness_timeout_secs = 10
            heartbeat_interval_secs = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_types_are_parse_errors() {
        let err = ProviderConfig::from_toml_str("[proving]\nparallel_check_limit = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
