//! Engine configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{ChannelMask, MAX_DATASET_LEN};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How a persisted delay timer is interpreted after a restart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DelayBootPolicy {
    /// Time spent powered off does not consume the delay.
    #[default]
    Resume,
    /// Wall-clock time since the last write is subtracted from the delay.
    ElapseWallClock,
}

/// Outbound management request settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MgmtConfig {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl MgmtConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetConfig {
    /// Floor applied to the delay of a Pending dataset that changes the
    /// network key.
    #[serde(default = "default_min_key_change_delay_ms")]
    pub min_key_change_delay_ms: u64,
    #[serde(default = "default_max_pending_delay_ms")]
    pub max_delay_ms: u64,
    /// Channels this radio can use (page 0 bitmap).
    #[serde(default = "default_supported_channel_mask")]
    pub supported_channel_mask: u32,
    #[serde(default = "default_max_dataset_len")]
    pub max_dataset_len: usize,
    #[serde(default)]
    pub delay_boot_policy: DelayBootPolicy,
    #[serde(default = "default_delay_checkpoint_interval_ms")]
    pub delay_checkpoint_interval_ms: u64,
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    #[serde(default)]
    pub mgmt: MgmtConfig,
}

fn default_min_key_change_delay_ms() -> u64 {
    300_000
}

fn default_max_pending_delay_ms() -> u64 {
    72 * 60 * 60 * 1000
}

fn default_supported_channel_mask() -> u32 {
    ChannelMask::DEFAULT_2_4_GHZ.0
}

fn default_max_dataset_len() -> usize {
    MAX_DATASET_LEN
}

fn default_delay_checkpoint_interval_ms() -> u64 {
    60_000
}

fn default_advertise_interval_ms() -> u64 {
    32_000
}

fn default_response_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            min_key_change_delay_ms: default_min_key_change_delay_ms(),
            max_delay_ms: default_max_pending_delay_ms(),
            supported_channel_mask: default_supported_channel_mask(),
            max_dataset_len: default_max_dataset_len(),
            delay_boot_policy: DelayBootPolicy::default(),
            delay_checkpoint_interval_ms: default_delay_checkpoint_interval_ms(),
            advertise_interval_ms: default_advertise_interval_ms(),
            mgmt: MgmtConfig::default(),
        }
    }
}

impl DatasetConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.supported_channel_mask == 0 {
            return Err("supported_channel_mask must enable at least one channel".to_string());
        }
        if self.max_dataset_len == 0 || self.max_dataset_len > MAX_DATASET_LEN {
            return Err(format!(
                "max_dataset_len must be within 1..={}",
                MAX_DATASET_LEN
            ));
        }
        if self.max_delay_ms > u64::from(u32::MAX) {
            return Err("max_delay_ms must fit the 32-bit delay timer".to_string());
        }
        if self.min_key_change_delay_ms > self.max_delay_ms {
            return Err("min_key_change_delay_ms exceeds max_delay_ms".to_string());
        }
        if self.delay_checkpoint_interval_ms == 0 {
            return Err("delay_checkpoint_interval_ms must be positive".to_string());
        }
        if self.advertise_interval_ms == 0 {
            return Err("advertise_interval_ms must be positive".to_string());
        }
        if self.mgmt.response_timeout_ms == 0 {
            return Err("mgmt.response_timeout_ms must be positive".to_string());
        }
        if self.mgmt.max_retries == 0 {
            return Err("mgmt.max_retries must be at least 1".to_string());
        }
        if self.mgmt.base_delay_ms > self.mgmt.max_delay_ms {
            return Err("mgmt.base_delay_ms exceeds mgmt.max_delay_ms".to_string());
        }
        Ok(())
    }

    pub fn supported_channels(&self) -> ChannelMask {
        ChannelMask(self.supported_channel_mask)
    }

    pub fn min_key_change_delay(&self) -> Duration {
        Duration::from_millis(self.min_key_change_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn delay_checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.delay_checkpoint_interval_ms)
    }

    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DatasetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_key_change_delay(), Duration::from_secs(300));
        assert_eq!(config.delay_boot_policy, DelayBootPolicy::Resume);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = DatasetConfig::from_yaml_str(
            "min_key_change_delay_ms: 600000\ndelay_boot_policy: elapse_wall_clock\nmgmt:\n  max_retries: 5\n",
        )
        .unwrap();
        assert_eq!(config.min_key_change_delay_ms, 600_000);
        assert_eq!(config.delay_boot_policy, DelayBootPolicy::ElapseWallClock);
        assert_eq!(config.mgmt.max_retries, 5);
        assert_eq!(config.mgmt.response_timeout_ms, 5_000);
        assert_eq!(config.max_dataset_len, MAX_DATASET_LEN);
    }

    #[test]
    fn test_json_config() {
        let config = DatasetConfig::from_json_str(r#"{"supported_channel_mask": 2048}"#).unwrap();
        assert!(config.supported_channels().contains(11));
        assert!(!config.supported_channels().contains(12));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = DatasetConfig {
            supported_channel_mask: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.supported_channel_mask = 1 << 11;
        config.min_key_change_delay_ms = config.max_delay_ms + 1;
        assert!(config.validate().is_err());

        assert!(matches!(
            DatasetConfig::from_yaml_str("mgmt:\n  max_retries: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(&path, r#"{"advertise_interval_ms": 1000}"#).unwrap();
        let config = DatasetConfig::from_file(&path).unwrap();
        assert_eq!(config.advertise_interval(), Duration::from_secs(1));
    }
}
