//! TOML Configuration for u2ctl
//!
//! Engine settings plus the receive and transmit path settings applied at
//! startup. Every table is optional.

use anyhow::{Context, Result};
use engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct U2ctlConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Receive path settings
    #[serde(default)]
    pub rx: RxSettings,
    /// Transmit path settings
    #[serde(default)]
    pub tx: TxSettings,
    /// Statistics reporting
    #[serde(default)]
    pub stats: StatsSettings,
}

/// Receive path configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RxSettings {
    /// Channel to stream
    #[serde(default)]
    pub channel: u8,
    /// Samples per frame, 0 selects the maximum
    #[serde(default = "default_items_per_frame")]
    pub items_per_frame: usize,
    /// Center frequency in Hz
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<f64>,
    /// Gain in dB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    /// Decimation factor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decim: Option<u32>,
}

fn default_items_per_frame() -> usize {
    0
}

impl Default for RxSettings {
    fn default() -> Self {
        Self {
            channel: 0,
            items_per_frame: default_items_per_frame(),
            freq: None,
            gain: None,
            decim: None,
        }
    }
}

/// Transmit path configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TxSettings {
    /// Center frequency in Hz
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<f64>,
    /// Gain in dB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    /// Interpolation factor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interp: Option<u32>,
}

/// Statistics reporting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsSettings {
    /// Reporting period in seconds
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

fn default_stats_interval() -> u64 {
    5
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval(),
        }
    }
}

impl U2ctlConfig {
    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::OverflowPolicy;

    #[test]
    fn test_parse_full_config() {
        let config: U2ctlConfig = toml::from_str(
            r#"
            [engine]
            device_mac = "00:50:c2:85:30:01"
            command_timeout_ms = 250
            overflow_policy = "drop_oldest"

            [engine.tune]
            lo_step = 100e6

            [rx]
            channel = 3
            items_per_frame = 250
            freq = 2.44e9
            gain = 20.0

            [tx]
            interp = 8

            [stats]
            interval_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.command_timeout_ms, 250);
        assert_eq!(config.engine.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.engine.tune.lo_step, 100e6);
        assert_eq!(config.rx.channel, 3);
        assert_eq!(config.rx.freq, Some(2.44e9));
        assert_eq!(config.rx.decim, None);
        assert_eq!(config.tx.interp, Some(8));
        assert_eq!(config.stats.interval_secs, 1);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: U2ctlConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.rx.items_per_frame, 0);
        assert_eq!(config.stats.interval_secs, 5);
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = U2ctlConfig::load(Path::new("/nonexistent/u2ctl.toml")).unwrap();
        assert_eq!(config.engine, EngineConfig::default());
    }
}
