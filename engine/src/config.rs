//! Engine Configuration
//!
//! Runtime knobs for the engine. Every field has a default so a partial
//! TOML table deserializes cleanly.

use crate::ring::{OverflowPolicy, MAX_RING_FRAMES};
use crate::EngineError;
use common::{MacAddress, TuneParams};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Device hardware address; broadcast reaches a single device on the link
    #[serde(default = "default_device_mac")]
    pub device_mac: MacAddress,
    /// Command reply timeout in milliseconds, 0 waits indefinitely
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// How long teardown waits for in-flight commands to unwind
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Receive thread poll interval; also the longest a stop request waits
    /// for the receive thread to notice it
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Memory budget per streaming channel
    #[serde(default = "default_ring_budget_bytes")]
    pub ring_budget_bytes: usize,
    /// Fixed ring capacity in frames, overrides the byte budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring_frames: Option<usize>,
    /// Frame discarded when a ring is full
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Tuning parameters of the attached front end
    #[serde(default)]
    pub tune: TuneParams,
}

/// Upper bound on the receive poll interval, which bounds shutdown latency
pub const MAX_POLL_INTERVAL_MS: u64 = 1000;

fn default_device_mac() -> MacAddress {
    MacAddress::BROADCAST
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_ring_budget_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_mac: default_device_mac(),
            command_timeout_ms: default_command_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            ring_budget_bytes: default_ring_budget_bytes(),
            ring_frames: None,
            overflow_policy: OverflowPolicy::default(),
            tune: TuneParams::default(),
        }
    }
}

impl EngineConfig {
    /// Reply timeout, `None` meaning wait forever
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(frames) = self.ring_frames {
            if frames == 0 || frames > MAX_RING_FRAMES {
                return Err(EngineError::InvalidArgument(format!(
                    "ring_frames must be within 1..={}",
                    MAX_RING_FRAMES
                )));
            }
        }
        if self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(EngineError::InvalidArgument(format!(
                "poll_interval_ms must not exceed {}",
                MAX_POLL_INTERVAL_MS
            )));
        }
        if self.ring_budget_bytes == 0 && self.ring_frames.is_none() {
            return Err(EngineError::InvalidArgument(
                "ring_budget_bytes must be positive".to_string(),
            ));
        }
        self.tune.validate()?;
        Ok(())
    }
}
