//! Kit configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Timing knobs of the kit. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmkConfig {
    /// Delay between two discovery scans.
    pub discovery_poll_interval_ms: u64,
    /// Default length of a time-boxed discovery observation.
    pub observation_window_ms: u64,
    /// Delay between two device state refreshes.
    pub state_poll_interval_ms: u64,
    /// Upper bound of one command round trip.
    pub command_timeout_ms: u64,
}

impl Default for DmkConfig {
    fn default() -> Self {
        Self {
            discovery_poll_interval_ms: 250,
            observation_window_ms: 500,
            state_poll_interval_ms: 1000,
            command_timeout_ms: 10_000,
        }
    }
}

impl DmkConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DmkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn discovery_poll_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_poll_interval_ms)
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_millis(self.observation_window_ms)
    }

    pub fn state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.state_poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
