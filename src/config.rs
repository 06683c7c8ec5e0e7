//! Session configuration
//!
//! All the timings of a vehicle connection. The defaults suit a vehicle that disengages offboard mode after 500 ms
//! without setpoint. The configuration can be loaded from TOML, missing keys take their default value:
//!
//! ```toml
//! setpoint_period_ms = 20
//! ack_timeout_ms = 2000
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timings and thresholds of a vehicle connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Period of the setpoint stream (milliseconds)
    pub setpoint_period_ms: u64,
    /// Time after which the vehicle leaves offboard mode without setpoint (milliseconds)
    ///
    /// Only used to validate the setpoint period, the vehicle enforces its own value.
    pub remote_timeout_ms: u64,
    /// Consecutive setpoint send failures after which the session is degraded
    pub send_failure_threshold: u32,
    /// Time to wait for a command acknowledgement (milliseconds)
    pub ack_timeout_ms: u64,
    /// Time to wait for the offboard stop acknowledgement when shutting down (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            setpoint_period_ms: 50,
            remote_timeout_ms: 500,
            send_failure_threshold: 5,
            ack_timeout_ms: 1000,
            shutdown_timeout_ms: 200,
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document
    ///
    /// The result is validated with [SessionConfig::validate()].
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Serialize to a TOML document
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the consistency of the timings
    ///
    /// The setpoint period must be at most half of the remote timeout so that one lost setpoint does not
    /// disengage the vehicle.
    pub fn validate(&self) -> Result<()> {
        if self.setpoint_period_ms == 0 {
            return Err(Error::Config("setpoint_period_ms must not be 0".to_owned()));
        }
        if self.setpoint_period_ms.saturating_mul(2) > self.remote_timeout_ms {
            return Err(Error::Config(format!(
                "setpoint_period_ms ({}) must be at most half of remote_timeout_ms ({})",
                self.setpoint_period_ms, self.remote_timeout_ms
            )));
        }
        if self.send_failure_threshold == 0 {
            return Err(Error::Config("send_failure_threshold must be at least 1".to_owned()));
        }
        if self.ack_timeout_ms == 0 || self.shutdown_timeout_ms == 0 {
            return Err(Error::Config("timeouts must not be 0".to_owned()));
        }
        Ok(())
    }

    /// Period of the setpoint stream
    pub fn setpoint_period(&self) -> Duration {
        Duration::from_millis(self.setpoint_period_ms)
    }

    /// Remote offboard timeout
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Command acknowledgement timeout
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Shutdown handshake timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
