//! Setup description for one or many pumps.
//!
//! A setup names every pump, optionally groups them, and can carry a
//! `default` block merged into each pump entry. Pump keys win over defaults:
//!
//! ```json
//! {
//!   "default": { "volume": 5, "micro_step_mode": 2, "top_velocity": 24000 },
//!   "groups": { "solvents": ["water", "acetone"] },
//!   "pumps": {
//!     "water": { "port": "/dev/ttyUSB0" },
//!     "acetone": { "port": "/dev/ttyUSB1", "volume": 10 }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{MicrostepMode, ValvePosition};

pub const DEFAULT_BAUDRATE: u32 = 9600;
/// Seconds.
pub const DEFAULT_TIMEOUT: f64 = 0.1;
pub const DEFAULT_TOP_VELOCITY: u32 = 6000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read setup: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed setup: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Pump {0:?} is not part of the setup")]
    UnknownPump(String),
}

/// Fully merged settings of one pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSettings {
    /// Serial device path, or `host:port` for a network bridge.
    pub port: String,
    /// Syringe volume in ml.
    pub volume: f64,
    #[serde(default)]
    pub micro_step_mode: MicrostepMode,
    #[serde(default = "default_top_velocity")]
    pub top_velocity: u32,
    #[serde(default)]
    pub initialize_valve_position: ValvePosition,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_top_velocity() -> u32 {
    DEFAULT_TOP_VELOCITY
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT
}

impl PumpSettings {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }
}

/// The raw setup document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub default: Map<String, Value>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    pub pumps: BTreeMap<String, Map<String, Value>>,
}

impl SetupConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, ConfigError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Settings of `name` with the defaults merged in.
    pub fn pump_settings(&self, name: &str) -> Result<PumpSettings, ConfigError> {
        let specific = self
            .pumps
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPump(name.to_owned()))?;

        let mut merged = self.default.clone();
        for (key, value) in specific {
            merged.insert(key.clone(), value.clone());
        }
        Ok(serde_json::from_value(Value::Object(merged))?)
    }

    /// Merged settings of every pump, keyed by pump name.
    pub fn merged_pump_settings(&self) -> Result<BTreeMap<String, PumpSettings>, ConfigError> {
        self.pumps
            .keys()
            .map(|name| Ok((name.clone(), self.pump_settings(name)?)))
            .collect()
    }
}
