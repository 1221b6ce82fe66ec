//! Runtime configuration.
//!
//! Configuration is plain data: it can be built in code, deserialized from
//! JSON, and must pass [`RuntimeConfig::validate`] before a runtime uses it.
//! Missing fields take their defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Accelerator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name used in diagnostics and thread names.
    pub name: String,
    /// Device memory capacity in bytes.
    pub capacity_bytes: usize,
    /// First address handed out by the device allocator.
    pub heap_base: u64,
    /// Allocation alignment in bytes. Must be a power of two.
    pub alignment: usize,
    /// Maximum number of queued launches on the device stream.
    pub stream_queue_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "sim0".to_string(),
            capacity_bytes: 64 * 1024 * 1024,
            heap_base: 0x7f00_0000_0000,
            alignment: 16,
            stream_queue_capacity: 64,
        }
    }
}

impl DeviceConfig {
    /// Validate device settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid("device.name must not be empty"));
        }
        if self.capacity_bytes == 0 {
            return Err(invalid("device.capacity_bytes must be > 0"));
        }
        if !self.alignment.is_power_of_two() {
            return Err(invalid("device.alignment must be a power of two"));
        }
        if self.heap_base == 0 {
            return Err(invalid("device.heap_base must be non-zero"));
        }
        if self.heap_base % self.alignment as u64 != 0 {
            return Err(invalid("device.heap_base must be a multiple of device.alignment"));
        }
        if self.stream_queue_capacity == 0 {
            return Err(invalid("device.stream_queue_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Simulation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of steps in every per-step trace, including the initial value.
    pub simulation_length: usize,
    /// Integration step size.
    pub dt: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            simulation_length: 50,
            dt: 0.001,
        }
    }
}

impl SimulationConfig {
    /// Validate simulation settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation_length < 2 {
            return Err(invalid("simulation.simulation_length must be >= 2"));
        }
        if !self.dt.is_finite() || self.dt < 0.0 {
            return Err(invalid("simulation.dt must be finite and >= 0"));
        }
        Ok(())
    }

    /// Simulated time at `step`.
    #[must_use]
    pub fn time_at(&self, step: usize) -> f64 {
        step as f64 * self.dt
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Accelerator settings.
    pub device: DeviceConfig,
    /// Simulation settings.
    pub simulation: SimulationConfig,
}

impl RuntimeConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Io {
            message: format!("{}: {err}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.simulation.validate()
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_string(),
    }
}
