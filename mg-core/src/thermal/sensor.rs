//! Temperature sources
//!
//! Linux thermal zones report millidegrees Celsius as plain text
//! (e.g. `45000` = 45.0°C). [`SysfsTemperature`] handles the conversion.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::constants::temperature;
use crate::error::{MetalGuardError, Result};

/// A single temperature reading in degrees Celsius
pub trait TemperatureSource: Send + Sync {
    fn read_celsius(&self) -> Result<f32>;
}

/// File-backed sensor (`/sys/class/thermal/thermal_zoneN/temp` and friends)
#[derive(Debug, Clone)]
pub struct SysfsTemperature {
    path: PathBuf,
}

impl SysfsTemperature {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TemperatureSource for SysfsTemperature {
    fn read_celsius(&self) -> Result<f32> {
        let content = fs::read_to_string(&self.path).map_err(|e| MetalGuardError::SensorRead {
            path: self.path.clone(),
            reason: format!("Failed to read: {}", e),
        })?;

        let millidegrees = content.trim().parse::<f32>().map_err(|e| MetalGuardError::SensorRead {
            path: self.path.clone(),
            reason: format!("Failed to parse '{}': {}", content.trim(), e),
        })?;

        Ok(millidegrees / temperature::MILLIDEGREE_DIVISOR)
    }
}

/// Settable in-memory sensor for simulation
#[derive(Debug, Default)]
pub struct MemoryTemperature {
    celsius: Mutex<f32>,
}

impl MemoryTemperature {
    pub fn new(celsius: f32) -> Self {
        Self {
            celsius: Mutex::new(celsius),
        }
    }

    pub fn set(&self, celsius: f32) {
        *self.celsius.lock() = celsius;
    }
}

impl TemperatureSource for MemoryTemperature {
    fn read_celsius(&self) -> Result<f32> {
        Ok(*self.celsius.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_millidegrees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        fs::write(&path, "45500\n").unwrap();
        let sensor = SysfsTemperature::new(&path);
        assert!((sensor.read_celsius().unwrap() - 45.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_missing_and_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = SysfsTemperature::new(dir.path().join("nope"));
        assert!(missing.read_celsius().unwrap_err().is_hardware());

        let path = dir.path().join("temp");
        fs::write(&path, "hot").unwrap();
        let err = SysfsTemperature::new(&path).read_celsius().unwrap_err();
        assert!(matches!(err, MetalGuardError::SensorRead { .. }));
    }
}
