//! Thermal monitoring and fan/throttle control

pub mod controller;
pub mod curve;
pub mod sensor;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use controller::{ThermalCallback, ThermalConfig, ThermalController};
pub use curve::{DutyCurve, Thresholds};
pub use sensor::{MemoryTemperature, SysfsTemperature, TemperatureSource};

/// Monitored temperature zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Cpu,
    Gpu,
    Ambient,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Cpu => write!(f, "CPU"),
            Zone::Gpu => write!(f, "GPU"),
            Zone::Ambient => write!(f, "Ambient"),
        }
    }
}

/// Severity of a zone reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalLevel {
    #[default]
    Cool,
    Warning,
    Critical,
}

impl ThermalLevel {
    pub fn classify(temp: f32, thresholds: &Thresholds) -> Self {
        if temp >= thresholds.critical {
            ThermalLevel::Critical
        } else if temp >= thresholds.warning {
            ThermalLevel::Warning
        } else {
            ThermalLevel::Cool
        }
    }
}

/// Snapshot produced by one sampling tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThermalState {
    pub cpu_temp: f32,
    pub gpu_temp: f32,
    pub ambient_temp: f32,
    /// Fan duty in percent
    pub fan_duty: u8,
    pub throttled: bool,
    /// Active warnings, e.g. "CPU temperature critical"
    pub warnings: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let t = Thresholds::new(70.0, 80.0);
        assert_eq!(ThermalLevel::classify(69.9, &t), ThermalLevel::Cool);
        assert_eq!(ThermalLevel::classify(70.0, &t), ThermalLevel::Warning);
        assert_eq!(ThermalLevel::classify(80.0, &t), ThermalLevel::Critical);
        assert!(ThermalLevel::Critical > ThermalLevel::Warning);
    }
}
