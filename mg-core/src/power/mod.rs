//! Power management and power quality monitoring
//!
//! - [`manager`]: source availability pins and ADC readings → [`PowerState`]
//! - [`stability`]: ripple/sag/spike/cycle analytics over a sample window
//! - [`load`]: supply load test driving load-bank pins
//! - [`ring`]: fixed-capacity sample buffer

pub mod load;
pub mod manager;
pub mod ring;
pub mod stability;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use load::{LoadTestConfig, LoadTestProgress, LoadTestReport};
pub use manager::{AdcSource, MemoryAdc, PowerConfig, PowerManager, SysfsAdc};
pub use ring::RingBuffer;
pub use stability::{PowerStabilityMonitor, StabilityConfig};

/// Power supply type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerSource {
    Main,
    Battery,
    Solar,
}

impl PowerSource {
    /// Preference order when several sources are available
    pub const PRIORITY: [PowerSource; 3] = [PowerSource::Main, PowerSource::Solar, PowerSource::Battery];
}

impl fmt::Display for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerSource::Main => write!(f, "MAIN"),
            PowerSource::Battery => write!(f, "BATTERY"),
            PowerSource::Solar => write!(f, "SOLAR"),
        }
    }
}

/// Snapshot of the power subsystem
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    /// Battery level in percent
    pub battery_level: f64,
    pub charging: bool,
    /// Supply voltage in volts
    pub voltage: f64,
    /// Source currently supplying power; the last one seen while none is available
    pub current_source: Option<PowerSource>,
    pub available: BTreeMap<PowerSource, bool>,
    /// Watts
    pub power_consumption: f64,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability: Option<StabilityMetrics>,
}

impl PowerState {
    pub fn any_available(&self) -> bool {
        self.available.values().any(|&up| up)
    }

    /// Current draw in amps derived from consumption and voltage
    pub fn current(&self) -> f64 {
        if self.voltage.abs() < f64::EPSILON {
            0.0
        } else {
            self.power_consumption / self.voltage
        }
    }
}

/// Power quality figures over the current sample window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilityMetrics {
    /// Peak-to-peak voltage variation
    pub voltage_ripple: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub average_voltage: f64,
    pub power_cycles: u32,
    pub last_cycle_duration: Duration,
    pub current_spikes: u32,
    pub max_current_spike: f64,
    pub warnings: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StabilityEventKind {
    VoltageRipple,
    VoltageSag,
    CurrentSpike,
    PowerCycle,
    SourceFailover,
}

/// A power quality incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: StabilityEventKind,
    pub reading: f64,
    pub threshold: f64,
    pub source: Option<PowerSource>,
    pub details: String,
}

/// Anything that can report the latest power snapshot
pub trait PowerStateSource: Send + Sync {
    fn power_state(&self) -> PowerState;

    /// Attach freshly computed stability metrics to the snapshot
    fn record_stability(&self, _metrics: StabilityMetrics) {}
}
