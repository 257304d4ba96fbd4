//! Power manager
//!
//! Samples power-source availability pins and the battery/voltage/current
//! ADCs, derives charging and critical conditions, and publishes a
//! [`PowerState`] snapshot for the stability monitor and diagnostics.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use super::{PowerSource, PowerState, PowerStateSource, StabilityMetrics};
use crate::constants::{power, timing};
use crate::error::{MetalGuardError, Result};
use crate::gpio::PinRegistry;

/// Raw ADC channel
pub trait AdcSource: Send + Sync {
    fn read_raw(&self) -> Result<f64>;
}

/// File-backed ADC; the raw value is used without scaling
#[derive(Debug, Clone)]
pub struct SysfsAdc {
    path: PathBuf,
}

impl SysfsAdc {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AdcSource for SysfsAdc {
    fn read_raw(&self) -> Result<f64> {
        let content = fs::read_to_string(&self.path).map_err(|e| MetalGuardError::SensorRead {
            path: self.path.clone(),
            reason: format!("Failed to read: {}", e),
        })?;
        content.trim().parse::<f64>().map_err(|e| MetalGuardError::SensorRead {
            path: self.path.clone(),
            reason: format!("Failed to parse '{}': {}", content.trim(), e),
        })
    }
}

/// Settable in-memory ADC for simulation
#[derive(Debug, Default)]
pub struct MemoryAdc {
    value: Mutex<f64>,
}

impl MemoryAdc {
    pub fn new(value: f64) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.lock() = value;
    }
}

impl AdcSource for MemoryAdc {
    fn read_raw(&self) -> Result<f64> {
        Ok(*self.value.lock())
    }
}

pub type PowerCallback = Arc<dyn Fn(&PowerState) + Send + Sync>;

/// Power manager configuration
#[derive(Clone)]
pub struct PowerConfig {
    pub interval: Duration,
    pub critical_voltage: f64,
    pub critical_battery_level: f64,
    /// Availability pin per source
    pub source_pins: BTreeMap<PowerSource, String>,
    battery: Option<Arc<dyn AdcSource>>,
    voltage: Option<Arc<dyn AdcSource>>,
    current: Option<Arc<dyn AdcSource>>,
    on_power_critical: Option<PowerCallback>,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            interval: timing::POWER_INTERVAL,
            critical_voltage: power::CRITICAL_VOLTAGE,
            critical_battery_level: power::CRITICAL_BATTERY_LEVEL,
            source_pins: BTreeMap::new(),
            battery: None,
            voltage: None,
            current: None,
            on_power_critical: None,
        }
    }
}

impl PowerConfig {
    pub fn with_source_pin(mut self, source: PowerSource, pin: impl Into<String>) -> Self {
        self.source_pins.insert(source, pin.into());
        self
    }

    pub fn with_battery_adc(mut self, adc: Arc<dyn AdcSource>) -> Self {
        self.battery = Some(adc);
        self
    }

    pub fn with_voltage_adc(mut self, adc: Arc<dyn AdcSource>) -> Self {
        self.voltage = Some(adc);
        self
    }

    pub fn with_current_adc(mut self, adc: Arc<dyn AdcSource>) -> Self {
        self.current = Some(adc);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_power_critical<F>(mut self, f: F) -> Self
    where
        F: Fn(&PowerState) + Send + Sync + 'static,
    {
        self.on_power_critical = Some(Arc::new(f));
        self
    }
}

#[derive(Default)]
struct Inner {
    state: PowerState,
    /// Set while a critical excursion is in progress
    critical: bool,
}

/// Power source and supply monitor
pub struct PowerManager {
    pub(crate) registry: Arc<PinRegistry>,
    config: PowerConfig,
    inner: Mutex<Inner>,
}

impl PowerManager {
    pub fn new(registry: Arc<PinRegistry>, config: PowerConfig) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(MetalGuardError::InvalidConfig {
                field: "power.interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        for pin in config.source_pins.values() {
            if !registry.contains(pin) {
                return Err(MetalGuardError::not_found("pin", pin.as_str()));
            }
        }

        let state = PowerState {
            available: config.source_pins.keys().map(|&s| (s, false)).collect(),
            ..PowerState::default()
        };
        Ok(Self {
            registry,
            config,
            inner: Mutex::new(Inner {
                state,
                critical: false,
            }),
        })
    }

    pub fn state(&self) -> PowerState {
        self.inner.lock().state.clone()
    }

    pub fn is_critical(&self) -> bool {
        self.inner.lock().critical
    }

    fn is_critical_state(&self, state: &PowerState) -> bool {
        if state.current_source == Some(PowerSource::Battery)
            && state.battery_level <= self.config.critical_battery_level
        {
            return true;
        }
        if self.config.voltage.is_some() && state.voltage <= self.config.critical_voltage {
            return true;
        }
        !self.config.source_pins.is_empty() && !state.any_available()
    }

    /// Sample pins and ADCs once
    ///
    /// Any read failure aborts the tick and leaves the previous snapshot in place.
    pub fn update(&self) -> Result<PowerState> {
        let mut available = BTreeMap::new();
        for (&source, pin) in &self.config.source_pins {
            available.insert(source, self.registry.is_high(pin)?);
        }
        let battery_level = self.config.battery.as_ref().map(|a| a.read_raw()).transpose()?;
        let voltage = self.config.voltage.as_ref().map(|a| a.read_raw()).transpose()?;
        let current = self.config.current.as_ref().map(|a| a.read_raw()).transpose()?;

        let (snapshot, callback) = {
            let mut inner = self.inner.lock();
            let previous = &inner.state;

            let current_source = PowerSource::PRIORITY
                .into_iter()
                .find(|s| available.get(s).copied().unwrap_or(false))
                .or(previous.current_source);

            let voltage = voltage.unwrap_or(previous.voltage);
            let mut next = PowerState {
                battery_level: battery_level.unwrap_or(previous.battery_level),
                voltage,
                power_consumption: current
                    .map(|amps| amps * voltage)
                    .unwrap_or(previous.power_consumption),
                current_source,
                charging: false,
                available,
                updated_at: Some(Utc::now()),
                stability: previous.stability.clone(),
            };
            next.charging = next.available.get(&PowerSource::Main).copied().unwrap_or(false)
                && next.battery_level < 100.0;

            let critical = self.is_critical_state(&next);
            let callback = if critical && !inner.critical {
                warn!(
                    source = ?next.current_source,
                    voltage = next.voltage,
                    battery = next.battery_level,
                    "Power critical"
                );
                self.config.on_power_critical.clone()
            } else {
                if !critical && inner.critical {
                    info!("Power recovered from critical state");
                }
                None
            };
            inner.critical = critical;

            trace!(voltage = next.voltage, watts = next.power_consumption, "Power tick");
            inner.state = next.clone();
            (next, callback)
        };

        if let Some(callback) = callback {
            callback(&snapshot);
        }
        Ok(snapshot)
    }

    /// Sample until cancelled; a failed tick ends the loop with its error
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(interval_ms = self.config.interval.as_millis() as u64, "Power manager started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.update() {
                        error!(error = %e, "Power update failed");
                        return Err(e);
                    }
                }
            }
        }
        info!("Power manager stopped");
        Ok(())
    }
}

impl PowerStateSource for PowerManager {
    fn power_state(&self) -> PowerState {
        self.state()
    }

    fn record_stability(&self, metrics: StabilityMetrics) {
        self.inner.lock().state.stability = Some(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{Level, MemoryPin, Pull};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Rig {
        main: Arc<MemoryPin>,
        battery_pin: Arc<MemoryPin>,
        battery: Arc<MemoryAdc>,
        voltage: Arc<MemoryAdc>,
        criticals: Arc<AtomicUsize>,
        manager: PowerManager,
    }

    fn rig() -> Rig {
        let registry = Arc::new(PinRegistry::new(true));
        let main = Arc::new(MemoryPin::new("main"));
        let battery_pin = Arc::new(MemoryPin::new("battery"));
        registry.configure("power_main", Some(main.clone()), Pull::Down).unwrap();
        registry
            .configure("power_battery", Some(battery_pin.clone()), Pull::Down)
            .unwrap();
        main.drive(Level::High);

        let battery = Arc::new(MemoryAdc::new(80.0));
        let voltage = Arc::new(MemoryAdc::new(5.0));
        let current = Arc::new(MemoryAdc::new(0.5));
        let criticals = Arc::new(AtomicUsize::new(0));
        let c = criticals.clone();

        let config = PowerConfig::default()
            .with_source_pin(PowerSource::Main, "power_main")
            .with_source_pin(PowerSource::Battery, "power_battery")
            .with_battery_adc(battery.clone())
            .with_voltage_adc(voltage.clone())
            .with_current_adc(current)
            .on_power_critical(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        let manager = PowerManager::new(registry, config).unwrap();
        Rig {
            main,
            battery_pin,
            battery,
            voltage,
            criticals,
            manager,
        }
    }

    #[test]
    fn test_state_from_readings() {
        let rig = rig();
        let state = rig.manager.update().unwrap();
        assert_eq!(state.current_source, Some(PowerSource::Main));
        assert!(state.charging);
        assert!((state.power_consumption - 2.5).abs() < 1e-9);
        assert!((state.current() - 0.5).abs() < 1e-9);
        assert!(!rig.manager.is_critical());
    }

    #[test]
    fn test_low_battery_is_critical_once() {
        let rig = rig();
        rig.main.drive(Level::Low);
        rig.battery_pin.drive(Level::High);
        rig.battery.set(8.0);

        let state = rig.manager.update().unwrap();
        assert_eq!(state.current_source, Some(PowerSource::Battery));
        assert!(!state.charging);
        rig.manager.update().unwrap();
        assert_eq!(rig.criticals.load(Ordering::SeqCst), 1);

        // recovery re-arms the callback
        rig.battery.set(50.0);
        rig.manager.update().unwrap();
        assert!(!rig.manager.is_critical());
        rig.voltage.set(4.4);
        rig.manager.update().unwrap();
        assert_eq!(rig.criticals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_source_is_critical_and_keeps_last_source() {
        let rig = rig();
        rig.manager.update().unwrap();
        rig.main.drive(Level::Low);
        let state = rig.manager.update().unwrap();
        assert!(!state.any_available());
        assert_eq!(state.current_source, Some(PowerSource::Main));
        assert!(rig.manager.is_critical());
    }

    #[test]
    fn test_unknown_pin_rejected() {
        let registry = Arc::new(PinRegistry::new(true));
        let err = PowerManager::new(
            registry,
            PowerConfig::default().with_source_pin(PowerSource::Solar, "missing"),
        )
        .err()
        .unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_adc_read_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PinRegistry::new(true));
        let manager = PowerManager::new(
            registry,
            PowerConfig::default().with_voltage_adc(Arc::new(SysfsAdc::new(dir.path().join("in_voltage")))),
        )
        .unwrap();
        assert!(manager.update().unwrap_err().is_hardware());

        fs::write(dir.path().join("in_voltage"), "5.1\n").unwrap();
        assert!((manager.update().unwrap().voltage - 5.1).abs() < 1e-9);
    }
}
