//! Device Settings
//!
//! One JSON document describes a device: its pin map, PWM channels, sensor
//! paths and every monitor's thresholds. Missing fields take the defaults
//! from [`crate::constants`].

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{diagnostics, fan, paths, power, pwm, temperature, timing};
use crate::diag::DiagnosticsConfig;
use crate::error::{MetalGuardError, Result};
use crate::gpio::Pull;
use crate::power::{PowerConfig, PowerSource, StabilityConfig, SysfsAdc};
use crate::secure::TamperConfig;
use crate::thermal::{DutyCurve, SysfsTemperature, ThermalConfig, Thresholds};

/// Input/output pin backed by a sysfs GPIO line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinSettings {
    pub line: u32,
    #[serde(default)]
    pub pull: Pull,
}

/// Software PWM output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwmSettings {
    pub line: u32,
    #[serde(default = "default_pwm_frequency")]
    pub frequency_hz: u32,
}

/// Complete device description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Identifier used for tamper state persistence
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Named input/output pins
    #[serde(default)]
    pub pins: BTreeMap<String, PinSettings>,

    /// Named PWM channels
    #[serde(default)]
    pub pwm: BTreeMap<String, PwmSettings>,

    #[serde(default)]
    pub thermal: ThermalSettings,

    #[serde(default)]
    pub power: PowerSettings,

    /// Tamper monitoring; absent disables it
    #[serde(default)]
    pub tamper: Option<TamperSettings>,

    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalSettings {
    #[serde(default = "default_thermal_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_warning")]
    pub warning: f32,
    #[serde(default = "default_critical")]
    pub critical: f32,
    #[serde(default = "default_ambient_warning")]
    pub ambient_warning: f32,
    #[serde(default = "default_ambient_critical")]
    pub ambient_critical: f32,
    #[serde(default = "default_fan_low")]
    pub fan_low: u8,
    #[serde(default = "default_fan_medium")]
    pub fan_medium: u8,
    #[serde(default = "default_fan_high")]
    pub fan_high: u8,
    #[serde(default = "default_duty_step")]
    pub duty_step: u8,
    /// Name of the PWM channel driving the fan
    #[serde(default)]
    pub fan_channel: Option<String>,
    #[serde(default)]
    pub throttle_pin: Option<String>,
    /// Sysfs thermal zone files (millidegrees)
    #[serde(default)]
    pub cpu_sensor: Option<PathBuf>,
    #[serde(default)]
    pub gpu_sensor: Option<PathBuf>,
    #[serde(default)]
    pub ambient_sensor: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSettings {
    #[serde(default = "default_power_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_critical_voltage")]
    pub critical_voltage: f64,
    #[serde(default = "default_critical_battery")]
    pub critical_battery_level: f64,
    /// Availability pin per source
    #[serde(default)]
    pub source_pins: BTreeMap<PowerSource, String>,
    #[serde(default)]
    pub battery_adc: Option<PathBuf>,
    #[serde(default)]
    pub voltage_adc: Option<PathBuf>,
    #[serde(default)]
    pub current_adc: Option<PathBuf>,
    #[serde(default = "default_stability_interval")]
    pub stability_interval_ms: u64,
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,
    #[serde(default = "default_ripple_threshold")]
    pub ripple_threshold: f64,
    #[serde(default = "default_current_threshold")]
    pub current_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TamperSettings {
    #[serde(default = "default_case_pin")]
    pub case_pin: String,
    #[serde(default = "default_motion_pin")]
    pub motion_pin: String,
    #[serde(default = "default_voltage_pin")]
    pub voltage_pin: String,
    #[serde(default = "default_tamper_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSettings {
    /// Pins exercised by the GPIO check
    #[serde(default)]
    pub gpio_pins: Vec<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_min_voltage")]
    pub min_voltage: f64,
    #[serde(default = "default_temp_min")]
    pub temp_min: f32,
    #[serde(default = "default_temp_max")]
    pub temp_max: f32,
}

fn default_device_id() -> String { "metalguard-0".to_string() }
fn default_pwm_frequency() -> u32 { pwm::DEFAULT_FREQUENCY_HZ }
fn default_thermal_interval() -> u64 { timing::THERMAL_INTERVAL.as_millis() as u64 }
fn default_warning() -> f32 { temperature::WARNING }
fn default_critical() -> f32 { temperature::CRITICAL }
fn default_ambient_warning() -> f32 { temperature::AMBIENT_WARNING }
fn default_ambient_critical() -> f32 { temperature::AMBIENT_CRITICAL }
fn default_fan_low() -> u8 { fan::LOW }
fn default_fan_medium() -> u8 { fan::MEDIUM }
fn default_fan_high() -> u8 { fan::HIGH }
fn default_duty_step() -> u8 { fan::DUTY_STEP }
fn default_power_interval() -> u64 { timing::POWER_INTERVAL.as_millis() as u64 }
fn default_critical_voltage() -> f64 { power::CRITICAL_VOLTAGE }
fn default_critical_battery() -> f64 { power::CRITICAL_BATTERY_LEVEL }
fn default_stability_interval() -> u64 { timing::STABILITY_INTERVAL.as_millis() as u64 }
fn default_sample_window() -> usize { power::SAMPLE_WINDOW }
fn default_ripple_threshold() -> f64 { power::RIPPLE_THRESHOLD }
fn default_current_threshold() -> f64 { power::CURRENT_THRESHOLD }
fn default_case_pin() -> String { "case_sensor".to_string() }
fn default_motion_pin() -> String { "motion_sensor".to_string() }
fn default_voltage_pin() -> String { "voltage_sensor".to_string() }
fn default_tamper_interval() -> u64 { timing::TAMPER_INTERVAL.as_millis() as u64 }
fn default_store_dir() -> PathBuf { PathBuf::from(paths::STATE_DIR) }
fn default_retries() -> u32 { diagnostics::RETRIES }
fn default_retry_delay() -> u64 { diagnostics::RETRY_DELAY.as_millis() as u64 }
fn default_min_voltage() -> f64 { diagnostics::MIN_VOLTAGE }
fn default_temp_min() -> f32 { diagnostics::TEMP_RANGE.0 }
fn default_temp_max() -> f32 { diagnostics::TEMP_RANGE.1 }

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            pins: BTreeMap::new(),
            pwm: BTreeMap::new(),
            thermal: ThermalSettings::default(),
            power: PowerSettings::default(),
            tamper: None,
            diagnostics: DiagnosticsSettings::default(),
        }
    }
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_thermal_interval(),
            warning: default_warning(),
            critical: default_critical(),
            ambient_warning: default_ambient_warning(),
            ambient_critical: default_ambient_critical(),
            fan_low: default_fan_low(),
            fan_medium: default_fan_medium(),
            fan_high: default_fan_high(),
            duty_step: default_duty_step(),
            fan_channel: None,
            throttle_pin: None,
            cpu_sensor: None,
            gpu_sensor: None,
            ambient_sensor: None,
        }
    }
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_power_interval(),
            critical_voltage: default_critical_voltage(),
            critical_battery_level: default_critical_battery(),
            source_pins: BTreeMap::new(),
            battery_adc: None,
            voltage_adc: None,
            current_adc: None,
            stability_interval_ms: default_stability_interval(),
            sample_window: default_sample_window(),
            ripple_threshold: default_ripple_threshold(),
            current_threshold: default_current_threshold(),
        }
    }
}

impl Default for TamperSettings {
    fn default() -> Self {
        Self {
            case_pin: default_case_pin(),
            motion_pin: default_motion_pin(),
            voltage_pin: default_voltage_pin(),
            interval_ms: default_tamper_interval(),
            store_dir: default_store_dir(),
        }
    }
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            gpio_pins: Vec::new(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay(),
            min_voltage: default_min_voltage(),
            temp_min: default_temp_min(),
            temp_max: default_temp_max(),
        }
    }
}

// ============================================================================
// Conversion into component configs
// ============================================================================

impl ThermalSettings {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.warning, self.critical)
    }

    pub fn ambient_thresholds(&self) -> Thresholds {
        Thresholds::new(self.ambient_warning, self.ambient_critical)
    }

    pub fn curve(&self) -> DutyCurve {
        DutyCurve {
            low: self.fan_low,
            medium: self.fan_medium,
            high: self.fan_high,
            step: self.duty_step,
        }
    }

    /// Controller config with sysfs sensors attached; callbacks are left to the caller
    pub fn config(&self) -> ThermalConfig {
        let mut config = ThermalConfig::default().with_interval(Duration::from_millis(self.interval_ms));
        config.thresholds = self.thresholds();
        config.ambient_thresholds = self.ambient_thresholds();
        config.curve = self.curve();
        if let Some(path) = &self.cpu_sensor {
            config = config.with_cpu_sensor(Arc::new(SysfsTemperature::new(path)));
        }
        if let Some(path) = &self.gpu_sensor {
            config = config.with_gpu_sensor(Arc::new(SysfsTemperature::new(path)));
        }
        if let Some(path) = &self.ambient_sensor {
            config = config.with_ambient_sensor(Arc::new(SysfsTemperature::new(path)));
        }
        if let Some(channel) = &self.fan_channel {
            config = config.with_fan_channel(channel.as_str());
        }
        if let Some(pin) = &self.throttle_pin {
            config = config.with_throttle_pin(pin.as_str());
        }
        config
    }
}

impl PowerSettings {
    pub fn config(&self) -> PowerConfig {
        let mut config = PowerConfig::default().with_interval(Duration::from_millis(self.interval_ms));
        config.critical_voltage = self.critical_voltage;
        config.critical_battery_level = self.critical_battery_level;
        for (source, pin) in &self.source_pins {
            config = config.with_source_pin(*source, pin.as_str());
        }
        if let Some(path) = &self.battery_adc {
            config = config.with_battery_adc(Arc::new(SysfsAdc::new(path)));
        }
        if let Some(path) = &self.voltage_adc {
            config = config.with_voltage_adc(Arc::new(SysfsAdc::new(path)));
        }
        if let Some(path) = &self.current_adc {
            config = config.with_current_adc(Arc::new(SysfsAdc::new(path)));
        }
        config
    }

    pub fn stability_config(&self) -> StabilityConfig {
        let mut config = StabilityConfig::default()
            .with_window(self.sample_window)
            .with_interval(Duration::from_millis(self.stability_interval_ms));
        config.ripple_threshold = self.ripple_threshold;
        config.current_threshold = self.current_threshold;
        config.critical_voltage = self.critical_voltage;
        config
    }
}

impl TamperSettings {
    /// Monitor config without a store; the caller opens `store_dir`
    pub fn config(&self, device_id: &str) -> TamperConfig {
        TamperConfig::new(device_id)
            .with_pins(self.case_pin.as_str(), self.motion_pin.as_str(), self.voltage_pin.as_str())
            .with_interval(Duration::from_millis(self.interval_ms))
    }

    fn pins(&self) -> [&str; 3] {
        [&self.case_pin, &self.motion_pin, &self.voltage_pin]
    }
}

impl DiagnosticsSettings {
    pub fn config(&self) -> DiagnosticsConfig {
        let mut config = DiagnosticsConfig::default()
            .with_gpio_pins(self.gpio_pins.iter().cloned())
            .with_retries(self.retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms));
        config.min_voltage = self.min_voltage;
        config.temp_range = (self.temp_min, self.temp_max);
        config
    }
}

// ============================================================================
// Validation
// ============================================================================

fn invalid(field: &str, reason: impl Into<String>) -> MetalGuardError {
    MetalGuardError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

impl DeviceSettings {
    /// Check thresholds, intervals and that every referenced pin exists
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(invalid("device_id", "must not be empty"));
        }
        if let Some(name) = self.pins.keys().find(|name| self.pwm.contains_key(*name)) {
            return Err(invalid("pwm", format!("'{}' is also declared as a pin", name)));
        }

        let thermal = &self.thermal;
        positive("thermal.interval_ms", thermal.interval_ms)?;
        thermal.thresholds().validate("thermal.thresholds")?;
        thermal.ambient_thresholds().validate("thermal.ambient_thresholds")?;
        thermal.curve().validate()?;
        if let Some(channel) = &thermal.fan_channel {
            if !self.pwm.contains_key(channel) {
                return Err(invalid("thermal.fan_channel", format!("unknown PWM channel '{}'", channel)));
            }
        }
        if let Some(pin) = &thermal.throttle_pin {
            self.require_pin("thermal.throttle_pin", pin)?;
        }

        let power = &self.power;
        positive("power.interval_ms", power.interval_ms)?;
        positive("power.stability_interval_ms", power.stability_interval_ms)?;
        positive("power.sample_window", power.sample_window as u64)?;
        for pin in power.source_pins.values() {
            self.require_pin("power.source_pins", pin)?;
        }

        if let Some(tamper) = &self.tamper {
            positive("tamper.interval_ms", tamper.interval_ms)?;
            for pin in tamper.pins() {
                self.require_pin("tamper", pin)?;
            }
        }

        let diag = &self.diagnostics;
        positive("diagnostics.retries", diag.retries as u64)?;
        if diag.temp_min > diag.temp_max {
            return Err(invalid(
                "diagnostics.temp_range",
                format!("{} > {}", diag.temp_min, diag.temp_max),
            ));
        }
        for pin in &diag.gpio_pins {
            if !self.pwm.contains_key(pin) {
                self.require_pin("diagnostics.gpio_pins", pin)?;
            }
        }
        Ok(())
    }

    fn require_pin(&self, field: &str, pin: &str) -> Result<()> {
        if !self.pins.contains_key(pin) {
            return Err(invalid(field, format!("unknown pin '{}'", pin)));
        }
        Ok(())
    }
}

/// Read, parse and validate a settings file
pub fn load_settings(path: &Path) -> Result<DeviceSettings> {
    let content = fs::read_to_string(path).map_err(|e| MetalGuardError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let settings: DeviceSettings = serde_json::from_str(&content)?;
    settings.validate()?;
    info!(?path, device = %settings.device_id, "Loaded device settings");
    Ok(settings)
}

/// Write settings as pretty JSON, atomically
pub fn save_settings(path: &Path, settings: &DeviceSettings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    let write_err = |path: &Path, e| MetalGuardError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
    }

    // Temp file then rename so a crash never leaves a half-written file
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path).map_err(|e| write_err(&temp_path, e))?;
    file.write_all(json.as_bytes()).map_err(|e| write_err(&temp_path, e))?;
    file.sync_all().map_err(|e| write_err(&temp_path, e))?;
    drop(file);
    fs::rename(&temp_path, path).map_err(|e| write_err(path, e))?;

    debug!(?path, "Saved device settings");
    Ok(())
}
