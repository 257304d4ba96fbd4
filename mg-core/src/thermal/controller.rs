//! Thermal control loop
//!
//! Every tick reads all configured zones, classifies them, derives the fan
//! duty from the hottest of CPU/GPU and drives the throttle pin at critical.
//! Hardware is only touched when the derived value changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::curve::{DutyCurve, Thresholds};
use super::sensor::TemperatureSource;
use super::{ThermalLevel, ThermalState, Zone};
use crate::constants::{pwm, temperature, timing};
use crate::error::{MetalGuardError, Result};
use crate::gpio::{Level, PinRegistry, PwmEngine};

/// Invoked with the snapshot that triggered it
pub type ThermalCallback = Arc<dyn Fn(&ThermalState) + Send + Sync>;

/// Thermal controller configuration
#[derive(Clone)]
pub struct ThermalConfig {
    pub interval: Duration,
    /// CPU and GPU thresholds
    pub thresholds: Thresholds,
    pub ambient_thresholds: Thresholds,
    pub curve: DutyCurve,
    /// PWM channel driving the fan
    pub fan_channel: Option<String>,
    pub throttle_pin: Option<String>,
    cpu: Option<Arc<dyn TemperatureSource>>,
    gpu: Option<Arc<dyn TemperatureSource>>,
    ambient: Option<Arc<dyn TemperatureSource>>,
    on_warning: Option<ThermalCallback>,
    on_critical: Option<ThermalCallback>,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            interval: timing::THERMAL_INTERVAL,
            thresholds: Thresholds::new(temperature::WARNING, temperature::CRITICAL),
            ambient_thresholds: Thresholds::new(
                temperature::AMBIENT_WARNING,
                temperature::AMBIENT_CRITICAL,
            ),
            curve: DutyCurve::default(),
            fan_channel: None,
            throttle_pin: None,
            cpu: None,
            gpu: None,
            ambient: None,
            on_warning: None,
            on_critical: None,
        }
    }
}

impl ThermalConfig {
    pub fn with_cpu_sensor(mut self, sensor: Arc<dyn TemperatureSource>) -> Self {
        self.cpu = Some(sensor);
        self
    }

    pub fn with_gpu_sensor(mut self, sensor: Arc<dyn TemperatureSource>) -> Self {
        self.gpu = Some(sensor);
        self
    }

    pub fn with_ambient_sensor(mut self, sensor: Arc<dyn TemperatureSource>) -> Self {
        self.ambient = Some(sensor);
        self
    }

    pub fn with_fan_channel(mut self, name: impl Into<String>) -> Self {
        self.fan_channel = Some(name.into());
        self
    }

    pub fn with_throttle_pin(mut self, name: impl Into<String>) -> Self {
        self.throttle_pin = Some(name.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_warning<F>(mut self, f: F) -> Self
    where
        F: Fn(&ThermalState) + Send + Sync + 'static,
    {
        self.on_warning = Some(Arc::new(f));
        self
    }

    pub fn on_critical<F>(mut self, f: F) -> Self
    where
        F: Fn(&ThermalState) + Send + Sync + 'static,
    {
        self.on_critical = Some(Arc::new(f));
        self
    }

    fn sensors(&self) -> [(Zone, Option<&Arc<dyn TemperatureSource>>); 3] {
        [
            (Zone::Cpu, self.cpu.as_ref()),
            (Zone::Gpu, self.gpu.as_ref()),
            (Zone::Ambient, self.ambient.as_ref()),
        ]
    }

    fn thresholds_for(&self, zone: Zone) -> &Thresholds {
        match zone {
            Zone::Ambient => &self.ambient_thresholds,
            Zone::Cpu | Zone::Gpu => &self.thresholds,
        }
    }
}

#[derive(Default)]
struct Inner {
    state: ThermalState,
    levels: HashMap<Zone, ThermalLevel>,
    /// Last duty pushed to the fan channel
    applied_duty: Option<u8>,
    /// Last level written to the throttle pin
    applied_throttle: Option<bool>,
}

/// Fan-curve and throttle controller
pub struct ThermalController {
    registry: Arc<PinRegistry>,
    pwm: Arc<PwmEngine>,
    config: ThermalConfig,
    inner: Mutex<Inner>,
}

impl ThermalController {
    /// Validate thresholds and the referenced fan channel / throttle pin
    pub fn new(registry: Arc<PinRegistry>, pwm: Arc<PwmEngine>, config: ThermalConfig) -> Result<Self> {
        config.thresholds.validate("thermal.thresholds")?;
        config.ambient_thresholds.validate("thermal.ambient_thresholds")?;
        config.curve.validate()?;
        if config.interval.is_zero() {
            return Err(MetalGuardError::InvalidConfig {
                field: "thermal.interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if let Some(fan) = &config.fan_channel {
            pwm.config(fan)?;
        }
        if let Some(pin) = &config.throttle_pin {
            if !registry.contains(pin) {
                return Err(MetalGuardError::not_found("pin", pin.as_str()));
            }
        }

        Ok(Self {
            registry,
            pwm,
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Latest snapshot
    pub fn state(&self) -> ThermalState {
        self.inner.lock().state.clone()
    }

    /// Run one sampling tick and return the new snapshot
    ///
    /// A sensor read failure aborts the tick before any state changes. A
    /// failed throttle write puts the fan duty back before returning.
    pub fn update(&self) -> Result<ThermalState> {
        let mut readings: Vec<(Zone, f32)> = Vec::with_capacity(3);
        for (zone, sensor) in self.config.sensors() {
            if let Some(sensor) = sensor {
                readings.push((zone, sensor.read_celsius()?));
            }
        }

        let mut fired: Vec<ThermalCallback> = Vec::new();
        let snapshot = {
            let mut inner = self.inner.lock();
            let mut levels = inner.levels.clone();
            let mut next = ThermalState {
                cpu_temp: inner.state.cpu_temp,
                gpu_temp: inner.state.gpu_temp,
                ambient_temp: inner.state.ambient_temp,
                ..ThermalState::default()
            };

            for &(zone, temp) in &readings {
                match zone {
                    Zone::Cpu => next.cpu_temp = temp,
                    Zone::Gpu => next.gpu_temp = temp,
                    Zone::Ambient => next.ambient_temp = temp,
                }

                let level = ThermalLevel::classify(temp, self.config.thresholds_for(zone));
                let previous = levels.insert(zone, level).unwrap_or_default();
                if level != previous {
                    let callback = match level {
                        ThermalLevel::Critical => {
                            warn!(zone = %zone, temp, "Temperature critical");
                            self.config.on_critical.clone()
                        }
                        ThermalLevel::Warning => {
                            warn!(zone = %zone, temp, "Temperature warning");
                            self.config.on_warning.clone()
                        }
                        ThermalLevel::Cool => {
                            info!(zone = %zone, temp, "Temperature back to normal");
                            None
                        }
                    };
                    fired.extend(callback);
                }

                match level {
                    ThermalLevel::Critical => next.warnings.push(format!("{} temperature critical", zone)),
                    ThermalLevel::Warning => next.warnings.push(format!("{} temperature warning", zone)),
                    ThermalLevel::Cool => {}
                }
            }

            let hottest = next.cpu_temp.max(next.gpu_temp);
            next.fan_duty = self.config.curve.duty_for(hottest, &self.config.thresholds);
            next.throttled = hottest >= self.config.thresholds.critical;

            let previous_duty = inner.applied_duty;
            self.apply_duty(&mut inner, next.fan_duty)?;
            if let Err(e) = self.apply_throttle(&mut inner, next.throttled) {
                self.restore_duty(&mut inner, previous_duty);
                return Err(e);
            }

            inner.levels = levels;
            next.updated_at = Some(Utc::now());
            trace!(
                cpu = next.cpu_temp,
                gpu = next.gpu_temp,
                ambient = next.ambient_temp,
                duty = next.fan_duty,
                throttled = next.throttled,
                "Thermal tick"
            );
            inner.state = next.clone();
            next
        };

        for callback in fired {
            callback(&snapshot);
        }
        Ok(snapshot)
    }

    /// Push `duty` to the fan channel if it differs from the last one pushed
    fn apply_duty(&self, inner: &mut Inner, duty: u8) -> Result<()> {
        if inner.applied_duty == Some(duty) {
            return Ok(());
        }
        if let Some(fan) = &self.config.fan_channel {
            self.pwm.set_duty_cycle(fan, duty as u32)?;
            debug!(pwm = %fan, duty, "Fan duty changed");
        }
        inner.applied_duty = Some(duty);
        Ok(())
    }

    /// Undo a duty pushed earlier in a tick that then failed
    fn restore_duty(&self, inner: &mut Inner, previous: Option<u8>) {
        if inner.applied_duty == previous {
            return;
        }
        if let (Some(fan), Some(duty)) = (&self.config.fan_channel, previous) {
            if let Err(e) = self.pwm.set_duty_cycle(fan, duty as u32) {
                warn!(pwm = %fan, error = %e, "Failed to restore fan duty");
                inner.applied_duty = None;
                return;
            }
        }
        inner.applied_duty = previous;
    }

    fn apply_throttle(&self, inner: &mut Inner, throttled: bool) -> Result<()> {
        if inner.applied_throttle == Some(throttled) {
            return Ok(());
        }
        if let Some(pin) = &self.config.throttle_pin {
            self.registry.set_level(pin, Level::from(throttled))?;
            if throttled {
                warn!(pin = %pin, "Throttling enabled");
            } else if inner.applied_throttle.is_some() {
                info!(pin = %pin, "Throttling disabled");
            }
        }
        inner.applied_throttle = Some(throttled);
        Ok(())
    }

    /// Manually set the fan duty
    ///
    /// Holds until the next tick computes a different duty.
    pub fn set_fan_duty(&self, duty: u32) -> Result<()> {
        if duty > pwm::MAX_DUTY_CYCLE as u32 {
            return Err(MetalGuardError::InvalidDutyCycle { value: duty });
        }
        let duty = duty as u8;
        let mut inner = self.inner.lock();
        self.apply_duty(&mut inner, duty)?;
        inner.state.fan_duty = duty;
        Ok(())
    }

    /// Tick until cancelled
    ///
    /// Returns `Ok` on cancellation and the tick error otherwise. The fan
    /// channel is enabled for the duration of the loop.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        if let Some(fan) = &self.config.fan_channel {
            self.pwm.enable(fan).await?;
        }
        info!(interval_ms = self.config.interval.as_millis() as u64, "Thermal controller started");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.update() {
                        error!(error = %e, "Thermal update failed");
                        break Err(e);
                    }
                }
            }
        };

        if let Some(fan) = &self.config.fan_channel {
            if let Err(e) = self.pwm.disable(fan).await {
                warn!(pwm = %fan, error = %e, "Failed to stop fan channel");
            }
        }
        info!("Thermal controller stopped");
        result
    }
}
