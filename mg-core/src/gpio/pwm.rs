//! Software PWM generation
//!
//! One generation task per enabled channel. Each cycle re-reads the duty
//! cycle, drives the pin high for `period * duty / 100` and low for the
//! remainder. Every wait is raced against the channel's cancellation token so
//! `disable` interrupts mid-period instead of waiting out the low phase.
//!
//! Output is best-effort: a failed pin write is logged and the loop carries on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::pin::{Level, PinIo, Pull};
use super::registry::PinRegistry;
use crate::constants::pwm as pwm_const;
use crate::error::{MetalGuardError, Result};

/// PWM channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmConfig {
    /// Frequency in Hz; 0 selects the default (25 kHz)
    pub frequency_hz: u32,
    /// Initial duty cycle (0-100)
    pub duty_cycle: u8,
    pub pull: Pull,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            frequency_hz: pwm_const::DEFAULT_FREQUENCY_HZ,
            duty_cycle: 0,
            pull: Pull::Float,
        }
    }
}

fn validate_duty(value: u32) -> Result<u8> {
    if value > pwm_const::MAX_DUTY_CYCLE as u32 {
        return Err(MetalGuardError::InvalidDutyCycle { value });
    }
    Ok(value as u8)
}

fn validate_frequency(hz: u32) -> Result<u32> {
    if hz == 0 {
        return Err(MetalGuardError::validation("frequency", "must be greater than 0 Hz"));
    }
    if hz > pwm_const::MAX_FREQUENCY_HZ {
        return Err(MetalGuardError::validation(
            "frequency",
            format!("{} Hz exceeds maximum {} Hz", hz, pwm_const::MAX_FREQUENCY_HZ),
        ));
    }
    Ok(hz)
}

/// Split one period into its high and low phases
fn phases(period: Duration, duty: u8) -> (Duration, Duration) {
    let period_ns = period.as_nanos() as u64;
    let high_ns = period_ns * duty as u64 / 100;
    (
        Duration::from_nanos(high_ns),
        Duration::from_nanos(period_ns - high_ns),
    )
}

struct PwmTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct PwmChannel {
    name: String,
    settings: Mutex<PwmConfig>,
    enabled: AtomicBool,
    /// Serializes enable/disable so disable can await loop exit
    task: tokio::sync::Mutex<Option<PwmTask>>,
}

impl PwmChannel {
    fn cycle(&self) -> (u8, Duration) {
        let settings = self.settings.lock();
        let period = Duration::from_nanos(pwm_const::NANOS_PER_SECOND / settings.frequency_hz as u64);
        (settings.duty_cycle, period)
    }
}

/// Per-pin software PWM
pub struct PwmEngine {
    registry: Arc<PinRegistry>,
    channels: RwLock<HashMap<String, Arc<PwmChannel>>>,
}

impl PwmEngine {
    pub fn new(registry: Arc<PinRegistry>) -> Self {
        Self {
            registry,
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn channel(&self, name: &str) -> Result<Arc<PwmChannel>> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetalGuardError::not_found("PWM channel", name))
    }

    /// Register a pin for PWM output and drive it low
    pub fn configure(&self, name: &str, backing: Option<Arc<dyn PinIo>>, config: PwmConfig) -> Result<()> {
        let duty_cycle = validate_duty(config.duty_cycle as u32)?;
        let frequency_hz = if config.frequency_hz == 0 {
            pwm_const::DEFAULT_FREQUENCY_HZ
        } else {
            validate_frequency(config.frequency_hz)?
        };

        if let Ok(existing) = self.channel(name) {
            if existing.enabled.load(Ordering::SeqCst) {
                return Err(MetalGuardError::config(format!(
                    "PWM channel {} is running; disable it before reconfiguring",
                    name
                )));
            }
        }

        self.registry.configure(name, backing, config.pull)?;
        self.registry.set_level(name, Level::Low).map_err(|e| {
            MetalGuardError::config(format!("failed to configure pin {} as output: {}", name, e))
        })?;

        let channel = Arc::new(PwmChannel {
            name: name.to_string(),
            settings: Mutex::new(PwmConfig {
                frequency_hz,
                duty_cycle,
                pull: config.pull,
            }),
            enabled: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(None),
        });
        self.channels.write().insert(name.to_string(), channel);

        info!(pwm = %name, frequency_hz, duty_cycle, "PWM channel configured");
        Ok(())
    }

    /// Start signal generation; a no-op if already running
    pub async fn enable(&self, name: &str) -> Result<()> {
        let channel = self.channel(name)?;
        if !self.registry.is_enabled() {
            return Err(MetalGuardError::Disabled);
        }

        let mut task = channel.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(generate(
            self.registry.clone(),
            channel.clone(),
            token.clone(),
        ));
        *task = Some(PwmTask { token, handle });
        channel.enabled.store(true, Ordering::SeqCst);

        debug!(pwm = %name, "PWM generation started");
        Ok(())
    }

    /// Stop signal generation and drive the pin low
    ///
    /// Returns only after the generation task has exited, so no write can
    /// follow the final low. Repeated calls are no-ops.
    pub async fn disable(&self, name: &str) -> Result<()> {
        let channel = self.channel(name)?;
        let mut task = channel.task.lock().await;
        let Some(running) = task.take() else {
            return Ok(());
        };

        channel.enabled.store(false, Ordering::SeqCst);
        running.token.cancel();
        if let Err(e) = running.handle.await {
            error!(pwm = %name, error = %e, "PWM generation task failed");
        }

        self.registry.set_level(name, Level::Low)?;
        debug!(pwm = %name, "PWM generation stopped");
        Ok(())
    }

    /// Update the duty cycle; a running channel picks it up on its next cycle
    pub fn set_duty_cycle(&self, name: &str, duty_cycle: u32) -> Result<()> {
        let channel = self.channel(name)?;
        let duty_cycle = validate_duty(duty_cycle)?;
        channel.settings.lock().duty_cycle = duty_cycle;
        trace!(pwm = %name, duty_cycle, "Duty cycle updated");
        Ok(())
    }

    /// Change the frequency; an explicit 0 Hz is rejected here
    pub fn set_frequency(&self, name: &str, frequency_hz: u32) -> Result<()> {
        let channel = self.channel(name)?;
        let frequency_hz = validate_frequency(frequency_hz)?;
        channel.settings.lock().frequency_hz = frequency_hz;
        Ok(())
    }

    pub fn duty_cycle(&self, name: &str) -> Result<u8> {
        let channel = self.channel(name)?;
        let duty_cycle = channel.settings.lock().duty_cycle;
        Ok(duty_cycle)
    }

    /// Effective configuration of a channel
    pub fn config(&self, name: &str) -> Result<PwmConfig> {
        let channel = self.channel(name)?;
        let config = *channel.settings.lock();
        Ok(config)
    }

    pub fn is_enabled(&self, name: &str) -> Result<bool> {
        Ok(self.channel(name)?.enabled.load(Ordering::SeqCst))
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Disable every channel, returning the last error seen
    pub async fn close_all(&self) -> Result<()> {
        let mut last_err = None;
        for name in self.channels() {
            if let Err(e) = self.disable(&name).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
async fn hold(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn drive(registry: &PinRegistry, name: &str, level: Level, failures: &mut u64) {
    if let Err(e) = registry.set_level(name, level) {
        *failures += 1;
        if *failures == 1 || *failures % 1000 == 0 {
            debug!(pwm = %name, failures = *failures, error = %e, "PWM write failed (ignored)");
        }
    }
}

async fn generate(registry: Arc<PinRegistry>, channel: Arc<PwmChannel>, token: CancellationToken) {
    let mut failures: u64 = 0;

    while !token.is_cancelled() {
        let (duty, period) = channel.cycle();
        let (high, low) = phases(period, duty);

        if !high.is_zero() {
            drive(&registry, &channel.name, Level::High, &mut failures);
            if !hold(&token, high).await {
                break;
            }
        }
        if !low.is_zero() {
            drive(&registry, &channel.name, Level::Low, &mut failures);
            if !hold(&token, low).await {
                break;
            }
        }
    }

    trace!(pwm = %channel.name, failures, "PWM loop exited");
}
