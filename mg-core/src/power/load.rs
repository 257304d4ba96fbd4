//! Power supply load test
//!
//! Energizes load-bank pins one at a time until the target current is drawn,
//! then samples voltage for the test duration and checks that the supply
//! held its minimum voltage and ripple budget. Load banks are always
//! de-energized before returning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::PowerManager;
use crate::constants::{diagnostics, power, timing};
use crate::error::{MetalGuardError, Result};
use crate::gpio::Level;

/// Progress report emitted on every sample
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTestProgress {
    pub current_draw: f64,
    pub voltage: f64,
    /// Worst ripple seen so far
    pub ripple: f64,
    pub elapsed: Duration,
    pub complete: bool,
}

/// Figures from a passed load test
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTestReport {
    pub banks_energized: usize,
    pub final_current: f64,
    pub min_voltage: f64,
    pub max_ripple: f64,
    pub elapsed: Duration,
}

pub type ProgressCallback = Arc<dyn Fn(&LoadTestProgress) + Send + Sync>;

#[derive(Clone)]
pub struct LoadTestConfig {
    /// Amps
    pub target_current: f64,
    pub duration: Duration,
    pub min_voltage: f64,
    pub max_ripple: f64,
    pub load_pins: Vec<String>,
    /// Wait after energizing each bank
    pub settle: Duration,
    pub sample_interval: Duration,
    on_progress: Option<ProgressCallback>,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            target_current: 1.0,
            duration: diagnostics::LOAD_TEST_TIME,
            min_voltage: diagnostics::MIN_VOLTAGE,
            max_ripple: power::RIPPLE_THRESHOLD,
            load_pins: vec![
                "load_bank_1".to_string(),
                "load_bank_2".to_string(),
                "load_bank_3".to_string(),
            ],
            settle: timing::LOAD_SETTLE,
            sample_interval: timing::LOAD_SAMPLE_INTERVAL,
            on_progress: None,
        }
    }
}

impl LoadTestConfig {
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&LoadTestProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.target_current <= 0.0 {
            return Err(MetalGuardError::validation("target_current", "must be > 0"));
        }
        if self.duration.is_zero() {
            return Err(MetalGuardError::validation("duration", "must be > 0"));
        }
        if self.min_voltage <= 0.0 {
            return Err(MetalGuardError::validation("min_voltage", "must be > 0"));
        }
        if self.sample_interval.is_zero() {
            return Err(MetalGuardError::validation("sample_interval", "must be > 0"));
        }
        if self.load_pins.is_empty() {
            return Err(MetalGuardError::validation("load_pins", "at least one load bank is required"));
        }
        Ok(())
    }
}

/// Sleep unless cancelled first
async fn pause(token: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(MetalGuardError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

impl PowerManager {
    /// Run a supply load test
    ///
    /// Samples are taken by refreshing the manager itself, so the test does
    /// not depend on [`PowerManager::run`] ticking in the background.
    pub async fn run_load_test(&self, token: CancellationToken, config: LoadTestConfig) -> Result<LoadTestReport> {
        config.validate()?;
        for pin in &config.load_pins {
            if !self.registry.contains(pin) {
                return Err(MetalGuardError::not_found("pin", pin.as_str()));
            }
        }

        info!(
            target_current = config.target_current,
            duration_ms = config.duration.as_millis() as u64,
            "Power load test started"
        );
        let result = self.drive_load(&token, &config).await;

        for pin in &config.load_pins {
            if let Err(e) = self.registry.set_level(pin, Level::Low) {
                warn!(pin = %pin, error = %e, "Failed to de-energize load bank");
            }
        }

        match &result {
            Ok(report) => info!(
                current = report.final_current,
                min_voltage = report.min_voltage,
                ripple = report.max_ripple,
                "Power load test passed"
            ),
            Err(e) => warn!(error = %e, "Power load test failed"),
        }
        result
    }

    async fn drive_load(&self, token: &CancellationToken, config: &LoadTestConfig) -> Result<LoadTestReport> {
        let initial = self.update()?;
        let mut banks_energized = 0;

        for pin in &config.load_pins {
            if token.is_cancelled() {
                return Err(MetalGuardError::Cancelled);
            }
            self.registry.set_level(pin, Level::High)?;
            banks_energized += 1;
            pause(token, config.settle).await?;

            let current = self.update()?.current();
            debug!(pin = %pin, current, "Load bank energized");
            if current >= config.target_current {
                break;
            }
        }

        let started = Instant::now();
        let mut min_voltage = initial.voltage;
        let mut low = f64::INFINITY;
        let mut high = f64::NEG_INFINITY;

        loop {
            pause(token, config.sample_interval).await?;

            let state = self.update()?;
            let current = state.current();
            min_voltage = min_voltage.min(state.voltage);
            low = low.min(state.voltage);
            high = high.max(state.voltage);
            let mut ripple = high - low;
            if let Some(stability) = &state.stability {
                ripple = ripple.max(stability.voltage_ripple);
            }
            let elapsed = started.elapsed();
            let complete = elapsed >= config.duration;

            if let Some(callback) = &config.on_progress {
                callback(&LoadTestProgress {
                    current_draw: current,
                    voltage: state.voltage,
                    ripple,
                    elapsed,
                    complete,
                });
            }

            if state.voltage < config.min_voltage {
                return Err(MetalGuardError::validation(
                    "voltage",
                    format!("dropped below minimum: {:.2}V < {:.2}V", state.voltage, config.min_voltage),
                ));
            }

            if complete {
                if ripple > config.max_ripple {
                    return Err(MetalGuardError::validation(
                        "ripple",
                        format!("exceeded maximum: {:.2}V > {:.2}V", ripple, config.max_ripple),
                    ));
                }
                if current < config.target_current {
                    return Err(MetalGuardError::validation(
                        "current",
                        format!("failed to reach target: {:.2}A < {:.2}A", current, config.target_current),
                    ));
                }
                return Ok(LoadTestReport {
                    banks_energized,
                    final_current: current,
                    min_voltage,
                    max_ripple: ripple,
                    elapsed,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{PinRegistry, Pull};
    use crate::power::{AdcSource, MemoryAdc, PowerConfig};
    use parking_lot::Mutex;

    /// Current rises by one amp per energized bank
    struct BankCurrent {
        registry: Arc<PinRegistry>,
        pins: Vec<String>,
    }

    impl AdcSource for BankCurrent {
        fn read_raw(&self) -> Result<f64> {
            let mut amps = 0.0;
            for pin in &self.pins {
                if self.registry.is_high(pin)? {
                    amps += 1.0;
                }
            }
            Ok(amps)
        }
    }

    fn setup(voltage: f64) -> (Arc<PinRegistry>, Arc<MemoryAdc>, PowerManager, LoadTestConfig) {
        let registry = Arc::new(PinRegistry::new(true));
        let pins: Vec<String> = (1..=3).map(|i| format!("load_bank_{}", i)).collect();
        for pin in &pins {
            registry.configure(pin, None, Pull::Float).unwrap();
        }
        let voltage = Arc::new(MemoryAdc::new(voltage));
        let config = PowerConfig::default()
            .with_voltage_adc(voltage.clone())
            .with_current_adc(Arc::new(BankCurrent {
                registry: registry.clone(),
                pins: pins.clone(),
            }));
        let manager = PowerManager::new(registry.clone(), config).unwrap();
        let test = LoadTestConfig {
            target_current: 2.0,
            duration: Duration::from_millis(40),
            settle: Duration::from_millis(2),
            sample_interval: Duration::from_millis(5),
            load_pins: pins,
            ..LoadTestConfig::default()
        };
        (registry, voltage, manager, test)
    }

    #[tokio::test]
    async fn test_passes_and_deenergizes() {
        let (registry, _voltage, manager, config) = setup(5.0);
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let config = config.on_progress(move |p| sink.lock().push(p.clone()));

        let report = manager.run_load_test(CancellationToken::new(), config).await.unwrap();
        assert_eq!(report.banks_energized, 2);
        assert!((report.final_current - 2.0).abs() < 1e-9);
        assert!(progress.lock().last().map(|p| p.complete).unwrap_or(false));
        for i in 1..=3 {
            assert!(!registry.is_high(&format!("load_bank_{}", i)).unwrap());
        }
    }

    #[tokio::test]
    async fn test_low_voltage_fails() {
        let (registry, _voltage, manager, config) = setup(4.5);
        let err = manager.run_load_test(CancellationToken::new(), config).await.unwrap_err();
        assert!(err.is_validation());
        assert!(!registry.is_high("load_bank_1").unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        let (_registry, _voltage, manager, mut config) = setup(5.0);
        config.target_current = 10.0;
        let err = manager.run_load_test(CancellationToken::new(), config).await.unwrap_err();
        assert!(err.to_string().contains("failed to reach target"));
    }

    #[tokio::test]
    async fn test_cancel_deenergizes() {
        let (registry, _voltage, manager, mut config) = setup(5.0);
        config.duration = Duration::from_secs(60);
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            })
        };
        let err = manager.run_load_test(token, config).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, MetalGuardError::Cancelled));
        assert!(!registry.is_high("load_bank_2").unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (_registry, _voltage, manager, mut config) = setup(5.0);
        config.target_current = 0.0;
        let err = manager.run_load_test(CancellationToken::new(), config).await.unwrap_err();
        assert!(err.is_validation());

        let (_registry, _voltage, manager, mut config) = setup(5.0);
        config.load_pins.push("load_bank_9".to_string());
        let err = manager.run_load_test(CancellationToken::new(), config).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
