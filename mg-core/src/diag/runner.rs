//! Diagnostics orchestrator
//!
//! Runs the battery in [`TestKind::ALL`] order. A failing check is retried
//! up to `retries` times with a cancellable pause in between; a check that
//! exhausts its retries aborts the whole run, so later checks leave no
//! results behind. A check whose subsystem is not wired fails like any
//! other, and an empty `gpio_pins` list passes without recording anything.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DiagnosticsConfig, TestKind, TestResult, TestStatus};
use crate::error::{MetalGuardError, Result};
use crate::gpio::{Level, PinRegistry};
use crate::power::PowerStateSource;
use crate::secure::TamperMonitor;
use crate::thermal::ThermalController;

pub struct DiagnosticsOrchestrator {
    config: DiagnosticsConfig,
    registry: Option<Arc<PinRegistry>>,
    power: Option<Arc<dyn PowerStateSource>>,
    thermal: Option<Arc<ThermalController>>,
    tamper: Option<Arc<TamperMonitor>>,
    results: RwLock<Vec<TestResult>>,
}

impl DiagnosticsOrchestrator {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            config,
            registry: None,
            power: None,
            thermal: None,
            tamper: None,
            results: RwLock::new(Vec::new()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<PinRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_power(mut self, power: Arc<dyn PowerStateSource>) -> Self {
        self.power = Some(power);
        self
    }

    pub fn with_thermal(mut self, thermal: Arc<ThermalController>) -> Self {
        self.thermal = Some(thermal);
        self
    }

    pub fn with_tamper(mut self, tamper: Arc<TamperMonitor>) -> Self {
        self.tamper = Some(tamper);
        self
    }

    fn validate(&self) -> Result<&Arc<PinRegistry>> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| MetalGuardError::MissingDependency("GPIO registry".to_string()))?;
        if self.config.retries == 0 {
            return Err(MetalGuardError::InvalidConfig {
                field: "diagnostics.retries".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        let (low, high) = self.config.temp_range;
        if low > high {
            return Err(MetalGuardError::InvalidConfig {
                field: "diagnostics.temp_range".to_string(),
                reason: format!("{} > {}", low, high),
            });
        }
        Ok(registry)
    }

    /// Snapshot of every result recorded so far
    pub fn results(&self) -> Vec<TestResult> {
        self.results.read().clone()
    }

    pub fn clear_results(&self) {
        self.results.write().clear();
    }

    fn record(&self, result: TestResult) {
        debug!(kind = %result.kind, component = %result.component, status = ?result.status, "Test result");
        self.results.write().push(result.clone());
        if let Some(callback) = self.config.callback() {
            callback(&result);
        }
    }

    /// Run the full battery
    pub async fn run_all(&self, token: CancellationToken) -> Result<()> {
        let registry = self.validate()?;
        info!(retries = self.config.retries, "Diagnostics started");

        for kind in TestKind::ALL {
            let mut attempt = 0;
            loop {
                if token.is_cancelled() {
                    return Err(MetalGuardError::Cancelled);
                }
                attempt += 1;

                let outcome = match kind {
                    TestKind::Gpio => self.test_gpio(registry),
                    TestKind::Power => self.test_power(),
                    TestKind::Thermal => self.test_thermal(),
                    TestKind::Security => self.test_security(),
                };

                match outcome {
                    Ok(()) => break,
                    Err(e) if attempt >= self.config.retries => {
                        warn!(test = %kind, attempts = attempt, error = %e, "Diagnostics aborted");
                        return Err(MetalGuardError::TestFailed {
                            test: kind.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    Err(e) => {
                        warn!(test = %kind, attempt, error = %e, "Test failed, retrying");
                        pause(&token, self.config.retry_delay).await?;
                    }
                }
            }
        }

        info!("Diagnostics passed");
        Ok(())
    }

    fn test_gpio(&self, registry: &PinRegistry) -> Result<()> {
        for pin in &self.config.gpio_pins {
            if let Err(e) = exercise_pin(registry, pin) {
                self.record(
                    TestResult::new(TestKind::Gpio, pin.as_str(), TestStatus::Fail, "Pin readback mismatch")
                        .with_error(&e),
                );
                return Err(e);
            }
            self.record(TestResult::new(
                TestKind::Gpio,
                pin.as_str(),
                TestStatus::Pass,
                "GPIO pin functional",
            ));
        }
        Ok(())
    }

    fn test_power(&self) -> Result<()> {
        let Some(power) = &self.power else {
            return Err(MetalGuardError::MissingDependency("power manager".to_string()));
        };

        let state = power.power_state();
        if state.voltage < self.config.min_voltage {
            let e = MetalGuardError::validation(
                "voltage",
                format!("{:.2}V below minimum {:.2}V", state.voltage, self.config.min_voltage),
            );
            self.record(
                TestResult::new(TestKind::Power, "voltage", TestStatus::Fail, "Voltage below minimum")
                    .with_reading(state.voltage, self.config.min_voltage)
                    .with_error(&e),
            );
            return Err(e);
        }

        self.record(
            TestResult::new(TestKind::Power, "power_system", TestStatus::Pass, "Power system functional")
                .with_reading(state.voltage, self.config.min_voltage),
        );
        Ok(())
    }

    fn test_thermal(&self) -> Result<()> {
        let Some(thermal) = &self.thermal else {
            return Err(MetalGuardError::MissingDependency("thermal controller".to_string()));
        };

        let state = thermal.state();
        let (low, high) = self.config.temp_range;
        for (component, label, temp) in [("cpu_temp", "CPU", state.cpu_temp), ("gpu_temp", "GPU", state.gpu_temp)] {
            if temp < low || temp > high {
                let bound = if temp < low { low } else { high };
                let e = MetalGuardError::validation(
                    component,
                    format!("{} temp {:.1}°C outside range {}..{}", label, temp, low, high),
                );
                self.record(
                    TestResult::new(
                        TestKind::Thermal,
                        component,
                        TestStatus::Fail,
                        format!("{} temperature out of range", label),
                    )
                    .with_reading(temp as f64, bound as f64)
                    .with_error(&e),
                );
                return Err(e);
            }
        }

        if let Err(e) = thermal.set_fan_duty(crate::constants::fan::LOW as u32) {
            self.record(
                TestResult::new(TestKind::Thermal, "fan", TestStatus::Fail, "Failed to control fan speed")
                    .with_error(&e),
            );
            return Err(e);
        }

        self.record(TestResult::new(
            TestKind::Thermal,
            "thermal_system",
            TestStatus::Pass,
            "Thermal system functional",
        ));
        Ok(())
    }

    fn test_security(&self) -> Result<()> {
        let Some(tamper) = &self.tamper else {
            return Err(MetalGuardError::MissingDependency("tamper monitor".to_string()));
        };

        let state = tamper.state();
        if state.case_open {
            self.record(TestResult::new(
                TestKind::Security,
                "case_sensor",
                TestStatus::Warning,
                "Case open detected",
            ));
        }
        if state.motion_detected {
            self.record(TestResult::new(
                TestKind::Security,
                "motion_sensor",
                TestStatus::Warning,
                "Motion detected",
            ));
        }
        if !state.voltage_normal {
            let e = MetalGuardError::validation("voltage_monitor", "security voltage monitor shows abnormal state");
            self.record(
                TestResult::new(
                    TestKind::Security,
                    "voltage_monitor",
                    TestStatus::Fail,
                    "Abnormal voltage detected",
                )
                .with_error(&e),
            );
            return Err(e);
        }

        self.record(TestResult::new(
            TestKind::Security,
            "security_system",
            TestStatus::Pass,
            "Security system functional",
        ));
        Ok(())
    }
}

/// Drive high, read back, restore the previous level
fn exercise_pin(registry: &PinRegistry, pin: &str) -> Result<()> {
    let previous = registry.read_level(pin)?;
    registry.set_level(pin, Level::High)?;
    let readback = registry.read_level(pin);
    registry.set_level(pin, previous)?;

    if readback? != Level::High {
        return Err(MetalGuardError::hardware(pin, "pin did not read back HIGH"));
    }
    Ok(())
}

async fn pause(token: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(MetalGuardError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{MemoryPin, Pull, PwmEngine};
    use crate::power::{PowerSource, PowerState};
    use crate::secure::TamperConfig;
    use crate::thermal::{MemoryTemperature, ThermalConfig};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Reports each scripted voltage once, then repeats the last
    struct ScriptedPower {
        voltages: Mutex<Vec<f64>>,
    }

    impl ScriptedPower {
        fn new(voltages: &[f64]) -> Arc<Self> {
            let mut voltages = voltages.to_vec();
            voltages.reverse();
            Arc::new(Self {
                voltages: Mutex::new(voltages),
            })
        }
    }

    impl PowerStateSource for ScriptedPower {
        fn power_state(&self) -> PowerState {
            let mut voltages = self.voltages.lock();
            let voltage = if voltages.len() > 1 {
                voltages.pop().unwrap_or_default()
            } else {
                voltages.last().copied().unwrap_or_default()
            };
            PowerState {
                voltage,
                current_source: Some(PowerSource::Main),
                available: BTreeMap::from([(PowerSource::Main, true)]),
                ..PowerState::default()
            }
        }
    }

    fn registry_with(pins: &[&str]) -> Arc<PinRegistry> {
        let registry = Arc::new(PinRegistry::new(true));
        for pin in pins {
            registry
                .configure(pin, Some(Arc::new(MemoryPin::new(*pin))), Pull::Float)
                .unwrap();
        }
        registry
    }

    /// Sensorless thermal controller and a tamper monitor over a closed, powered case
    fn healthy(registry: &Arc<PinRegistry>) -> (Arc<ThermalController>, Arc<TamperMonitor>) {
        for pin in ["case_sensor", "motion_sensor", "voltage_sensor"] {
            registry
                .configure(pin, Some(Arc::new(MemoryPin::new(pin))), Pull::Float)
                .unwrap();
        }
        registry.set_level("voltage_sensor", Level::High).unwrap();

        let pwm = Arc::new(PwmEngine::new(registry.clone()));
        let thermal = Arc::new(ThermalController::new(registry.clone(), pwm, ThermalConfig::default()).unwrap());
        let tamper = Arc::new(TamperMonitor::new(registry.clone(), TamperConfig::new("dev-1")).unwrap());
        tamper.check().unwrap();
        (thermal, tamper)
    }

    fn wired(config: DiagnosticsConfig, registry: Arc<PinRegistry>, power: Arc<ScriptedPower>) -> DiagnosticsOrchestrator {
        let (thermal, tamper) = healthy(&registry);
        DiagnosticsOrchestrator::new(config)
            .with_registry(registry)
            .with_power(power)
            .with_thermal(thermal)
            .with_tamper(tamper)
    }

    fn fast_config() -> DiagnosticsConfig {
        DiagnosticsConfig::default().with_retry_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_missing_registry() {
        let diag = DiagnosticsOrchestrator::new(fast_config());
        let err = diag.run_all(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MetalGuardError::MissingDependency(_)));
    }

    #[tokio::test]
    async fn test_unwired_subsystem_aborts_after_retries() {
        let diag = DiagnosticsOrchestrator::new(fast_config().with_retries(3)).with_registry(registry_with(&[]));

        let err = diag.run_all(CancellationToken::new()).await.unwrap_err();
        match err {
            MetalGuardError::TestFailed { test, attempts, source } => {
                assert_eq!(test, "Power");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, MetalGuardError::MissingDependency(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
        // empty gpio_pins passes silently and the unwired check records nothing
        assert!(diag.results().is_empty());
    }

    #[tokio::test]
    async fn test_unwired_security_aborts_after_earlier_checks_pass() {
        let registry = registry_with(&[]);
        let (thermal, _tamper) = healthy(&registry);
        let diag = DiagnosticsOrchestrator::new(fast_config().with_retries(2))
            .with_registry(registry)
            .with_power(ScriptedPower::new(&[5.0]))
            .with_thermal(thermal);

        let err = diag.run_all(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MetalGuardError::TestFailed { ref test, attempts: 2, .. } if test == "Security"));
        let kinds: Vec<TestKind> = diag.results().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![TestKind::Power, TestKind::Thermal]);
    }

    #[tokio::test]
    async fn test_retry_then_pass() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = fast_config().with_retries(3).on_test_complete(move |r| sink.lock().push(r.status));
        let diag = wired(config, registry_with(&[]), ScriptedPower::new(&[4.2, 4.3, 5.0]));

        diag.run_all(CancellationToken::new()).await.unwrap();

        let power: Vec<TestStatus> = diag
            .results()
            .iter()
            .filter(|r| r.kind == TestKind::Power)
            .map(|r| r.status)
            .collect();
        assert_eq!(power, vec![TestStatus::Fail, TestStatus::Fail, TestStatus::Pass]);
        assert_eq!(seen.lock().len(), diag.results().len());
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort_the_run() {
        let diag = wired(fast_config().with_retries(3), registry_with(&[]), ScriptedPower::new(&[4.0]));

        let err = diag.run_all(CancellationToken::new()).await.unwrap_err();
        match err {
            MetalGuardError::TestFailed { test, attempts, .. } => {
                assert_eq!(test, "Power");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {}", other),
        }

        let results = diag.results();
        assert_eq!(results.iter().filter(|r| r.kind == TestKind::Power).count(), 3);
        assert!(!results.iter().any(|r| r.kind == TestKind::Thermal || r.kind == TestKind::Security));
    }

    #[tokio::test]
    async fn test_gpio_restores_level() {
        let registry = registry_with(&["led"]);
        let diag = wired(fast_config().with_gpio_pins(["led"]), registry.clone(), ScriptedPower::new(&[5.0]));
        diag.run_all(CancellationToken::new()).await.unwrap();

        assert_eq!(registry.read_level("led").unwrap(), Level::Low);
        assert_eq!(diag.results()[0].status, TestStatus::Pass);
        assert_eq!(diag.results()[0].component, "led");
    }

    #[tokio::test]
    async fn test_thermal_failure_reports_violated_bound() {
        let registry = registry_with(&[]);
        let (_thermal, tamper) = healthy(&registry);
        let pwm = Arc::new(PwmEngine::new(registry.clone()));
        let thermal = Arc::new(
            ThermalController::new(
                registry.clone(),
                pwm,
                ThermalConfig::default().with_cpu_sensor(Arc::new(MemoryTemperature::new(-20.0))),
            )
            .unwrap(),
        );
        thermal.update().unwrap();

        let diag = DiagnosticsOrchestrator::new(fast_config().with_retries(1))
            .with_registry(registry)
            .with_power(ScriptedPower::new(&[5.0]))
            .with_thermal(thermal)
            .with_tamper(tamper);
        diag.run_all(CancellationToken::new()).await.unwrap_err();

        let failed = diag
            .results()
            .into_iter()
            .find(|r| r.kind == TestKind::Thermal)
            .unwrap();
        assert_eq!(failed.component, "cpu_temp");
        assert_eq!(failed.status, TestStatus::Fail);
        assert_eq!(failed.reading, -20.0);
        assert_eq!(failed.expected, -10.0);
    }

    #[tokio::test]
    async fn test_security_warnings_and_failure() {
        let registry = registry_with(&[]);
        let (thermal, tamper) = healthy(&registry);
        registry.set_level("case_sensor", Level::High).unwrap();
        registry.set_level("voltage_sensor", Level::Low).unwrap();
        tamper.check().unwrap();

        let diag = DiagnosticsOrchestrator::new(fast_config().with_retries(1))
            .with_registry(registry)
            .with_power(ScriptedPower::new(&[5.0]))
            .with_thermal(thermal)
            .with_tamper(tamper);
        let err = diag.run_all(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MetalGuardError::TestFailed { .. }));

        let security: Vec<(String, TestStatus)> = diag
            .results()
            .into_iter()
            .filter(|r| r.kind == TestKind::Security)
            .map(|r| (r.component, r.status))
            .collect();
        assert_eq!(
            security,
            vec![
                ("case_sensor".to_string(), TestStatus::Warning),
                ("voltage_monitor".to_string(), TestStatus::Fail),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_retry_pause() {
        let diag = DiagnosticsOrchestrator::new(
            DiagnosticsConfig::default().with_retry_delay(Duration::from_secs(30)),
        )
        .with_registry(registry_with(&[]))
        .with_power(ScriptedPower::new(&[4.0]));

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };
        let err = diag.run_all(token).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, MetalGuardError::Cancelled));
    }

    #[tokio::test]
    async fn test_clear_results() {
        let diag = wired(fast_config(), registry_with(&[]), ScriptedPower::new(&[5.0]));
        diag.run_all(CancellationToken::new()).await.unwrap();
        assert!(!diag.results().is_empty());
        diag.clear_results();
        assert!(diag.results().is_empty());
    }
}
