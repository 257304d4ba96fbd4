//! Builds every subsystem from device settings

use std::sync::Arc;

use mg_core::gpio::{Edge, EdgeConfig, Level, MemoryPin, PinIo, Pull, PwmConfig, SysfsPin};
use mg_core::power::PowerStateSource;
use mg_core::secure::JsonFileStateStore;
use mg_core::{
    DeviceSettings, DiagnosticsOrchestrator, GpioController, PowerManager, PowerStabilityMonitor,
    TamperMonitor, ThermalController,
};
use mg_error::Result;
use tracing::{debug, error, info, warn};

/// Every monitor of one device, sharing one GPIO controller
pub struct System {
    pub gpio: GpioController,
    pub thermal: Arc<ThermalController>,
    pub power: Arc<PowerManager>,
    pub stability: Arc<PowerStabilityMonitor>,
    pub tamper: Option<Arc<TamperMonitor>>,
}

/// Simulated inputs idle at the level their pull resistor implies
fn backing(simulate: bool, name: &str, line: u32, pull: Pull) -> Arc<dyn PinIo> {
    if simulate {
        let pin = MemoryPin::new(name);
        if pull == Pull::Up {
            pin.drive(Level::High);
        }
        Arc::new(pin)
    } else {
        Arc::new(SysfsPin::new(line))
    }
}

pub fn build(settings: &DeviceSettings, simulate: bool) -> Result<System> {
    let gpio = GpioController::new(simulate);
    let registry = gpio.registry();
    let pwm = gpio.pwm();

    for (name, pin) in &settings.pins {
        registry.configure(name, Some(backing(simulate, name, pin.line, pin.pull)), pin.pull)?;
    }
    for (name, channel) in &settings.pwm {
        let config = PwmConfig {
            frequency_hz: channel.frequency_hz,
            ..PwmConfig::default()
        };
        pwm.configure(name, Some(backing(simulate, name, channel.line, Pull::Float)), config)?;
    }
    debug!(pins = settings.pins.len(), pwm = settings.pwm.len(), simulate, "GPIO configured");

    let thermal_config = settings
        .thermal
        .config()
        .on_warning(|state| warn!(warnings = ?state.warnings, fan_duty = state.fan_duty, "Thermal warning"))
        .on_critical(|state| {
            error!(cpu = state.cpu_temp, gpu = state.gpu_temp, throttled = state.throttled, "Thermal critical")
        });
    let thermal = Arc::new(ThermalController::new(registry.clone(), pwm, thermal_config)?);

    let power_config = settings.power.config().on_power_critical(|state| {
        error!(
            voltage = state.voltage,
            battery = state.battery_level,
            source = ?state.current_source,
            "Power critical"
        )
    });
    let power = Arc::new(PowerManager::new(registry.clone(), power_config)?);

    let stability_config = settings.power.stability_config().on_event(|event| {
        info!(kind = ?event.kind, reading = event.reading, threshold = event.threshold, "{}", event.details)
    });
    let stability = Arc::new(PowerStabilityMonitor::new(
        power.clone() as Arc<dyn PowerStateSource>,
        stability_config,
    )?);

    let tamper = match &settings.tamper {
        Some(tamper_settings) => {
            let store = JsonFileStateStore::open(&tamper_settings.store_dir)?;
            let config = tamper_settings
                .config(&settings.device_id)
                .with_store(Arc::new(store))
                .on_tamper(|state| {
                    error!(
                        case_open = state.case_open,
                        motion = state.motion_detected,
                        voltage_normal = state.voltage_normal,
                        "Tamper alarm"
                    )
                });
            let monitor = Arc::new(TamperMonitor::new(registry.clone(), config)?);
            bind_tamper_edges(&gpio, settings, &monitor)?;
            Some(monitor)
        }
        None => {
            info!("Tamper monitoring disabled");
            None
        }
    };

    Ok(System {
        gpio,
        thermal,
        power,
        stability,
        tamper,
    })
}

/// Re-check immediately when the case or motion sensor changes
fn bind_tamper_edges(gpio: &GpioController, settings: &DeviceSettings, monitor: &Arc<TamperMonitor>) -> Result<()> {
    let Some(tamper) = &settings.tamper else {
        return Ok(());
    };
    for name in [&tamper.case_pin, &tamper.motion_pin] {
        let pull = settings.pins.get(name).map(|pin| pin.pull).unwrap_or_default();
        let monitor = monitor.clone();
        let config = EdgeConfig::new(Edge::Both, move |pin, high| {
            debug!(pin = %pin, high, "Tamper sensor edge");
            if let Err(e) = monitor.check() {
                error!(error = %e, "Tamper check failed");
            }
        })
        .with_pull(pull);
        gpio.edges().enable(name, config)?;
    }
    Ok(())
}

/// Diagnostics battery wired to every built subsystem
pub fn diagnostics(system: &System, settings: &DeviceSettings) -> DiagnosticsOrchestrator {
    let mut diag = DiagnosticsOrchestrator::new(settings.diagnostics.config().on_test_complete(|result| {
        info!(
            test = %result.kind,
            component = %result.component,
            status = ?result.status,
            "{}",
            result.description
        )
    }))
    .with_registry(system.gpio.registry())
    .with_power(system.power.clone())
    .with_thermal(system.thermal.clone());
    if let Some(tamper) = &system.tamper {
        diag = diag.with_tamper(tamper.clone());
    }
    diag
}

/// Take one reading from every monitor so diagnostics see live values
pub fn prime(system: &System) {
    if let Err(e) = system.thermal.update() {
        warn!(error = %e, "Initial thermal reading failed");
    }
    if let Err(e) = system.power.update() {
        warn!(error = %e, "Initial power reading failed");
    }
    if let Some(tamper) = &system.tamper {
        if let Err(e) = tamper.check() {
            warn!(error = %e, "Initial tamper check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mg_core::settings::{PinSettings, PwmSettings, TamperSettings};
    use mg_core::TestStatus;
    use tokio_util::sync::CancellationToken;

    fn simulated_settings(store: &std::path::Path) -> DeviceSettings {
        let mut settings = DeviceSettings::default();
        for (name, line, pull) in [
            ("case_sensor", 17, Pull::Down),
            ("motion_sensor", 27, Pull::Down),
            ("voltage_sensor", 22, Pull::Up),
            ("throttle", 5, Pull::Float),
        ] {
            settings.pins.insert(name.to_string(), PinSettings { line, pull });
        }
        settings.pwm.insert(
            "fan".to_string(),
            PwmSettings {
                line: 18,
                frequency_hz: 1_000,
            },
        );
        settings.thermal.fan_channel = Some("fan".to_string());
        settings.thermal.throttle_pin = Some("throttle".to_string());
        settings.tamper = Some(TamperSettings {
            store_dir: store.to_path_buf(),
            ..TamperSettings::default()
        });
        settings.diagnostics.gpio_pins = vec!["throttle".to_string()];
        settings.diagnostics.retry_delay_ms = 5;
        settings
    }

    #[tokio::test]
    async fn test_build_simulated_system() {
        let dir = tempfile::tempdir().unwrap();
        let settings = simulated_settings(dir.path());
        let system = build(&settings, true).unwrap();

        assert!(system.tamper.is_some());
        assert_eq!(system.gpio.edges().bindings(), vec!["case_sensor", "motion_sensor"]);
        assert!(system.gpio.registry().is_high("voltage_sensor").unwrap());

        prime(&system);
        assert!(!system.tamper.as_ref().unwrap().state().is_tampered());
        system.gpio.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_diagnostics_on_simulated_system() {
        let dir = tempfile::tempdir().unwrap();
        let settings = simulated_settings(dir.path());
        let system = build(&settings, true).unwrap();
        prime(&system);

        let diag = diagnostics(&system, &settings);
        // no voltage ADC in simulation, so the power check fails every attempt
        let err = diag.run_all(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, mg_error::MetalGuardError::TestFailed { .. }));

        let results = diag.results();
        assert_eq!(results[0].status, TestStatus::Pass);
        assert_eq!(results[0].component, "throttle");
        system.gpio.close().await.unwrap();
    }
}
