//! Tamper monitor
//!
//! Samples the case, motion and voltage-normal sensor pins into one
//! [`TamperState`] per tick. Persistence is best effort: store failures are
//! counted and logged, never returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{StateStore, TamperState, EVENT_TAMPER_DETECTED};
use crate::constants::timing;
use crate::error::{MetalGuardError, Result};
use crate::gpio::PinRegistry;

pub type TamperCallback = Arc<dyn Fn(&TamperState) + Send + Sync>;

#[derive(Clone)]
pub struct TamperConfig {
    pub device_id: String,
    pub case_pin: String,
    pub motion_pin: String,
    pub voltage_pin: String,
    pub interval: Duration,
    store: Option<Arc<dyn StateStore>>,
    on_tamper: Option<TamperCallback>,
}

impl TamperConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            case_pin: "case_sensor".to_string(),
            motion_pin: "motion_sensor".to_string(),
            voltage_pin: "voltage_sensor".to_string(),
            interval: timing::TAMPER_INTERVAL,
            store: None,
            on_tamper: None,
        }
    }

    pub fn with_pins(
        mut self,
        case_pin: impl Into<String>,
        motion_pin: impl Into<String>,
        voltage_pin: impl Into<String>,
    ) -> Self {
        self.case_pin = case_pin.into();
        self.motion_pin = motion_pin.into();
        self.voltage_pin = voltage_pin.into();
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_tamper<F>(mut self, f: F) -> Self
    where
        F: Fn(&TamperState) + Send + Sync + 'static,
    {
        self.on_tamper = Some(Arc::new(f));
        self
    }
}

pub struct TamperMonitor {
    registry: Arc<PinRegistry>,
    config: TamperConfig,
    state: Mutex<TamperState>,
    persistence_failures: AtomicU64,
}

impl TamperMonitor {
    /// Validate the configuration and seed the state from the store
    pub fn new(registry: Arc<PinRegistry>, config: TamperConfig) -> Result<Self> {
        if config.device_id.trim().is_empty() {
            return Err(MetalGuardError::config("device ID is required"));
        }
        if config.interval.is_zero() {
            return Err(MetalGuardError::InvalidConfig {
                field: "tamper.interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        for pin in [&config.case_pin, &config.motion_pin, &config.voltage_pin] {
            if !registry.contains(pin) {
                return Err(MetalGuardError::not_found("pin", pin.as_str()));
            }
        }

        let mut state = TamperState::default();
        if let Some(store) = &config.store {
            match store.load_state(&config.device_id) {
                Ok(saved) => {
                    debug!(device = %config.device_id, "Restored tamper state");
                    state = saved;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(device = %config.device_id, error = %e, "Failed to load tamper state"),
            }
        }

        Ok(Self {
            registry,
            config,
            state: Mutex::new(state),
            persistence_failures: AtomicU64::new(0),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn state(&self) -> TamperState {
        *self.state.lock()
    }

    /// Store operations that failed since startup
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    fn persistence_failed(&self, what: &str, e: &MetalGuardError) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        warn!(device = %self.config.device_id, error = %e, "Failed to {}", what);
    }

    /// Sample the sensors once
    ///
    /// Only pin read failures are returned; store failures are counted.
    pub fn check(&self) -> Result<TamperState> {
        let next = TamperState {
            case_open: self.registry.is_high(&self.config.case_pin)?,
            motion_detected: self.registry.is_high(&self.config.motion_pin)?,
            voltage_normal: self.registry.is_high(&self.config.voltage_pin)?,
            last_check: Some(Utc::now()),
        };
        *self.state.lock() = next;

        if next.is_tampered() {
            warn!(
                device = %self.config.device_id,
                case_open = next.case_open,
                motion = next.motion_detected,
                voltage_normal = next.voltage_normal,
                "Tamper detected"
            );
            if let Some(callback) = &self.config.on_tamper {
                callback(&next);
            }
            if let Some(store) = &self.config.store {
                let details = json!({
                    "case_open": next.case_open,
                    "motion_detected": next.motion_detected,
                    "voltage_normal": next.voltage_normal,
                });
                if let Err(e) = store.log_event(&self.config.device_id, EVENT_TAMPER_DETECTED, details) {
                    self.persistence_failed("log tamper event", &e);
                }
            }
        }

        if let Some(store) = &self.config.store {
            if let Err(e) = store.save_state(&self.config.device_id, &next) {
                self.persistence_failed("persist tamper state", &e);
            }
        }
        Ok(next)
    }

    /// Check until cancelled; a pin read failure ends the loop with its error
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(device = %self.config.device_id, "Tamper monitor started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check() {
                        error!(error = %e, "Tamper check failed");
                        return Err(e);
                    }
                }
            }
        }
        info!("Tamper monitor stopped");
        Ok(())
    }
}
