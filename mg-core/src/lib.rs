//! MetalGuard Core Library
//!
//! Hardware supervision for a small single-board security appliance.
//!
//! # Features
//!
//! - **GPIO**: named pin registry, software PWM and debounced edge detection
//! - **Thermal**: zone classification, fan duty from temperature, throttling
//! - **Power**: source selection, critical detection, stability analytics and load testing
//! - **Security**: tamper sensing with persisted state and event log
//! - **Diagnostics**: a retried hardware self-test battery
//!
//! # Module Structure
//!
//! - `gpio/` - Pin registry, PWM engine, edge monitor
//! - `thermal/` - Sensors, duty curve, thermal controller
//! - `power/` - Power manager, stability monitor, load test
//! - `secure/` - Tamper monitor and state stores
//! - `diag/` - Diagnostics orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mg_core::gpio::{MemoryPin, Pull};
//! use mg_core::GpioController;
//!
//! let gpio = GpioController::new(true);
//! gpio.registry()
//!     .configure("case_sensor", Some(Arc::new(MemoryPin::new("case"))), Pull::Up)
//!     .unwrap();
//! ```

// Grouped modules
pub mod diag;
pub mod gpio;
pub mod power;
pub mod secure;
pub mod thermal;

// Standalone modules
pub mod constants;
pub mod settings;

pub mod error {
    pub use mg_error::{MetalGuardError, Result};
}

pub use error::{MetalGuardError, Result};

pub use diag::{DiagnosticsConfig, DiagnosticsOrchestrator, TestKind, TestResult, TestStatus};

pub use gpio::{
    Edge, EdgeConfig, EdgeMonitor, GpioController, Level, MemoryPin, PinIo, PinRegistry, Pull,
    PwmConfig, PwmEngine, SysfsPin,
};

pub use power::{
    LoadTestConfig, LoadTestReport, PowerConfig, PowerManager, PowerSource, PowerStabilityMonitor,
    PowerState, PowerStateSource, StabilityConfig, StabilityEvent, StabilityEventKind, StabilityMetrics,
};

pub use secure::{
    JsonFileStateStore, MemoryStateStore, StateStore, TamperConfig, TamperMonitor, TamperState,
};

pub use settings::{load_settings, save_settings, DeviceSettings};

pub use thermal::{ThermalConfig, ThermalController, ThermalLevel, ThermalState, Zone};
