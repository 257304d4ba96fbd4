//! Hardware diagnostics
//!
//! A fixed battery of checks (GPIO, power, thermal, security) run in order
//! with per-check retries. See [`DiagnosticsOrchestrator`].

pub mod runner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::diagnostics;

pub use runner::DiagnosticsOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestKind {
    Gpio,
    Power,
    Thermal,
    Security,
}

impl TestKind {
    /// Battery order
    pub const ALL: [TestKind; 4] = [TestKind::Gpio, TestKind::Power, TestKind::Thermal, TestKind::Security];
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Gpio => write!(f, "GPIO"),
            TestKind::Power => write!(f, "Power"),
            TestKind::Thermal => write!(f, "Thermal"),
            TestKind::Security => write!(f, "Security"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Warning,
    Skipped,
}

/// One recorded check outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub kind: TestKind,
    pub component: String,
    pub status: TestStatus,
    pub reading: f64,
    pub expected: f64,
    pub description: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    pub fn new(kind: TestKind, component: impl Into<String>, status: TestStatus, description: impl Into<String>) -> Self {
        Self {
            kind,
            component: component.into(),
            status,
            reading: 0.0,
            expected: 0.0,
            description: description.into(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reading(mut self, reading: f64, expected: f64) -> Self {
        self.reading = reading;
        self.expected = expected;
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

pub type ResultCallback = Arc<dyn Fn(&TestResult) + Send + Sync>;

/// Expectations and retry policy
#[derive(Clone)]
pub struct DiagnosticsConfig {
    /// Pins exercised by the GPIO check
    pub gpio_pins: Vec<String>,
    /// Attempts per check before the run is aborted
    pub retries: u32,
    pub retry_delay: Duration,
    pub min_voltage: f64,
    /// Inclusive CPU/GPU range in °C
    pub temp_range: (f32, f32),
    on_test_complete: Option<ResultCallback>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            gpio_pins: Vec::new(),
            retries: diagnostics::RETRIES,
            retry_delay: diagnostics::RETRY_DELAY,
            min_voltage: diagnostics::MIN_VOLTAGE,
            temp_range: diagnostics::TEMP_RANGE,
            on_test_complete: None,
        }
    }
}

impl DiagnosticsConfig {
    pub fn with_gpio_pins<I, S>(mut self, pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gpio_pins = pins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn on_test_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&TestResult) + Send + Sync + 'static,
    {
        self.on_test_complete = Some(Arc::new(f));
        self
    }

    pub(crate) fn callback(&self) -> Option<&ResultCallback> {
        self.on_test_complete.as_ref()
    }
}
