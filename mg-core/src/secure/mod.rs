//! Physical tamper detection and its persistence

pub mod monitor;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use monitor::{TamperCallback, TamperConfig, TamperMonitor};
pub use store::{JsonFileStateStore, MemoryStateStore};

/// Event kind logged when any tamper condition is present
pub const EVENT_TAMPER_DETECTED: &str = "tamper_detected";

/// Sensor readings from one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperState {
    pub case_open: bool,
    pub motion_detected: bool,
    pub voltage_normal: bool,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for TamperState {
    fn default() -> Self {
        Self {
            case_open: false,
            motion_detected: false,
            voltage_normal: true,
            last_check: None,
        }
    }
}

impl TamperState {
    pub fn is_tampered(&self) -> bool {
        self.case_open || self.motion_detected || !self.voltage_normal
    }
}

/// Logged security event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TamperEvent {
    pub device_id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Persistence for tamper state and security events
pub trait StateStore: Send + Sync {
    fn save_state(&self, device_id: &str, state: &TamperState) -> Result<()>;

    /// Fails with a not-found error when nothing was saved for `device_id`
    fn load_state(&self, device_id: &str) -> Result<TamperState>;

    fn log_event(&self, device_id: &str, kind: &str, details: serde_json::Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tamper_conditions() {
        assert!(!TamperState::default().is_tampered());
        let open = TamperState {
            case_open: true,
            ..TamperState::default()
        };
        assert!(open.is_tampered());
        let brownout = TamperState {
            voltage_normal: false,
            ..TamperState::default()
        };
        assert!(brownout.is_tampered());
    }
}
