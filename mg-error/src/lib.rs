//! Unified error handling for MetalGuard
//!
//! This crate provides a single error type used across all MetalGuard components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using MetalGuardError
pub type Result<T> = std::result::Result<T, MetalGuardError>;

/// Unified error type for all MetalGuard operations
#[derive(thiserror::Error, Debug)]
pub enum MetalGuardError {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing required dependency: {0}")]
    MissingDependency(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Lookup Errors
    // ============================================================================
    #[error("{kind} {name} not found")]
    NotFound {
        kind: &'static str,
        name: String,
    },

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("Invalid duty cycle: {value} (must be 0-100)")]
    InvalidDutyCycle {
        value: u32,
    },

    #[error("Invalid value for {field}: {reason}")]
    Validation {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Hardware Access Errors
    // ============================================================================
    #[error("Hardware I/O error on pin {pin}: {reason}")]
    HardwareIo {
        pin: String,
        reason: String,
    },

    #[error("Failed to read sensor {path}: {reason}")]
    SensorRead {
        path: PathBuf,
        reason: String,
    },

    #[error("GPIO controller is disabled")]
    Disabled,

    // ============================================================================
    // I/O and Persistence Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("State store error: {0}")]
    Store(String),

    // ============================================================================
    // Run Control Errors
    // ============================================================================
    #[error("{test} tests failed after {attempts} attempts: {source}")]
    TestFailed {
        test: String,
        attempts: u32,
        #[source]
        source: Box<MetalGuardError>,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl MetalGuardError {
    /// Create a configuration error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a not-found error for the given entity kind ("pin", "PWM channel", ...)
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a validation error for a runtime parameter
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a hardware I/O error for a pin
    pub fn hardware(pin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HardwareIo {
            pin: pin.into(),
            reason: reason.into(),
        }
    }

    /// Create a state store error from a string
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::MissingDependency(_) | Self::InvalidConfig { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::InvalidDutyCycle { .. })
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::HardwareIo { .. } | Self::SensorRead { .. })
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert!(MetalGuardError::config("x").is_configuration());
        assert!(MetalGuardError::MissingDependency("gpio".into()).is_configuration());
        assert!(MetalGuardError::not_found("pin", "fan").is_not_found());
        assert!(MetalGuardError::InvalidDutyCycle { value: 101 }.is_validation());
        assert!(MetalGuardError::validation("frequency", "must be > 0").is_validation());
        assert!(MetalGuardError::hardware("fan", "write failed").is_hardware());
        assert!(MetalGuardError::Disabled.is_disabled());
        assert!(!MetalGuardError::Cancelled.is_validation());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            MetalGuardError::not_found("PWM channel", "fan").to_string(),
            "PWM channel fan not found"
        );
        assert_eq!(
            MetalGuardError::InvalidDutyCycle { value: 150 }.to_string(),
            "Invalid duty cycle: 150 (must be 0-100)"
        );
    }

    #[test]
    fn test_failed_keeps_source() {
        let err = MetalGuardError::TestFailed {
            test: "Power".into(),
            attempts: 3,
            source: Box::new(MetalGuardError::validation("voltage", "4.2 below 4.8")),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Invalid value for voltage: 4.2 below 4.8"));
    }
}
