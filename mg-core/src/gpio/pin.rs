//! Pin capability: the single hardware boundary
//!
//! Everything above this module talks to pins through [`PinIo`]. Two
//! implementations are provided:
//!
//! - [`SysfsPin`]: Linux sysfs GPIO (`/sys/class/gpio/gpioN/{direction,value}`)
//! - [`MemoryPin`]: deterministic in-memory pin for simulation and tests

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::paths;
use crate::error::{MetalGuardError, Result};

/// Logical pin level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Pull resistor configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    #[default]
    Float,
    Up,
    Down,
}

/// Raw access to a single pin
pub trait PinIo: Send + Sync {
    /// Configure the pin as input with the given pull setting
    fn configure(&self, pull: Pull) -> Result<()>;

    /// Drive the pin to `level`
    fn write(&self, level: Level) -> Result<()>;

    /// Sample the pin
    fn read(&self) -> Result<Level>;
}

// ============================================================================
// In-memory pin
// ============================================================================

#[derive(Debug, Default)]
struct MemoryPinState {
    level: Level,
    pull: Pull,
    high_writes: u64,
    low_writes: u64,
    fail_writes: bool,
    fail_reads: bool,
    reject_pull: Option<Pull>,
}

/// In-memory pin with write counters and fault injection
#[derive(Debug, Default)]
pub struct MemoryPin {
    label: String,
    state: Mutex<MemoryPinState>,
}

impl MemoryPin {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(MemoryPinState::default()),
        }
    }

    /// Drive the pin from the outside, as a sensor would
    pub fn drive(&self, level: Level) {
        self.state.lock().level = level;
    }

    pub fn level(&self) -> Level {
        self.state.lock().level
    }

    pub fn pull(&self) -> Pull {
        self.state.lock().pull
    }

    pub fn high_writes(&self) -> u64 {
        self.state.lock().high_writes
    }

    pub fn low_writes(&self) -> u64 {
        self.state.lock().low_writes
    }

    pub fn write_count(&self) -> u64 {
        let state = self.state.lock();
        state.high_writes + state.low_writes
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make subsequent reads fail
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Reject a specific pull setting in `configure`
    pub fn reject_pull(&self, pull: Option<Pull>) {
        self.state.lock().reject_pull = pull;
    }
}

impl PinIo for MemoryPin {
    fn configure(&self, pull: Pull) -> Result<()> {
        let mut state = self.state.lock();
        if state.reject_pull == Some(pull) {
            return Err(MetalGuardError::hardware(
                &self.label,
                format!("pull {:?} not supported", pull),
            ));
        }
        state.pull = pull;
        Ok(())
    }

    fn write(&self, level: Level) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(MetalGuardError::hardware(&self.label, "injected write failure"));
        }
        state.level = level;
        match level {
            Level::High => state.high_writes += 1,
            Level::Low => state.low_writes += 1,
        }
        Ok(())
    }

    fn read(&self) -> Result<Level> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(MetalGuardError::hardware(&self.label, "injected read failure"));
        }
        Ok(state.level)
    }
}

// ============================================================================
// Sysfs pin
// ============================================================================

/// Linux sysfs GPIO line
///
/// Pull bias cannot be set through sysfs; it is recorded for diagnostics only
/// and must be configured in the device tree.
#[derive(Debug)]
pub struct SysfsPin {
    number: u32,
    base: PathBuf,
    is_output: AtomicBool,
}

impl SysfsPin {
    pub fn new(number: u32) -> Self {
        Self::with_base(number, paths::GPIO_BASE)
    }

    /// Use an alternate sysfs root (tests, chroots)
    pub fn with_base(number: u32, base: impl Into<PathBuf>) -> Self {
        Self {
            number,
            base: base.into(),
            is_output: AtomicBool::new(false),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    fn line_dir(&self) -> PathBuf {
        self.base.join(format!("gpio{}", self.number))
    }

    fn label(&self) -> String {
        format!("gpio{}", self.number)
    }

    /// Export the line if its directory is missing
    fn ensure_exported(&self) -> Result<PathBuf> {
        let dir = self.line_dir();
        if !dir.exists() {
            let export = self.base.join("export");
            fs::write(&export, self.number.to_string()).map_err(|e| {
                MetalGuardError::hardware(self.label(), format!("export failed: {}", e))
            })?;
        }
        Ok(dir)
    }

    fn write_attr(&self, dir: &Path, attr: &str, value: &str) -> Result<()> {
        fs::write(dir.join(attr), value).map_err(|e| {
            MetalGuardError::hardware(self.label(), format!("failed to write {}: {}", attr, e))
        })
    }
}

impl PinIo for SysfsPin {
    fn configure(&self, pull: Pull) -> Result<()> {
        let dir = self.ensure_exported()?;
        self.write_attr(&dir, "direction", "in")?;
        self.is_output.store(false, Ordering::SeqCst);
        if pull != Pull::Float {
            debug!(pin = %self.label(), ?pull, "sysfs GPIO cannot set pull bias; relying on device tree");
        }
        Ok(())
    }

    fn write(&self, level: Level) -> Result<()> {
        let dir = self.ensure_exported()?;
        if !self.is_output.load(Ordering::SeqCst) {
            self.write_attr(&dir, "direction", "out")?;
            self.is_output.store(true, Ordering::SeqCst);
        }
        self.write_attr(&dir, "value", if level.is_high() { "1" } else { "0" })
    }

    fn read(&self) -> Result<Level> {
        let path = self.line_dir().join("value");
        let content = fs::read_to_string(&path).map_err(|e| {
            MetalGuardError::hardware(self.label(), format!("failed to read value: {}", e))
        })?;
        match content.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(MetalGuardError::hardware(
                self.label(),
                format!("unexpected value '{}'", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pin_counts_writes() {
        let pin = MemoryPin::new("fan");
        pin.write(Level::High).unwrap();
        pin.write(Level::Low).unwrap();
        pin.write(Level::High).unwrap();
        assert_eq!(pin.high_writes(), 2);
        assert_eq!(pin.low_writes(), 1);
        assert_eq!(pin.read().unwrap(), Level::High);
    }

    #[test]
    fn test_memory_pin_fault_injection() {
        let pin = MemoryPin::new("case");
        pin.fail_writes(true);
        assert!(pin.write(Level::High).unwrap_err().is_hardware());
        pin.fail_reads(true);
        assert!(pin.read().is_err());
        pin.reject_pull(Some(Pull::Down));
        assert!(pin.configure(Pull::Down).is_err());
        assert!(pin.configure(Pull::Up).is_ok());
        assert_eq!(pin.pull(), Pull::Up);
    }

    #[test]
    fn test_sysfs_pin_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let line = dir.path().join("gpio17");
        fs::create_dir_all(&line).unwrap();
        fs::write(line.join("value"), "0\n").unwrap();

        let pin = SysfsPin::with_base(17, dir.path());
        pin.configure(Pull::Float).unwrap();
        assert_eq!(fs::read_to_string(line.join("direction")).unwrap(), "in");

        pin.write(Level::High).unwrap();
        assert_eq!(fs::read_to_string(line.join("direction")).unwrap(), "out");
        assert_eq!(pin.read().unwrap(), Level::High);

        pin.write(Level::Low).unwrap();
        assert_eq!(pin.read().unwrap(), Level::Low);
    }

    #[test]
    fn test_sysfs_pin_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let line = dir.path().join("gpio4");
        fs::create_dir_all(&line).unwrap();
        fs::write(line.join("value"), "maybe\n").unwrap();

        let pin = SysfsPin::with_base(4, dir.path());
        assert!(pin.read().unwrap_err().is_hardware());
    }
}
