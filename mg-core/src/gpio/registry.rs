//! Named pin registry
//!
//! Owns every configured pin, its pull setting and last known level. The map
//! lock is only taken to insert or look up an entry; reads and writes then go
//! through the entry's own lock so independent pins never contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::pin::{Level, PinIo, Pull};
use crate::error::{MetalGuardError, Result};

#[derive(Debug, Clone, Copy)]
struct PinState {
    pull: Pull,
    level: Level,
}

struct PinEntry {
    backing: Option<Arc<dyn PinIo>>,
    state: Mutex<PinState>,
}

/// Registry of named pins
pub struct PinRegistry {
    simulation: bool,
    enabled: AtomicBool,
    pins: RwLock<HashMap<String, Arc<PinEntry>>>,
}

impl PinRegistry {
    /// Create a registry. In simulation mode pins may have no backing capability.
    pub fn new(simulation: bool) -> Self {
        Self {
            simulation,
            enabled: AtomicBool::new(true),
            pins: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(MetalGuardError::Disabled)
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<PinEntry>> {
        self.ensure_enabled()?;
        self.pins
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetalGuardError::not_found("pin", name))
    }

    /// Configure (or reconfigure) a pin as input with the given pull
    pub fn configure(&self, name: &str, backing: Option<Arc<dyn PinIo>>, pull: Pull) -> Result<()> {
        self.ensure_enabled()?;

        if backing.is_none() && !self.simulation {
            return Err(MetalGuardError::config(format!(
                "pin {} requires a backing capability outside simulation mode",
                name
            )));
        }

        if let Some(pin) = &backing {
            pin.configure(pull).map_err(|e| {
                MetalGuardError::config(format!("failed to configure pin {}: {}", name, e))
            })?;
        }

        let entry = Arc::new(PinEntry {
            backing,
            state: Mutex::new(PinState { pull, level: Level::Low }),
        });
        self.pins.write().insert(name.to_string(), entry);
        debug!(pin = %name, ?pull, "Pin configured");
        Ok(())
    }

    /// Change the pull setting of an already configured pin
    pub fn set_pull(&self, name: &str, pull: Pull) -> Result<()> {
        let entry = self.entry(name)?;
        let mut state = entry.state.lock();
        if let Some(pin) = &entry.backing {
            pin.configure(pull).map_err(|e| {
                MetalGuardError::config(format!("failed to configure pin {}: {}", name, e))
            })?;
        }
        state.pull = pull;
        Ok(())
    }

    /// Drive a pin. The cached level only changes once the hardware write succeeded.
    pub fn set_level(&self, name: &str, level: Level) -> Result<()> {
        let entry = self.entry(name)?;
        let mut state = entry.state.lock();
        if let Some(pin) = &entry.backing {
            pin.write(level)?;
        }
        state.level = level;
        Ok(())
    }

    /// Read a pin, sampling the hardware when it is backed
    pub fn read_level(&self, name: &str) -> Result<Level> {
        let entry = self.entry(name)?;
        let mut state = entry.state.lock();
        if let Some(pin) = &entry.backing {
            state.level = pin.read()?;
        }
        Ok(state.level)
    }

    pub fn is_high(&self, name: &str) -> Result<bool> {
        Ok(self.read_level(name)?.is_high())
    }

    pub fn pull(&self, name: &str) -> Result<Pull> {
        let entry = self.entry(name)?;
        let pull = entry.state.lock().pull;
        Ok(pull)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pins.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pins.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drive every pin low and disable the registry
    ///
    /// Returns the last error seen while driving pins; the registry is
    /// disabled regardless.
    pub fn close(&self) -> Result<()> {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let entries: Vec<(String, Arc<PinEntry>)> = self
            .pins
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        let mut last_err = None;
        for (name, entry) in entries {
            let mut state = entry.state.lock();
            if let Some(pin) = &entry.backing {
                if let Err(e) = pin.write(Level::Low) {
                    warn!(pin = %name, error = %e, "Failed to drive pin low on close");
                    last_err = Some(e);
                    continue;
                }
            }
            state.level = Level::Low;
        }

        info!("GPIO registry closed");
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::pin::MemoryPin;

    #[test]
    fn test_configure_and_roundtrip_simulated() {
        let registry = PinRegistry::new(true);
        registry.configure("led", None, Pull::Float).unwrap();
        assert_eq!(registry.read_level("led").unwrap(), Level::Low);
        registry.set_level("led", Level::High).unwrap();
        assert!(registry.is_high("led").unwrap());
    }

    #[test]
    fn test_backed_pin_reads_hardware() {
        let registry = PinRegistry::new(false);
        let pin = Arc::new(MemoryPin::new("case"));
        registry.configure("case", Some(pin.clone()), Pull::Up).unwrap();
        assert_eq!(pin.pull(), Pull::Up);

        pin.drive(Level::High);
        assert!(registry.is_high("case").unwrap());
    }

    #[test]
    fn test_missing_backing_outside_simulation() {
        let registry = PinRegistry::new(false);
        let err = registry.configure("led", None, Pull::Float).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_rejected_pull_is_configuration_error() {
        let registry = PinRegistry::new(false);
        let pin = Arc::new(MemoryPin::new("x"));
        pin.reject_pull(Some(Pull::Down));
        let err = registry.configure("x", Some(pin), Pull::Down).unwrap_err();
        assert!(err.is_configuration());
        assert!(!registry.contains("x"));
    }

    #[test]
    fn test_unknown_pin() {
        let registry = PinRegistry::new(true);
        assert!(registry.set_level("nope", Level::High).unwrap_err().is_not_found());
        assert!(registry.read_level("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_failed_write_keeps_cached_level() {
        let registry = PinRegistry::new(false);
        let pin = Arc::new(MemoryPin::new("out"));
        registry.configure("out", Some(pin.clone()), Pull::Float).unwrap();
        pin.fail_writes(true);
        assert!(registry.set_level("out", Level::High).unwrap_err().is_hardware());
        pin.fail_writes(false);
        assert_eq!(registry.read_level("out").unwrap(), Level::Low);
    }

    #[test]
    fn test_close_drives_low_and_disables() {
        let registry = PinRegistry::new(false);
        let pin = Arc::new(MemoryPin::new("out"));
        registry.configure("out", Some(pin.clone()), Pull::Float).unwrap();
        registry.set_level("out", Level::High).unwrap();

        registry.close().unwrap();
        assert_eq!(pin.level(), Level::Low);
        assert!(registry.set_level("out", Level::High).unwrap_err().is_disabled());
        assert!(registry.configure("new", None, Pull::Float).unwrap_err().is_disabled());
        // second close is a no-op
        registry.close().unwrap();
    }

    #[test]
    fn test_identical_behavior_with_and_without_backing() {
        let simulated = PinRegistry::new(true);
        simulated.configure("a", None, Pull::Down).unwrap();
        simulated.configure("b", Some(Arc::new(MemoryPin::new("b"))), Pull::Down).unwrap();

        for name in ["a", "b"] {
            simulated.set_level(name, Level::High).unwrap();
            assert_eq!(simulated.read_level(name).unwrap(), Level::High);
            assert_eq!(simulated.pull(name).unwrap(), Pull::Down);
        }
        assert_eq!(simulated.names(), vec!["a".to_string(), "b".to_string()]);
    }
}
