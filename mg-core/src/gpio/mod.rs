//! GPIO layer
//!
//! - [`pin`]: the [`PinIo`] capability and its sysfs / in-memory backings
//! - [`registry`]: named pins with cached level and pull
//! - [`pwm`]: software PWM generation on registry pins
//! - [`edge`]: debounced polling edge detection

pub mod edge;
pub mod pin;
pub mod pwm;
pub mod registry;

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;

pub use edge::{Edge, EdgeConfig, EdgeHandler, EdgeMonitor};
pub use pin::{Level, MemoryPin, PinIo, Pull, SysfsPin};
pub use pwm::{PwmConfig, PwmEngine};
pub use registry::PinRegistry;

/// Registry, PWM engine and edge monitor sharing one set of pins
pub struct GpioController {
    registry: Arc<PinRegistry>,
    pwm: Arc<PwmEngine>,
    edges: Arc<EdgeMonitor>,
}

impl GpioController {
    pub fn new(simulation: bool) -> Self {
        let registry = Arc::new(PinRegistry::new(simulation));
        Self {
            pwm: Arc::new(PwmEngine::new(registry.clone())),
            edges: Arc::new(EdgeMonitor::new(registry.clone())),
            registry,
        }
    }

    pub fn registry(&self) -> Arc<PinRegistry> {
        self.registry.clone()
    }

    pub fn pwm(&self) -> Arc<PwmEngine> {
        self.pwm.clone()
    }

    pub fn edges(&self) -> Arc<EdgeMonitor> {
        self.edges.clone()
    }

    /// Stop all PWM generation, then drive every pin low and disable the registry
    pub async fn close(&self) -> Result<()> {
        if let Err(e) = self.pwm.close_all().await {
            warn!(error = %e, "Failed to stop PWM channels cleanly");
        }
        self.registry.close()?;
        info!("GPIO controller closed");
        Ok(())
    }
}
