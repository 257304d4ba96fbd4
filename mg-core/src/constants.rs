//! Constants and configuration defaults for MetalGuard
//!
//! Centralizes all magic numbers and configuration defaults.
//! Component configs take their `Default` values from here.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Base path for the sysfs GPIO interface
    pub const GPIO_BASE: &str = "/sys/class/gpio";

    /// Default directory for the JSON tamper state store
    pub const STATE_DIR: &str = "/var/lib/metalguard";

    /// Default device settings file
    pub const SETTINGS_FILE: &str = "/etc/metalguard/device.json";
}

/// Software PWM parameters
pub mod pwm {
    /// Frequency used when a channel is configured with 0 Hz
    pub const DEFAULT_FREQUENCY_HZ: u32 = 25_000;

    /// Highest frequency the software generator accepts
    pub const MAX_FREQUENCY_HZ: u32 = 1_000_000;

    /// Maximum duty cycle in percent
    pub const MAX_DUTY_CYCLE: u8 = 100;

    pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
}

/// Edge detection parameters
pub mod edge {
    use super::Duration;

    /// Debounce applied when none is configured
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

    /// Interval between pin reads in the polling tasks
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

    /// How often the supervisor picks up newly enabled bindings
    pub const SUPERVISE_INTERVAL: Duration = Duration::from_millis(10);
}

/// Temperature thresholds in Celsius
pub mod temperature {
    /// Sysfs thermal zones report millidegrees
    pub const MILLIDEGREE_DIVISOR: f32 = 1000.0;

    /// CPU/GPU warning threshold
    pub const WARNING: f32 = 70.0;

    /// CPU/GPU critical threshold
    pub const CRITICAL: f32 = 80.0;

    pub const AMBIENT_WARNING: f32 = 45.0;
    pub const AMBIENT_CRITICAL: f32 = 50.0;
}

/// Fan duty baselines in percent
pub mod fan {
    pub const LOW: u8 = 25;
    pub const MEDIUM: u8 = 50;
    pub const HIGH: u8 = 100;

    /// Computed duties are quantized down to this step
    pub const DUTY_STEP: u8 = 5;
}

/// Power thresholds
pub mod power {
    /// Voltage at or below which the supply is critical (V)
    pub const CRITICAL_VOLTAGE: f64 = 4.5;

    /// Battery level at or below which running on battery is critical (%)
    pub const CRITICAL_BATTERY_LEVEL: f64 = 10.0;

    /// Default peak-to-peak ripple threshold (V)
    pub const RIPPLE_THRESHOLD: f64 = 0.5;

    /// Default current spike threshold (A)
    pub const CURRENT_THRESHOLD: f64 = 3.0;

    /// Default number of voltage samples kept for analysis
    pub const SAMPLE_WINDOW: usize = 1000;
}

/// Diagnostics defaults
pub mod diagnostics {
    use super::Duration;

    pub const RETRIES: u32 = 3;
    pub const RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Minimum acceptable supply voltage for a 5V system
    pub const MIN_VOLTAGE: f64 = 4.8;

    pub const TEMP_RANGE: (f32, f32) = (-10.0, 50.0);

    pub const LOAD_TEST_TIME: Duration = Duration::from_secs(30);
}

/// Timing parameters for the periodic monitors
pub mod timing {
    use super::Duration;

    pub const THERMAL_INTERVAL: Duration = Duration::from_secs(1);
    pub const POWER_INTERVAL: Duration = Duration::from_secs(1);
    pub const STABILITY_INTERVAL: Duration = Duration::from_millis(100);
    pub const TAMPER_INTERVAL: Duration = Duration::from_millis(100);

    /// Settling time after energizing a load bank
    pub const LOAD_SETTLE: Duration = Duration::from_millis(100);
    pub const LOAD_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
}
