//! Fan duty curve
//!
//! Maps the hottest CPU/GPU reading to a fan duty:
//!
//! | Temperature                 | Duty                          |
//! |-----------------------------|-------------------------------|
//! | `< warning / 2`             | low                           |
//! | `[warning / 2, warning)`    | low → medium (linear)         |
//! | `[warning, critical)`       | medium → high (linear)        |
//! | `>= critical`               | 100                           |
//!
//! The interpolated value is quantized down to `step` percent so sensor
//! jitter does not churn the PWM channel.

use serde::{Deserialize, Serialize};

use crate::constants::{fan, pwm};
use crate::error::{MetalGuardError, Result};

/// Warning/critical pair for one zone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f32,
    pub critical: f32,
}

impl Thresholds {
    pub fn new(warning: f32, critical: f32) -> Self {
        Self { warning, critical }
    }

    pub fn validate(&self, field: &str) -> Result<()> {
        if self.warning >= self.critical {
            return Err(MetalGuardError::InvalidConfig {
                field: field.to_string(),
                reason: format!(
                    "warning {}°C must be below critical {}°C",
                    self.warning, self.critical
                ),
            });
        }
        Ok(())
    }
}

/// Baseline duties and quantization step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyCurve {
    pub low: u8,
    pub medium: u8,
    pub high: u8,
    /// Quantization step in percent; 0 disables quantization
    pub step: u8,
}

impl Default for DutyCurve {
    fn default() -> Self {
        Self {
            low: fan::LOW,
            medium: fan::MEDIUM,
            high: fan::HIGH,
            step: fan::DUTY_STEP,
        }
    }
}

impl DutyCurve {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("low", self.low), ("medium", self.medium), ("high", self.high)] {
            if value > pwm::MAX_DUTY_CYCLE {
                return Err(MetalGuardError::InvalidConfig {
                    field: format!("fan.{}", field),
                    reason: format!("{} exceeds 100%", value),
                });
            }
        }
        if self.low > self.medium || self.medium > self.high {
            return Err(MetalGuardError::InvalidConfig {
                field: "fan".to_string(),
                reason: "baselines must satisfy low <= medium <= high".to_string(),
            });
        }
        Ok(())
    }

    /// Duty for `temp` under `thresholds`
    pub fn duty_for(&self, temp: f32, thresholds: &Thresholds) -> u8 {
        if temp >= thresholds.critical {
            return pwm::MAX_DUTY_CYCLE;
        }

        let half_warning = thresholds.warning / 2.0;
        let raw = if temp >= thresholds.warning {
            lerp(temp, thresholds.warning, thresholds.critical, self.medium, self.high)
        } else if temp >= half_warning {
            lerp(temp, half_warning, thresholds.warning, self.low, self.medium)
        } else {
            return self.low;
        };

        self.quantize(raw)
    }

    fn quantize(&self, raw: f32) -> u8 {
        let duty = raw.clamp(0.0, pwm::MAX_DUTY_CYCLE as f32) as u8;
        if self.step == 0 {
            return duty;
        }
        ((duty / self.step) * self.step).max(self.low)
    }
}

/// Linear interpolation of `temp` in `[from, to)` onto `[lo, hi]`
fn lerp(temp: f32, from: f32, to: f32, lo: u8, hi: u8) -> f32 {
    let range = to - from;
    if range.abs() < f32::EPSILON {
        return lo as f32;
    }
    let ratio = (temp - from) / range;
    lo as f32 + ratio * (hi as f32 - lo as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Thresholds = Thresholds {
        warning: 70.0,
        critical: 80.0,
    };

    #[test]
    fn test_bands() {
        let curve = DutyCurve::default();
        assert_eq!(curve.duty_for(20.0, &T), 25);
        assert_eq!(curve.duty_for(34.9, &T), 25);
        // 40°C is just above warning/2: 28.6% quantizes down to 25
        assert_eq!(curve.duty_for(40.0, &T), 25);
        assert_eq!(curve.duty_for(52.5, &T), 35);
        assert_eq!(curve.duty_for(70.0, &T), 50);
        assert_eq!(curve.duty_for(75.0, &T), 75);
        assert_eq!(curve.duty_for(80.0, &T), 100);
        assert_eq!(curve.duty_for(120.0, &T), 100);
    }

    #[test]
    fn test_unquantized() {
        let curve = DutyCurve {
            step: 0,
            ..DutyCurve::default()
        };
        assert_eq!(curve.duty_for(40.0, &T), 28);
        assert_eq!(curve.duty_for(77.5, &T), 87);
    }

    #[test]
    fn test_monotonic() {
        let curve = DutyCurve::default();
        let mut last = 0;
        for tenths in 0..1000 {
            let duty = curve.duty_for(tenths as f32 / 10.0, &T);
            assert!(duty >= last, "duty dropped at {}", tenths as f32 / 10.0);
            last = duty;
        }
    }

    #[test]
    fn test_validation() {
        assert!(DutyCurve::default().validate().is_ok());
        let bad = DutyCurve {
            high: 120,
            ..DutyCurve::default()
        };
        assert!(bad.validate().unwrap_err().is_configuration());
        let inverted = DutyCurve {
            low: 60,
            ..DutyCurve::default()
        };
        assert!(inverted.validate().is_err());
        assert!(Thresholds::new(80.0, 70.0).validate("cpu").is_err());
    }
}
