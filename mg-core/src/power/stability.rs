//! Power stability analytics
//!
//! Each tick takes a [`PowerState`] snapshot, pushes its voltage into the
//! sample window and recomputes the window statistics. Detections:
//!
//! - **Source failover**: the supplying source changed since the last tick
//! - **Power cycle**: availability came back after an outage; the outage is timed
//! - **Ripple**: peak-to-peak voltage over the window exceeds the threshold
//! - **Sag**: window minimum below the critical voltage
//! - **Current spike**: instantaneous current above the threshold
//!
//! Ripple and sag are reported once per excursion; spikes are reported per sample.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use super::ring::RingBuffer;
use super::{PowerSource, PowerState, PowerStateSource, StabilityEvent, StabilityEventKind, StabilityMetrics};
use crate::constants::{power, timing};
use crate::error::{MetalGuardError, Result};

pub type StabilityCallback = Arc<dyn Fn(&StabilityEvent) + Send + Sync>;

#[derive(Clone)]
pub struct StabilityConfig {
    /// Number of voltage samples kept for analysis
    pub sample_window: usize,
    pub interval: Duration,
    /// Peak-to-peak ripple threshold (V)
    pub ripple_threshold: f64,
    /// Current spike threshold (A)
    pub current_threshold: f64,
    pub critical_voltage: f64,
    on_event: Option<StabilityCallback>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            sample_window: power::SAMPLE_WINDOW,
            interval: timing::STABILITY_INTERVAL,
            ripple_threshold: power::RIPPLE_THRESHOLD,
            current_threshold: power::CURRENT_THRESHOLD,
            critical_voltage: power::CRITICAL_VOLTAGE,
            on_event: None,
        }
    }
}

impl StabilityConfig {
    pub fn with_window(mut self, samples: usize) -> Self {
        self.sample_window = samples;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&StabilityEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| MetalGuardError::InvalidConfig {
            field: format!("stability.{}", field),
            reason: reason.to_string(),
        };
        if self.sample_window == 0 {
            return Err(invalid("sample_window", "must hold at least one sample"));
        }
        if self.interval.is_zero() {
            return Err(invalid("interval", "must be greater than zero"));
        }
        if self.ripple_threshold <= 0.0 {
            return Err(invalid("ripple_threshold", "must be positive"));
        }
        if self.current_threshold <= 0.0 {
            return Err(invalid("current_threshold", "must be positive"));
        }
        Ok(())
    }
}

struct Inner {
    samples: RingBuffer<f64>,
    last_source: Option<PowerSource>,
    outage_started: Option<Instant>,
    ripple_active: bool,
    sag_active: bool,
    metrics: StabilityMetrics,
}

/// Power quality monitor over a [`PowerStateSource`]
pub struct PowerStabilityMonitor {
    source: Arc<dyn PowerStateSource>,
    config: StabilityConfig,
    inner: Mutex<Inner>,
}

impl PowerStabilityMonitor {
    pub fn new(source: Arc<dyn PowerStateSource>, config: StabilityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            inner: Mutex::new(Inner {
                samples: RingBuffer::new(config.sample_window),
                last_source: None,
                outage_started: None,
                ripple_active: false,
                sag_active: false,
                metrics: StabilityMetrics::default(),
            }),
            config,
        })
    }

    /// Copy of the current metrics
    pub fn metrics(&self) -> StabilityMetrics {
        self.inner.lock().metrics.clone()
    }

    /// Take one sample from the power source and update the metrics
    pub fn sample(&self) -> StabilityMetrics {
        let state = self.source.power_state();
        let (metrics, events) = self.analyze(&state);

        self.source.record_stability(metrics.clone());
        for event in &events {
            warn!(kind = ?event.kind, reading = event.reading, threshold = event.threshold, "{}", event.details);
        }
        if let Some(callback) = &self.config.on_event {
            for event in &events {
                callback(event);
            }
        }
        metrics
    }

    fn analyze(&self, state: &PowerState) -> (StabilityMetrics, Vec<StabilityEvent>) {
        let now = Utc::now();
        let event = |kind, reading, threshold, source, details: String| StabilityEvent {
            timestamp: now,
            kind,
            reading,
            threshold,
            source,
            details,
        };

        let mut events = Vec::new();
        let mut inner = self.inner.lock();
        let cfg = &self.config;

        if let Some(source) = state.current_source {
            if let Some(previous) = inner.last_source {
                if previous != source {
                    events.push(event(
                        StabilityEventKind::SourceFailover,
                        0.0,
                        0.0,
                        Some(source),
                        format!("Power source changed from {} to {}", previous, source),
                    ));
                }
            }
            inner.last_source = Some(source);
        }

        let powered = state.any_available();
        if !powered {
            if inner.outage_started.is_none() {
                inner.outage_started = Some(Instant::now());
            }
        } else if let Some(started) = inner.outage_started.take() {
            let duration = started.elapsed();
            inner.metrics.power_cycles += 1;
            inner.metrics.last_cycle_duration = duration;
            events.push(event(
                StabilityEventKind::PowerCycle,
                duration.as_secs_f64() * 1000.0,
                0.0,
                state.current_source,
                format!("Power cycle detected lasting {:?}", duration),
            ));
        }

        inner.samples.push(state.voltage);
        let (min, max, sum) = inner.samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );
        let count = inner.samples.len() as f64;
        let ripple = max - min;
        inner.metrics.min_voltage = min;
        inner.metrics.max_voltage = max;
        inner.metrics.voltage_ripple = ripple;
        inner.metrics.average_voltage = sum / count;

        let rippling = ripple > cfg.ripple_threshold;
        if rippling && !inner.ripple_active {
            events.push(event(
                StabilityEventKind::VoltageRipple,
                ripple,
                cfg.ripple_threshold,
                state.current_source,
                format!("Voltage ripple {:.2}V exceeds threshold {:.2}V", ripple, cfg.ripple_threshold),
            ));
        }
        inner.ripple_active = rippling;

        let sagging = min < cfg.critical_voltage;
        if sagging && !inner.sag_active {
            events.push(event(
                StabilityEventKind::VoltageSag,
                min,
                cfg.critical_voltage,
                state.current_source,
                format!("Voltage sag to {:.2}V below critical threshold {:.2}V", min, cfg.critical_voltage),
            ));
        }
        inner.sag_active = sagging;

        let current = state.current();
        if current > cfg.current_threshold {
            inner.metrics.current_spikes += 1;
            if current > inner.metrics.max_current_spike {
                inner.metrics.max_current_spike = current;
            }
            events.push(event(
                StabilityEventKind::CurrentSpike,
                current,
                cfg.current_threshold,
                state.current_source,
                format!("Current spike {:.2}A exceeds threshold {:.2}A", current, cfg.current_threshold),
            ));
        }

        let mut warnings = Vec::new();
        if rippling {
            warnings.push(format!("Voltage ripple {:.2}V exceeds {:.2}V", ripple, cfg.ripple_threshold));
        }
        if sagging {
            warnings.push(format!("Voltage sag to {:.2}V", min));
        }
        if inner.outage_started.is_some() {
            warnings.push("No power source available".to_string());
        }
        inner.metrics.warnings = warnings;
        inner.metrics.updated_at = Some(now);

        trace!(ripple, min, max, current, "Stability sample");
        (inner.metrics.clone(), events)
    }

    /// Sample until cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            window = self.config.sample_window,
            "Power stability monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sample();
                }
            }
        }
        info!("Power stability monitor stopped");
        Ok(())
    }
}
