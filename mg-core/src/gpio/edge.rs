//! Debounced edge detection
//!
//! The pin capability has no native interrupts, so edges are found by
//! polling. [`EdgeMonitor::run`] supervises one polling task per enabled
//! binding; each task samples its pin every millisecond and hands level
//! changes that match the configured edge to the debounce gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::pin::{Level, Pull};
use super::registry::PinRegistry;
use crate::constants::edge as edge_const;
use crate::error::{MetalGuardError, Result};

/// Edge that triggers the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    fn matches(self, new_level: Level) -> bool {
        match self {
            Edge::Rising => new_level == Level::High,
            Edge::Falling => new_level == Level::Low,
            Edge::Both => true,
        }
    }
}

/// Called with `(pin name, new level is high)`
pub type EdgeHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Edge binding configuration
#[derive(Clone)]
pub struct EdgeConfig {
    pub edge: Edge,
    pub debounce: Duration,
    pub pull: Pull,
    handler: Option<EdgeHandler>,
}

impl EdgeConfig {
    pub fn new<F>(edge: Edge, handler: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        Self {
            edge,
            debounce: edge_const::DEFAULT_DEBOUNCE,
            pull: Pull::Up,
            handler: Some(Arc::new(handler)),
        }
    }

    /// Binding with no handler; accepted events only update the trigger time
    pub fn without_handler(edge: Edge) -> Self {
        Self {
            edge,
            debounce: edge_const::DEFAULT_DEBOUNCE,
            pull: Pull::Up,
            handler: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_pull(mut self, pull: Pull) -> Self {
        self.pull = pull;
        self
    }
}

impl std::fmt::Debug for EdgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeConfig")
            .field("edge", &self.edge)
            .field("debounce", &self.debounce)
            .field("pull", &self.pull)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct BindingState {
    last_trigger: Option<Instant>,
    enabled: bool,
}

struct Binding {
    name: String,
    edge: Edge,
    debounce: Duration,
    handler: Option<EdgeHandler>,
    state: Mutex<BindingState>,
}

impl Binding {
    fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Debounce gate. The handler runs after the binding lock is released.
    fn gate(&self, level: Level) -> bool {
        let handler = {
            let mut state = self.state.lock();
            if !state.enabled {
                return false;
            }
            let now = Instant::now();
            if let Some(last) = state.last_trigger {
                if now.saturating_duration_since(last) < self.debounce {
                    return false;
                }
            }
            state.last_trigger = Some(now);
            self.handler.clone()
        };

        trace!(pin = %self.name, ?level, "Edge accepted");
        if let Some(handler) = handler {
            handler(&self.name, level.is_high());
        }
        true
    }
}

/// Polling edge detector over the pin registry
pub struct EdgeMonitor {
    registry: Arc<PinRegistry>,
    bindings: RwLock<HashMap<String, Arc<Binding>>>,
}

impl EdgeMonitor {
    pub fn new(registry: Arc<PinRegistry>) -> Self {
        Self {
            registry,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Configure the pin as input and register (or replace) its binding
    pub fn enable(&self, name: &str, config: EdgeConfig) -> Result<()> {
        self.registry.set_pull(name, config.pull)?;

        let binding = Arc::new(Binding {
            name: name.to_string(),
            edge: config.edge,
            debounce: config.debounce,
            handler: config.handler,
            state: Mutex::new(BindingState {
                last_trigger: None,
                enabled: true,
            }),
        });

        if let Some(previous) = self.bindings.write().insert(name.to_string(), binding) {
            previous.state.lock().enabled = false;
        }
        debug!(pin = %name, edge = ?config.edge, debounce_ms = config.debounce.as_millis() as u64, "Edge detection enabled");
        Ok(())
    }

    /// Mark a binding inactive; its polling task exits on its next sample
    pub fn disable(&self, name: &str) -> Result<()> {
        let binding = self
            .bindings
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetalGuardError::not_found("edge binding", name))?;
        binding.state.lock().enabled = false;
        debug!(pin = %name, "Edge detection disabled");
        Ok(())
    }

    /// Feed an observed level change through the debounce gate.
    /// Returns whether the event was accepted.
    pub fn trigger(&self, name: &str, level: Level) -> Result<bool> {
        let binding = self
            .bindings
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetalGuardError::not_found("edge binding", name))?;
        Ok(binding.gate(level))
    }

    /// Names of the enabled bindings
    pub fn bindings(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .read()
            .values()
            .filter(|b| b.is_enabled())
            .map(|b| b.name.clone())
            .collect();
        names.sort();
        names
    }

    fn enabled_bindings(&self) -> Vec<Arc<Binding>> {
        self.bindings
            .read()
            .values()
            .filter(|b| b.is_enabled())
            .cloned()
            .collect()
    }

    /// Supervise polling tasks until `token` is cancelled
    ///
    /// Bindings enabled after `run` started are picked up within one
    /// supervision interval, as is a binding whose polling task panicked.
    /// All polling tasks have exited when this returns.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!("Edge monitor started");
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut polling: HashMap<Id, String> = HashMap::new();

        loop {
            for binding in self.enabled_bindings() {
                if !polling.values().any(|name| *name == binding.name) {
                    let name = binding.name.clone();
                    let handle = tasks.spawn(poll_binding(self.registry.clone(), binding, token.clone()));
                    polling.insert(handle.id(), name);
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(finished) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let id = match finished {
                        Ok((id, ())) => id,
                        Err(e) => {
                            warn!(pin = ?polling.get(&e.id()), error = %e, "Edge polling task failed");
                            e.id()
                        }
                    };
                    polling.remove(&id);
                }
                _ = tokio::time::sleep(edge_const::SUPERVISE_INTERVAL) => {}
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("Edge monitor stopped");
        Ok(())
    }
}

async fn poll_binding(registry: Arc<PinRegistry>, binding: Arc<Binding>, token: CancellationToken) {
    let mut last = registry.read_level(&binding.name).ok();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(edge_const::POLL_INTERVAL) => {}
        }
        if !binding.is_enabled() {
            break;
        }

        match registry.read_level(&binding.name) {
            Ok(level) => {
                if last == Some(level) {
                    continue;
                }
                let had_baseline = last.is_some();
                last = Some(level);
                if had_baseline && binding.edge.matches(level) {
                    binding.gate(level);
                }
            }
            Err(MetalGuardError::Disabled) => break,
            Err(e) => trace!(pin = %binding.name, error = %e, "Edge poll read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::pin::MemoryPin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<PinRegistry>, Arc<MemoryPin>, EdgeMonitor) {
        let registry = Arc::new(PinRegistry::new(true));
        let pin = Arc::new(MemoryPin::new("button"));
        registry.configure("button", Some(pin.clone()), Pull::Float).unwrap();
        let monitor = EdgeMonitor::new(registry.clone());
        (registry, pin, monitor)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&str, bool) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &str, _: bool| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_enable_unknown_pin() {
        let (_registry, _pin, monitor) = setup();
        let err = monitor
            .enable("missing", EdgeConfig::without_handler(Edge::Both))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(monitor.disable("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_enable_applies_pull() {
        let (_registry, pin, monitor) = setup();
        monitor.enable("button", EdgeConfig::without_handler(Edge::Both)).unwrap();
        assert_eq!(pin.pull(), Pull::Up);
        assert_eq!(monitor.bindings(), vec!["button".to_string()]);
    }

    #[test]
    fn test_gate_debounces_burst() {
        let (_registry, _pin, monitor) = setup();
        let (count, handler) = counter();
        monitor
            .enable(
                "button",
                EdgeConfig::new(Edge::Both, handler).with_debounce(Duration::from_millis(10)),
            )
            .unwrap();

        // five toggles inside ~5ms
        for i in 0..5 {
            let level = Level::from(i % 2 == 0);
            monitor.trigger("button", level).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(count.load(Ordering::SeqCst) <= 2);
        assert!(count.load(Ordering::SeqCst) >= 1);

        std::thread::sleep(Duration::from_millis(15));
        assert!(monitor.trigger("button", Level::High).unwrap());
    }

    #[test]
    fn test_gate_ignores_disabled_binding() {
        let (_registry, _pin, monitor) = setup();
        let (count, handler) = counter();
        monitor
            .enable("button", EdgeConfig::new(Edge::Both, handler).with_debounce(Duration::ZERO))
            .unwrap();
        monitor.disable("button").unwrap();
        assert!(!monitor.trigger("button", Level::High).unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(monitor.bindings().is_empty());
    }

    #[test]
    fn test_edge_matching() {
        assert!(Edge::Rising.matches(Level::High));
        assert!(!Edge::Rising.matches(Level::Low));
        assert!(Edge::Falling.matches(Level::Low));
        assert!(Edge::Both.matches(Level::Low));
    }

    #[tokio::test]
    async fn test_polling_detects_rising_edge() {
        let (_registry, pin, monitor) = setup();
        let monitor = Arc::new(monitor);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        monitor
            .enable(
                "button",
                EdgeConfig::new(Edge::Rising, move |name: &str, high: bool| {
                    s.lock().push((name.to_string(), high));
                })
                .with_debounce(Duration::from_millis(5)),
            )
            .unwrap();

        let token = CancellationToken::new();
        let runner = {
            let monitor = monitor.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        pin.drive(Level::High);
        tokio::time::sleep(Duration::from_millis(30)).await;
        pin.drive(Level::Low);
        tokio::time::sleep(Duration::from_millis(30)).await;

        token.cancel();
        let started = Instant::now();
        runner.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        let seen = seen.lock();
        assert_eq!(seen.as_slice(), &[("button".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_panicking_handler_task_is_respawned() {
        let (_registry, pin, monitor) = setup();
        let monitor = Arc::new(monitor);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        monitor
            .enable(
                "button",
                EdgeConfig::new(Edge::Rising, move |_: &str, _: bool| {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("handler failure");
                    }
                })
                .with_debounce(Duration::ZERO),
            )
            .unwrap();

        let token = CancellationToken::new();
        let runner = {
            let monitor = monitor.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        pin.drive(Level::High);
        // the polling task dies in the handler; the supervisor starts a new one
        tokio::time::sleep(Duration::from_millis(60)).await;
        pin.drive(Level::Low);
        tokio::time::sleep(Duration::from_millis(30)).await;
        pin.drive(Level::High);
        tokio::time::sleep(Duration::from_millis(30)).await;

        token.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_returns_promptly_without_bindings() {
        let (_registry, _pin, monitor) = setup();
        let token = CancellationToken::new();
        token.cancel();
        monitor.run(token).await.unwrap();
    }
}
