//! State store implementations
//!
//! [`JsonFileStateStore`] keeps one pretty-printed state file and one
//! append-only JSON-lines event log per device:
//!
//! ```text
//! <dir>/<device>.state.json
//! <dir>/<device>.events.jsonl
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::{StateStore, TamperEvent, TamperState};
use crate::error::{MetalGuardError, Result};

/// In-memory store; keeps every logged event for inspection
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, TamperState>>,
    events: Mutex<Vec<TamperEvent>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TamperEvent> {
        self.events.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn save_state(&self, device_id: &str, state: &TamperState) -> Result<()> {
        self.states.lock().insert(device_id.to_string(), *state);
        Ok(())
    }

    fn load_state(&self, device_id: &str) -> Result<TamperState> {
        self.states
            .lock()
            .get(device_id)
            .copied()
            .ok_or_else(|| MetalGuardError::not_found("tamper state", device_id))
    }

    fn log_event(&self, device_id: &str, kind: &str, details: serde_json::Value) -> Result<()> {
        self.events.lock().push(TamperEvent {
            device_id: device_id.to_string(),
            kind: kind.to_string(),
            timestamp: Utc::now(),
            details,
        });
        Ok(())
    }
}

/// Directory-backed JSON store
#[derive(Debug)]
pub struct JsonFileStateStore {
    dir: PathBuf,
    /// Serializes appends to the event logs
    log_lock: Mutex<()>,
}

impl JsonFileStateStore {
    /// Open (and create if needed) the store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| MetalGuardError::FileWrite {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir,
            log_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn device_file(&self, device_id: &str, suffix: &str) -> Result<PathBuf> {
        if device_id.is_empty()
            || device_id.contains(['/', '\\'])
            || device_id.starts_with('.')
        {
            return Err(MetalGuardError::store(format!("invalid device id '{}'", device_id)));
        }
        Ok(self.dir.join(format!("{}.{}", device_id, suffix)))
    }

    /// Every event logged for `device_id`, oldest first
    pub fn read_events(&self, device_id: &str) -> Result<Vec<TamperEvent>> {
        let path = self.device_file(device_id, "events.jsonl")?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).map_err(|e| MetalGuardError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(MetalGuardError::from))
            .collect()
    }
}

impl StateStore for JsonFileStateStore {
    fn save_state(&self, device_id: &str, state: &TamperState) -> Result<()> {
        let path = self.device_file(device_id, "state.json")?;
        let json = serde_json::to_string_pretty(state)?;

        // Write to a temp file then rename so readers never see a torn file
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| MetalGuardError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        file.write_all(json.as_bytes()).map_err(|e| MetalGuardError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        drop(file);
        fs::rename(&temp_path, &path).map_err(|e| MetalGuardError::FileWrite {
            path: path.clone(),
            source: e,
        })?;
        Ok(())
    }

    fn load_state(&self, device_id: &str) -> Result<TamperState> {
        let path = self.device_file(device_id, "state.json")?;
        if !path.exists() {
            return Err(MetalGuardError::not_found("tamper state", device_id));
        }
        let contents = fs::read_to_string(&path).map_err(|e| MetalGuardError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let state = serde_json::from_str(&contents)?;
        debug!(device = %device_id, ?path, "Loaded tamper state");
        Ok(state)
    }

    fn log_event(&self, device_id: &str, kind: &str, details: serde_json::Value) -> Result<()> {
        let path = self.device_file(device_id, "events.jsonl")?;
        let event = TamperEvent {
            device_id: device_id.to_string(),
            kind: kind.to_string(),
            timestamp: Utc::now(),
            details,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let _guard = self.log_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MetalGuardError::FileWrite {
                path: path.clone(),
                source: e,
            })?;
        file.write_all(line.as_bytes()).map_err(|e| MetalGuardError::FileWrite {
            path: path.clone(),
            source: e,
        })?;
        Ok(())
    }
}
