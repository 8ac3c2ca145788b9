//! Durable "is a program running" record.
//!
//! The store keeps an in-memory belief next to the file on disk. Every
//! `load` reconciles the two, and every `save` writes through a temporary
//! file, renames it into place and reads it back.
//!
//! Reconciliation favours a false "still running" over silently abandoning
//! a program: if memory says running and disk says idle, memory wins and is
//! written back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::StoreError;

pub const RUN_STATE_FILE: &str = "program_state.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub program_running: bool,
    pub current_program_id: Option<String>,
}

impl RunState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn running(program_id: impl Into<String>) -> Self {
        Self {
            program_running: true,
            current_program_id: Some(program_id.into()),
        }
    }

    /// True when `program_id` currently owns the system.
    pub fn is_owned_by(&self, program_id: &str) -> bool {
        self.program_running && self.current_program_id.as_deref() == Some(program_id)
    }
}

/// On-disk shape. Both fields optional so a half-written record still parses
/// far enough to be reconciled.
#[derive(Deserialize)]
struct StoredRunState {
    program_running: Option<bool>,
    current_program_id: Option<String>,
}

pub struct RunStateStore {
    path: PathBuf,
    memory: Mutex<RunState>,
}

impl RunStateStore {
    /// Open the store at `<data_dir>/program_state.json`. Nothing is read
    /// until the first `load`; the in-memory belief starts idle.
    pub fn open(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(RUN_STATE_FILE),
            memory: Mutex::new(RunState::idle()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The in-memory belief without touching the disk.
    pub fn current(&self) -> RunState {
        self.memory().clone()
    }

    /// Read the persisted state and reconcile it with the in-memory belief.
    ///
    /// Never fails: a missing or corrupt file falls back to the in-memory
    /// belief (idle unless a program is known to be running) and re-persists
    /// it.
    pub fn load(&self) -> RunState {
        let believed = self.current();

        let stored = match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<StoredRunState>(&text) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(path = %self.path.display(), "run state corrupt ({e}), resetting");
                    return self.repersist(believed);
                }
            },
            Err(e) => {
                info!(path = %self.path.display(), "run state unreadable ({e}), creating");
                return self.repersist(believed);
            }
        };

        let disk_running = stored.program_running.unwrap_or(false);

        if believed.program_running && !disk_running {
            warn!(
                program = ?believed.current_program_id,
                "run state on disk says idle while a program is known to run; keeping running"
            );
            return self.repersist(believed);
        }

        let next = match (disk_running, stored.current_program_id) {
            (true, Some(id)) => RunState::running(id),
            (true, None) => {
                warn!("run state anomaly: program running but id missing");
                RunState {
                    program_running: true,
                    current_program_id: believed.current_program_id.clone(),
                }
            }
            (false, Some(id)) => {
                warn!(program = %id, "run state anomaly: id present while idle; treating as running");
                RunState::running(id)
            }
            (false, None) => RunState::idle(),
        };

        if next != believed {
            info!(
                running = next.program_running,
                program = ?next.current_program_id,
                "run state updated from disk"
            );
        }
        *self.memory() = next.clone();
        next
    }

    fn repersist(&self, state: RunState) -> RunState {
        if let Err(e) = self.save(&state) {
            error!("failed to re-persist run state: {e}");
        }
        state
    }

    /// Persist `state` and adopt it as the in-memory belief.
    ///
    /// Writes `<file>.tmp`, renames it over the record, then reads the
    /// record back. A mismatch on read-back triggers exactly one direct
    /// overwrite; stronger guarantees are the caller's business.
    pub fn save(&self, state: &RunState) -> Result<(), StoreError> {
        *self.memory() = state.clone();

        let body = serde_json::to_string(state)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &body).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        if self.read_back().as_ref() != Some(state) {
            warn!(path = %self.path.display(), "run state read-back mismatch, rewriting");
            fs::write(&self.path, &body).map_err(|e| StoreError::io(&self.path, e))?;
        }
        Ok(())
    }

    fn read_back(&self) -> Option<RunState> {
        let text = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
