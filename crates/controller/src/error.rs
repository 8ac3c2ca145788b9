//! Typed errors for every controller operation.
//!
//! Persistence doubts and run-state anomalies are deliberately absent: they
//! are logged as warnings where they happen and never abort an operation.

use thiserror::Error;

/// An output pin could not be claimed or written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("gpio {pin}: {detail}")]
pub struct HardwareError {
    pub pin: u8,
    pub detail: String,
}

impl HardwareError {
    pub fn new(pin: u8, detail: impl Into<String>) -> Self {
        Self {
            pin,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoneError {
    #[error("zone {0} not found")]
    NotFound(u8),
    #[error("a program is running; manual zone control is disabled")]
    ProgramOwnsSystem,
    #[error("invalid duration {minutes} min (allowed 1..={max})")]
    InvalidDuration { minutes: u32, max: u32 },
    #[error("maximum number of active zones ({max}) reached")]
    CapacityExceeded { max: usize },
    #[error("hardware fault: {0}")]
    HardwareFault(#[from] HardwareError),
}

/// Failure reading or writing one of the persisted JSON files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Program CRUD failures.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("program {0} not found")]
    NotFound(String),
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

/// Reasons a program execution attempt was refused or did not complete.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("program {0} not found")]
    NotFound(String),
    #[error("program {0} is already running")]
    AlreadyRunning(String),
    #[error("program has no steps")]
    InvalidSteps,
    #[error("{failed} step(s) could not start their zone")]
    ZoneFault { failed: usize },
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}
