//! Irrigation controller: zone outputs behind a safety relay, scheduled
//! multi-step watering programs and a crash-safe run-state record.

pub mod config;
pub mod error;
pub mod output;
pub mod program;
pub mod programs;
pub mod run_state;
pub mod schedule;
pub mod scheduler;
pub mod web;
pub mod zones;
