//! Runtime glue that wires configs, hooks, progress tracking, telemetry, and
//! runner orchestration.

pub mod config;
pub mod fatal;
pub(crate) mod hooks;
pub mod progress;
pub mod runner;
pub mod telemetry;
