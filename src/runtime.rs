//! Runtime glue that wires configs, events, fatal error handling, progress
//! reporting, telemetry, and runner orchestration.

pub mod config;
pub mod events;
pub mod fatal;
pub mod handler;
pub mod monitor;
pub mod progress;
pub mod runner;
pub mod telemetry;
