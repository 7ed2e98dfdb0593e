//! Core domain types and configuration for the auto-enhance media
//! orchestration engine.
//!
//! Everything here is plain data: tasks and their lifecycle rules, pipeline
//! stage declarations, operation requests coming from the front-end, load
//! samples, and the TOML configuration surface. No I/O beyond reading the
//! config file.

pub mod config;
pub mod types;
