//! Harness: admission control and external tool execution for the
//! auto-enhance engine.
//!
//! This crate sits between the scheduler and the outside world:
//! - Per-user quota bookkeeping (sliding request window, concurrent task
//!   count, cooldown) in [`rate_limiter`]
//! - The [`tools::ToolAdapter`] capability trait and the subprocess runner
//!   that every FFmpeg / Real-ESRGAN / Video2X invocation goes through
//! - A [`tools::ToolRegistry`] that knows which tools are enabled and present

pub mod rate_limiter;
pub mod tools;
