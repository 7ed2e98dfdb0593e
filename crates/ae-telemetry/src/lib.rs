//! Telemetry for the auto-enhance daemon.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: thread-safe counters, gauges and histograms with Prometheus
//!   text export, fed by the scheduler

pub mod logging;
pub mod metrics;
