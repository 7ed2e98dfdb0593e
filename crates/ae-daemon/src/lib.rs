//! Task orchestration for the auto-enhance engine: planning requests into
//! stage pipelines, admitting and scheduling tasks under rate and resource
//! limits, and tracking every task until it reaches a terminal state.

pub mod daemon;
pub mod monitor;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod store;
