//! # Autoloom Scheduler
//!
//! Turns validated workflows into scheduled jobs and runs them:
//! - `registry`: task-type name → capability
//! - `resolver`: graph validation and ready batches
//! - `cron` / `trigger`: fire-time computation
//! - `engine`: the tick loop, worker pool, retries and history

pub mod cron;
pub mod engine;
pub mod history;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod trigger;

pub use cron::{CronSchedule, next_run_from_cron};
pub use engine::{JobStatusView, SchedulerEngine, TickReport, spawn_scheduler};
pub use history::ExecutionHistory;
pub use registry::TaskRegistry;
pub use resolver::{ResolveOptions, resolve, resolve_with};
pub use retry::RetryPolicy;
pub use store::JobStore;
