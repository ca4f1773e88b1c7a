//! # Autoloom Supervisor
//!
//! Keeps long-running, non-scheduled processes alive: OS children or
//! capabilities run as background tasks. A periodic `check_all` pass detects
//! exits, probes health, samples resources and restarts crashed processes
//! with exponential backoff.

pub mod resources;
pub mod supervisor;

pub use supervisor::{CheckReport, ProcessSupervisor, spawn_supervisor};
