//! # Autoloom Core
//!
//! Shared vocabulary for every Autoloom crate: the task/job/process data
//! model, the capability and language-model seams, errors, configuration and
//! the clock the schedulers read time from.

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AutoloomConfig;
pub use error::{AutoloomError, GraphError, Result};
pub use traits::{Capability, FnCapability, ModelClient};
