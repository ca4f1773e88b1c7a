//! Seams to external collaborators.

pub mod capability;
pub mod model;

pub use capability::{Capability, FnCapability};
pub use model::ModelClient;
