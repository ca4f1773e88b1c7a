//! Autoloom orchestration: intent parsing, dry-run plans and the
//! [`Orchestrator`] facade tying scheduler, supervisor and storage together.

pub mod intent;
pub mod orchestrator;
pub mod plan;

pub use intent::{IntentParser, IntentSource, ModelSource, OpenAiCompatibleClient, PatternSource};
pub use orchestrator::Orchestrator;
pub use plan::{PlanStep, PlanSummary};
