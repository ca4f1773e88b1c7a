//! Data model shared by the parser, resolver, engine and supervisor.

pub mod job;
pub mod process;
pub mod task;

pub use job::{ExecutionOutcome, ExecutionRecord, Job, JobSpec, JobState};
pub use process::{
    DesiredState, HealthCheck, ProcessCommand, ProcessEntry, ProcessStatus, ProcessType,
    ResourceSample,
};
pub use task::{Parameters, TaskSpec, TriggerSpec, Workflow, WorkflowStatus};

/// Generate a stable string id with a readable prefix (`wf-…`, `job-…`, `proc-…`).
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
