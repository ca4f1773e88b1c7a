//! Jobs and execution records: the runnable side of the data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Parameters, TriggerSpec};

/// Per-job lifecycle.
///
/// ```text
/// Scheduled → Due → Running → Succeeded → Scheduled | Completed
///                           → Failed    → Scheduled | PermanentlyFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Due,
    Running,
    Succeeded,
    Failed,
    Completed,
    PermanentlyFailed,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Scheduled, Due)
                | (Due, Running)
                | (Due, Scheduled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Scheduled)
                | (Succeeded, Completed)
                | (Failed, Scheduled)
                | (Failed, PermanentlyFailed)
                // manual re-runs of finished jobs, and back
                | (Completed, Due)
                | (PermanentlyFailed, Due)
                | (Succeeded, PermanentlyFailed)
                | (Failed, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PermanentlyFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Due => "due",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "due" => Self::Due,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            "permanently_failed" => Self::PermanentlyFailed,
            _ => Self::Scheduled,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExecutionOutcome {
    Success {
        #[serde(default)]
        output: serde_json::Value,
    },
    Failure {
        error: String,
    },
    TimedOut {
        after_secs: u64,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error.clone()),
            Self::TimedOut { after_secs } => Some(format!("timed out after {after_secs}s")),
        }
    }
}

/// One attempt of one job. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub record_id: String,
    pub job_id: String,
    /// 1 for the first attempt of a cycle, 2 for the first retry, ...
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    /// Dispatched by an explicit run request rather than by its trigger.
    #[serde(default)]
    pub manual: bool,
}

impl ExecutionRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Request to add a standalone job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub trigger: TriggerSpec,
    /// Job ids this job waits on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl JobSpec {
    pub fn new(name: &str, task_type: &str, trigger: TriggerSpec) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            parameters: Parameters::new(),
            trigger,
            depends_on: Vec::new(),
            max_retries: None,
            timeout_secs: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// The scheduled, runnable projection of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Owning workflow, `None` for jobs added directly.
    pub workflow_id: Option<String>,
    pub name: String,
    pub task_type: String,
    pub parameters: Parameters,
    pub trigger: TriggerSpec,
    pub depends_on: Vec<String>,
    pub state: JobState,
    /// `None` when disabled, finished, or waiting on dependencies.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Scheduled time of the cycle in progress; retries back off from here.
    pub cycle_fire_time: Option<DateTime<Utc>>,
    /// Start of the most recent dispatch.
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<ExecutionOutcome>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub enabled: bool,
    pub run_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        job_id: String,
        name: &str,
        task_type: &str,
        parameters: Parameters,
        trigger: TriggerSpec,
        max_retries: u32,
        timeout_secs: u64,
    ) -> Self {
        Self {
            job_id,
            workflow_id: None,
            name: name.to_string(),
            task_type: task_type.to_string(),
            parameters,
            trigger,
            depends_on: Vec::new(),
            state: JobState::Scheduled,
            next_fire_time: None,
            cycle_fire_time: None,
            last_run: None,
            last_result: None,
            retry_count: 0,
            max_retries,
            timeout_secs,
            enabled: true,
            run_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: JobState) -> Result<(), String> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "job '{}' cannot go from {} to {}",
                self.job_id, self.state, next
            ));
        }
        self.state = next;
        Ok(())
    }

    pub fn is_dependency_triggered(&self) -> bool {
        matches!(self.trigger, TriggerSpec::OnDependencySatisfied)
    }

    /// Whether the trigger says this job is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !self.state.is_terminal()
            && self.next_fire_time.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "job-1".into(),
            "ping",
            "noop",
            Parameters::new(),
            TriggerSpec::interval(60),
            2,
            30,
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut j = job();
        assert!(j.transition(JobState::Due).is_ok());
        assert!(j.transition(JobState::Running).is_ok());
        assert!(j.transition(JobState::Succeeded).is_ok());
        assert!(j.transition(JobState::Scheduled).is_ok());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut j = job();
        assert!(j.transition(JobState::Running).is_err());
        assert_eq!(j.state, JobState::Scheduled);
        assert!(JobState::Completed.is_terminal());
        assert!(!JobState::Completed.can_transition_to(JobState::Scheduled));
    }

    #[test]
    fn test_is_due_respects_enabled() {
        let mut j = job();
        let now = Utc::now();
        j.next_fire_time = Some(now);
        assert!(j.is_due(now));
        j.enabled = false;
        assert!(!j.is_due(now));
    }

    #[test]
    fn test_outcome_serde_tagged() {
        let v = serde_json::to_value(ExecutionOutcome::Failure { error: "x".into() }).unwrap();
        assert_eq!(v["status"], "failure");
        assert_eq!(
            ExecutionOutcome::TimedOut { after_secs: 5 }.error().unwrap(),
            "timed out after 5s"
        );
    }
}
