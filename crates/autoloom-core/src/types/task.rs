//! Task specifications, triggers and workflows, as produced by the intent parser.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task parameters: a JSON object.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// When a job becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Five-field cron expression ("MIN HOUR DOM MON DOW"), evaluated in UTC.
    Cron { expression: String },
    /// Every N seconds.
    Interval { every_secs: u64 },
    /// Exactly once at a specific time.
    Once { at: DateTime<Utc> },
    /// As soon as every dependency has succeeded in the current cycle.
    OnDependencySatisfied,
}

impl TriggerSpec {
    pub fn cron(expression: &str) -> Self {
        Self::Cron {
            expression: expression.to_string(),
        }
    }

    pub fn interval(every_secs: u64) -> Self {
        Self::Interval { every_secs }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    /// Short label used in logs and the SQLite `trigger_kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cron { .. } => "cron",
            Self::Interval { .. } => "interval",
            Self::Once { .. } => "once",
            Self::OnDependencySatisfied => "on_dependency",
        }
    }
}

impl std::fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron { expression } => write!(f, "cron({expression})"),
            Self::Interval { every_secs } => {
                if *every_secs >= 3600 && every_secs % 3600 == 0 {
                    write!(f, "every {}h", every_secs / 3600)
                } else if *every_secs >= 60 && every_secs % 60 == 0 {
                    write!(f, "every {}min", every_secs / 60)
                } else {
                    write!(f, "every {every_secs}s")
                }
            }
            Self::Once { at } => write!(f, "once at {}", at.to_rfc3339()),
            Self::OnDependencySatisfied => write!(f, "after dependencies"),
        }
    }
}

/// One unit of work extracted from an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within its workflow.
    pub name: String,
    /// Key into the task registry.
    pub task_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    /// Names of tasks in the same workflow that must succeed first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub trigger: Option<TriggerSpec>,
}

impl TaskSpec {
    pub fn new(name: &str, task_type: &str) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            parameters: Parameters::new(),
            depends_on: BTreeSet::new(),
            trigger: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn depends_on(mut self, task: &str) -> Self {
        self.depends_on.insert(task.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paused" => Self::Paused,
            "archived" => Self::Archived,
            _ => Self::Active,
        }
    }
}

/// A named set of tasks created from one intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    /// The text the workflow was parsed from.
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskSpec>,
    pub created_at: DateTime<Utc>,
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(name: &str, tasks: Vec<TaskSpec>) -> Self {
        Self {
            id: super::new_id("wf"),
            name: name.to_string(),
            description: String::new(),
            tasks,
            created_at: Utc::now(),
            status: WorkflowStatus::Active,
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Job id a task of this workflow is scheduled under.
    pub fn job_id_for(&self, task_name: &str) -> String {
        format!("{}/{}", self.id, task_name)
    }
}
