//! Long-running process definitions and their observed status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Parameters;

/// What a supervised process actually runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessCommand {
    /// An OS child process.
    Shell {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// A registered capability invoked as a long-running task.
    Capability {
        task_type: String,
        #[serde(default)]
        parameters: Parameters,
    },
}

impl ProcessCommand {
    /// Run a command line through `sh -c`, so quoting, pipes and redirects work.
    /// A blank line keeps an empty program and fails validation.
    pub fn shell(command_line: &str) -> Self {
        let command_line = command_line.trim();
        let (program, args) = if command_line.is_empty() {
            (String::new(), Vec::new())
        } else {
            ("sh".to_string(), vec!["-c".to_string(), command_line.to_string()])
        };
        Self::Shell {
            program,
            args,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn capability(task_type: &str, parameters: Parameters) -> Self {
        Self::Capability {
            task_type: task_type.to_string(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    WebService,
    BackgroundJob,
    Worker,
    Daemon,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebService => "web_service",
            Self::BackgroundJob => "background_job",
            Self::Worker => "worker",
            Self::Daemon => "daemon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Observed runtime state. Exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessStatus {
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Crashed, Starting)
                | (Crashed, Stopped)
        )
    }

    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the supervisor decides a running process is healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    /// Healthy while the process has not exited.
    #[default]
    Liveness,
    /// GET must answer 2xx within the health-check timeout.
    Http { url: String },
}

/// Best-effort CPU/memory reading. Missing values mean "not available".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub sampled_at: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

/// A supervised, non-scheduled process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub process_id: String,
    pub name: String,
    pub command: ProcessCommand,
    pub process_type: ProcessType,
    pub desired_state: DesiredState,
    pub auto_restart: bool,
    /// `None` = restart forever.
    pub max_restarts: Option<u32>,
    pub restart_count: u32,
    #[serde(default)]
    pub health_check: HealthCheck,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub resource_sample: Option<ResourceSample>,
    pub created_at: DateTime<Utc>,
}

impl ProcessEntry {
    pub fn new(name: &str, command: ProcessCommand, process_type: ProcessType) -> Self {
        Self {
            process_id: super::new_id("proc"),
            name: name.to_string(),
            command,
            process_type,
            desired_state: DesiredState::Stopped,
            auto_restart: true,
            max_restarts: Some(3),
            restart_count: 0,
            health_check: HealthCheck::Liveness,
            status: ProcessStatus::NotStarted,
            pid: None,
            started_at: None,
            stopped_at: None,
            last_health_check: None,
            last_error: None,
            resource_sample: None,
            created_at: Utc::now(),
        }
    }

    /// HTTP service probed at `http://127.0.0.1:{port}/health`.
    pub fn web_service(name: &str, command_line: &str, port: u16) -> Self {
        Self::new(name, ProcessCommand::shell(command_line), ProcessType::WebService)
            .with_health_check(HealthCheck::Http {
                url: format!("http://127.0.0.1:{port}/health"),
            })
    }

    pub fn background_job(name: &str, command_line: &str) -> Self {
        Self::new(name, ProcessCommand::shell(command_line), ProcessType::BackgroundJob)
    }

    pub fn worker(name: &str, command_line: &str) -> Self {
        Self::new(name, ProcessCommand::shell(command_line), ProcessType::Worker)
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: Option<u32>) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn transition(&mut self, next: ProcessStatus) -> Result<(), String> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "process '{}' cannot go from {} to {}",
                self.name, self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_goes_through_sh() {
        match ProcessCommand::shell("  python worker.py --name 'a b' | tee out.log ") {
            ProcessCommand::Shell { program, args, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(args, vec!["-c", "python worker.py --name 'a b' | tee out.log"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match ProcessCommand::shell("   ") {
            ProcessCommand::Shell { program, args, .. } => {
                assert!(program.is_empty());
                assert!(args.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_web_service_health_url() {
        let entry = ProcessEntry::web_service("api", "./server", 8080);
        assert_eq!(
            entry.health_check,
            HealthCheck::Http {
                url: "http://127.0.0.1:8080/health".into()
            }
        );
        assert_eq!(entry.process_type, ProcessType::WebService);
    }

    #[test]
    fn test_process_lifecycle_transitions() {
        let mut entry = ProcessEntry::worker("w", "sleep 100");
        assert!(entry.transition(ProcessStatus::Running).is_err());
        assert!(entry.transition(ProcessStatus::Starting).is_ok());
        assert!(entry.transition(ProcessStatus::Running).is_ok());
        assert!(entry.transition(ProcessStatus::Crashed).is_ok());
        assert!(entry.transition(ProcessStatus::Stopped).is_ok());
        assert!(!ProcessStatus::Stopped.is_alive());
    }
}
