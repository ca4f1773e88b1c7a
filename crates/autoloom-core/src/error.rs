//! Autoloom error types.
//!
//! Structural errors (parse, graph, config) are returned to the caller that
//! submitted the work. Runtime errors (execution, supervisor) are recorded in
//! history and status instead of being thrown back.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AutoloomError>;

/// Top-level error for every Autoloom crate.
#[derive(Debug, Error)]
pub enum AutoloomError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AutoloomError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn supervisor(msg: impl Into<String>) -> Self {
        Self::Supervisor(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Whether this error was caused by the caller's input rather than by
    /// something failing at runtime.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Graph(_) | Self::Config(_))
    }
}

/// Reasons a workflow's task graph is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Nodes left over after repeatedly removing zero in-degree nodes.
    #[error("dependency cycle among tasks: {}", nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{task}' uses unregistered task type '{task_type}'")]
    UnknownTaskType { task: String, task_type: String },

    #[error("task name '{0}' appears more than once")]
    DuplicateTask(String),
}
