use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while managing job definitions, plans and store state.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("Cron expression '{expr}' has no upcoming fire time")]
    NoUpcomingFireTime { expr: String },

    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CronError {
    pub(crate) fn store(e: impl std::fmt::Display) -> Self {
        Self::Store(e.to_string())
    }
}

/// Why an execution did not complete successfully.
///
/// Carried in [`JobExecuteResult::err`](crate::job::JobExecuteResult). A
/// cancelled run is not a failure, but consumers need to tell it apart from
/// one that exited cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("failed to spawn process: {message}")]
    Spawn { message: String },

    #[error("failed to wait for process: {message}")]
    Wait { message: String },

    #[error("process exited with status {}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Exit { code: Option<i32> },

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
