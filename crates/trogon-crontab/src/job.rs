use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CronError, ExecutionError};

/// Job definition stored in NATS KV under key `jobs.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// Shell command line, run through the configured shell.
    pub command: String,
    #[serde(rename = "cronExpr")]
    pub cron_expr: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.into(),
        }
    }

    /// The name becomes a single KV key token, so it must be non-empty and
    /// limited to characters NATS accepts without splitting the key.
    pub fn validate(&self) -> Result<(), CronError> {
        validate_job_name(&self.name)?;
        if self.command.trim().is_empty() {
            return Err(CronError::InvalidJob {
                reason: format!("job '{}' has an empty command", self.name),
            });
        }
        Ok(())
    }
}

pub fn validate_job_name(name: &str) -> Result<(), CronError> {
    if name.is_empty() {
        return Err(CronError::InvalidJob {
            reason: "job name must not be empty".into(),
        });
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '/')))
    {
        return Err(CronError::InvalidJob {
            reason: format!("job name '{name}' contains invalid character {c:?}"),
        });
    }
    Ok(())
}

/// Change notification derived from the job catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Job created or updated.
    Save(Job),
    /// Job removed; only the name survives a delete.
    Delete(String),
}

impl JobEvent {
    pub fn job_name(&self) -> &str {
        match self {
            Self::Save(job) => &job.name,
            Self::Delete(name) => name,
        }
    }
}

/// A fire handed from the scheduler loop to the execution pipeline.
#[derive(Debug, Clone)]
pub struct JobExecuteInfo {
    pub execution_id: Uuid,
    pub job: Job,
    /// Theoretical fire instant taken from the plan.
    pub plan_time: DateTime<Utc>,
    /// When the scheduler actually dispatched the run.
    pub real_time: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl JobExecuteInfo {
    pub fn new(job: Job, plan_time: DateTime<Utc>, real_time: DateTime<Utc>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            job,
            plan_time,
            real_time,
            cancel: CancellationToken::new(),
        }
    }

    /// Scheduling skew between the planned and the actual dispatch instant.
    pub fn skew(&self) -> chrono::Duration {
        self.real_time - self.plan_time
    }
}

#[derive(Debug, Clone)]
pub struct JobExecuteResult {
    pub info: JobExecuteInfo,
    /// Combined stdout and stderr; interleaving between the two is not preserved.
    pub output: Bytes,
    pub err: Option<ExecutionError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl JobExecuteResult {
    pub fn job_name(&self) -> &str {
        &self.info.job.name
    }

    pub fn was_cancelled(&self) -> bool {
        self.err.as_ref().is_some_and(ExecutionError::is_cancelled)
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Serialized form of a finished execution, published for log/history consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecuteRecord {
    pub job_name: String,
    pub command: String,
    pub execution_id: Uuid,
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    pub cancelled: bool,
    pub output: String,
    pub plan_time: DateTime<Utc>,
    pub schedule_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl JobExecuteRecord {
    pub fn from_result(result: &JobExecuteResult, worker_id: &str) -> Self {
        Self {
            job_name: result.info.job.name.clone(),
            command: result.info.job.command.clone(),
            execution_id: result.info.execution_id,
            worker_id: worker_id.to_string(),
            err: result.err.as_ref().map(ToString::to_string),
            cancelled: result.was_cancelled(),
            output: result.output_lossy(),
            plan_time: result.info.plan_time,
            schedule_time: result.info.real_time,
            start_time: result.start_time,
            end_time: result.end_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_uses_wire_field_names() {
        let job: Job = serde_json::from_str(
            r#"{"name":"backup","command":"echo hi","cronExpr":"*/5 * * * * *"}"#,
        )
        .unwrap();
        assert_eq!(job, Job::new("backup", "echo hi", "*/5 * * * * *"));

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["cronExpr"], "*/5 * * * * *");
        assert!(json.get("cron_expr").is_none());
    }

    #[test]
    fn dotted_name_is_rejected() {
        let err = Job::new("a.b", "true", "* * * * *").validate().unwrap_err();
        assert!(err.to_string().contains("invalid character"));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(Job::new("", "true", "* * * * *").validate().is_err());
    }

    #[test]
    fn blank_command_is_rejected() {
        assert!(Job::new("x", "  ", "* * * * *").validate().is_err());
    }

    #[test]
    fn skew_is_real_minus_plan() {
        let plan = Utc::now();
        let info = JobExecuteInfo::new(
            Job::new("x", "true", "* * * * *"),
            plan,
            plan + chrono::Duration::milliseconds(250),
        );
        assert_eq!(info.skew(), chrono::Duration::milliseconds(250));
    }

    #[test]
    fn record_marks_cancellation() {
        let now = Utc::now();
        let result = JobExecuteResult {
            info: JobExecuteInfo::new(Job::new("x", "sleep 9", "* * * * *"), now, now),
            output: Bytes::from_static(b"partial"),
            err: Some(ExecutionError::Cancelled),
            start_time: now,
            end_time: now,
        };
        let record = JobExecuteRecord::from_result(&result, "worker-1");
        assert!(record.cancelled);
        assert_eq!(record.output, "partial");
        assert_eq!(record.err.as_deref(), Some("execution cancelled"));
        assert_eq!(record.worker_id, "worker-1");
    }
}
