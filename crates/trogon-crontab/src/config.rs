use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CronError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_LOCK_TTL: Duration = Duration::from_secs(1);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interpreter used to run job commands: `<program> <args...> <command>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ShellConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Default for ShellConfig {
    #[cfg(not(windows))]
    fn default() -> Self {
        Self::new("sh", vec!["-c".to_string()])
    }

    #[cfg(windows)]
    fn default() -> Self {
        Self::new("cmd", vec!["/C".to_string()])
    }
}

/// Settings shared by every component of one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this worker as lock holder and in published results.
    pub worker_id: String,
    /// Upper bound on how long the scheduler sleeps between due-scans.
    pub poll_interval: Duration,
    /// Lease TTL of job locks; a crashed worker's locks free after this long.
    pub lock_ttl: Duration,
    /// Time a cancelled process gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// How long shutdown waits for cancelled executions to report.
    pub shutdown_timeout: Duration,
    pub shell: ShellConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: Uuid::new_v4().to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_ttl: DEFAULT_LOCK_TTL,
            kill_grace: DEFAULT_KILL_GRACE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            shell: ShellConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_shell(mut self, shell: ShellConfig) -> Self {
        self.shell = shell;
        self
    }

    pub fn validate(&self) -> Result<(), CronError> {
        if self.worker_id.trim().is_empty() {
            return Err(CronError::InvalidConfig {
                reason: "worker_id must not be empty".into(),
            });
        }
        if self.lock_ttl < MIN_LOCK_TTL {
            return Err(CronError::InvalidConfig {
                reason: format!("lock_ttl must be >= {MIN_LOCK_TTL:?}, got {:?}", self.lock_ttl),
            });
        }
        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(CronError::InvalidConfig {
                reason: format!(
                    "poll_interval must be >= {MIN_POLL_INTERVAL:?}, got {:?}",
                    self.poll_interval
                ),
            });
        }
        if self.shell.program.trim().is_empty() {
            return Err(CronError::InvalidConfig {
                reason: "shell program must not be empty".into(),
            });
        }
        Ok(())
    }
}
