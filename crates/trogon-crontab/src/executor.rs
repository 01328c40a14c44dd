use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::{
    config::ShellConfig,
    error::ExecutionError,
    job::{JobExecuteInfo, JobExecuteResult},
};

/// How long captured pipes may stay open once the process itself is gone.
/// A backgrounded grandchild can hold them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// Runs job commands through the configured shell.
#[derive(Debug, Clone)]
pub struct Executor {
    shell: ShellConfig,
    kill_grace: Duration,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

impl Executor {
    pub fn new(shell: ShellConfig, kill_grace: Duration) -> Self {
        Self { shell, kill_grace }
    }

    /// Run one execution to completion or cancellation.
    pub async fn run(&self, info: JobExecuteInfo) -> JobExecuteResult {
        let start_time = Utc::now();

        if info.cancel.is_cancelled() {
            return finished(info, Bytes::new(), Some(ExecutionError::Cancelled), start_time);
        }

        let mut child = match self.command(&info).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job = %info.job.name, error = %e, "Failed to spawn job process");
                let err = ExecutionError::Spawn {
                    message: e.to_string(),
                };
                return finished(info, Bytes::new(), Some(err), start_time);
            }
        };

        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(stdout, Arc::clone(&captured))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(stderr, Arc::clone(&captured))));
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = info.cancel.cancelled() => Outcome::Cancelled,
        };
        if matches!(outcome, Outcome::Cancelled) {
            terminate(&mut child, &info.job.name, self.kill_grace).await;
        }

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::warn!(job = %info.job.name, "Output pipe still open after exit, truncating");
                abort.abort();
            }
        }

        let output = {
            let mut buf = captured.lock().unwrap_or_else(|e| e.into_inner());
            Bytes::from(std::mem::take(&mut *buf))
        };

        let err = match outcome {
            Outcome::Cancelled => Some(ExecutionError::Cancelled),
            Outcome::Exited(Ok(status)) if status.success() => None,
            Outcome::Exited(Ok(status)) => Some(ExecutionError::Exit {
                code: status.code(),
            }),
            Outcome::Exited(Err(e)) => Some(ExecutionError::Wait {
                message: e.to_string(),
            }),
        };

        finished(info, output, err, start_time)
    }

    fn command(&self, info: &JobExecuteInfo) -> Command {
        let mut cmd = Command::new(&self.shell.program);
        cmd.args(&self.shell.args)
            .arg(&info.job.command)
            .env("CRONTAB_JOB_NAME", &info.job.name)
            .env("CRONTAB_EXECUTION_ID", info.execution_id.to_string())
            .env("CRONTAB_PLAN_TIME", info.plan_time.to_rfc3339())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If the worker dies the child is killed with it.
            .kill_on_drop(true);
        // Own process group, so cancellation reaches everything the shell started.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

fn finished(
    info: JobExecuteInfo,
    output: Bytes,
    err: Option<ExecutionError>,
    start_time: chrono::DateTime<Utc>,
) -> JobExecuteResult {
    JobExecuteResult {
        info,
        output,
        err,
        start_time,
        end_time: Utc::now(),
    }
}

async fn capture<R: AsyncRead + Unpin>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&chunk[..n]),
        }
    }
}

/// Send SIGTERM to the process group and wait up to `grace` for a clean exit;
/// escalate to SIGKILL if needed.
///
/// On non-Unix platforms SIGTERM is not available, so we go straight to SIGKILL.
async fn terminate(child: &mut Child, job: &str, grace: Duration) {
    tracing::info!(job, "Cancelling job, sending SIGTERM");

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => return,
            Err(_) => {
                tracing::warn!(job, "SIGTERM ignored, escalating to SIGKILL");
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
    }

    let _ = child.start_kill();
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(job, error = %e, "Error waiting for killed process"),
        Err(_) => tracing::error!(job, "Process still alive after SIGKILL"),
    }
}
