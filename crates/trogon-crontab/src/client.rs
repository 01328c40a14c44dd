use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;

use crate::{
    error::CronError,
    job::{Job, validate_job_name},
    kv::{get_or_create_jobs_bucket, get_or_create_locks_bucket, job_key, kill_key, load_jobs_and_watch},
    planner::parse_cron_expr,
};

/// Store-side job management in NATS KV.
///
/// Every running worker picks up changes made here through its KV watch, so
/// any number of processes can manage jobs concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use trogon_crontab::{CrontabClient, Job};
///
/// # async fn example() -> Result<(), trogon_crontab::CronError> {
/// let nats = async_nats::connect("nats://localhost:4222").await.unwrap();
/// let client = CrontabClient::new(nats, std::time::Duration::from_secs(10)).await?;
///
/// client.save_job(&Job::new("t1", "echo hi", "* * * * * *")).await?;
/// client.kill_job("t1").await?;
/// # Ok(())
/// # }
/// ```
pub struct CrontabClient {
    jobs: kv::Store,
    locks: kv::Store,
}

impl CrontabClient {
    /// Ensure both buckets exist. `lock_ttl` only matters when this call
    /// creates the lock bucket and must match the workers' setting.
    pub async fn new(nats: async_nats::Client, lock_ttl: Duration) -> Result<Self, CronError> {
        let js = jetstream::new(nats);
        let jobs = get_or_create_jobs_bucket(&js).await?;
        let locks = get_or_create_locks_bucket(&js, lock_ttl).await?;
        Ok(Self { jobs, locks })
    }

    /// Create or replace a job. Returns the definition it replaced, if any.
    ///
    /// The cron expression is checked before anything is written, so workers
    /// never see a definition this client knows to be invalid.
    pub async fn save_job(&self, job: &Job) -> Result<Option<Job>, CronError> {
        job.validate()?;
        parse_cron_expr(&job.cron_expr)?;

        let previous = self.get_job(&job.name).await?;
        let value = serde_json::to_vec(job)?;
        self.jobs
            .put(job_key(&job.name), value.into())
            .await
            .map_err(CronError::store)?;

        tracing::info!(job = %job.name, cron_expr = %job.cron_expr, "Job saved");
        Ok(previous)
    }

    /// Remove a job. Returns the removed definition, or `None` if it did not exist.
    pub async fn delete_job(&self, name: &str) -> Result<Option<Job>, CronError> {
        validate_job_name(name)?;
        let Some(previous) = self.get_job(name).await? else {
            return Ok(None);
        };
        self.jobs
            .delete(job_key(name))
            .await
            .map_err(CronError::store)?;

        tracing::info!(job = %name, "Job deleted");
        Ok(Some(previous))
    }

    /// Get a single job. Returns `None` if absent or deleted.
    pub async fn get_job(&self, name: &str) -> Result<Option<Job>, CronError> {
        validate_job_name(name)?;
        match self
            .jobs
            .entry(job_key(name))
            .await
            .map_err(CronError::store)?
        {
            Some(entry) if entry.operation == kv::Operation::Put => {
                Ok(Some(serde_json::from_slice(&entry.value)?))
            }
            _ => Ok(None),
        }
    }

    /// All current jobs.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, CronError> {
        let (jobs, _watcher) = load_jobs_and_watch(&self.jobs).await?;
        Ok(jobs)
    }

    /// Ask whichever worker is running `name` to cancel it.
    ///
    /// The request lives in the lock bucket and expires with the lease TTL;
    /// a job that is not running when it arrives is unaffected.
    pub async fn kill_job(&self, name: &str) -> Result<(), CronError> {
        validate_job_name(name)?;
        self.locks
            .put(kill_key(name), Bytes::new())
            .await
            .map_err(CronError::store)?;

        tracing::info!(job = %name, "Kill requested");
        Ok(())
    }
}
