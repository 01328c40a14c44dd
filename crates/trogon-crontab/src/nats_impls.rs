use async_nats::jetstream::kv;
use bytes::Bytes;
use futures::StreamExt;

use crate::{
    error::CronError,
    job::{Job, JobEvent, JobExecuteRecord},
    kv::{
        JOBS_KEY_PREFIX, KILL_KEY_PREFIX, KILL_WATCH_PATTERN, job_name_from_key,
        load_jobs_and_watch, results_subject,
    },
    traits::{JobCatalog, JobEventStream, KillRequestStream, LockStore, ResultSink},
};

/// Concrete `ResultSink` backed by an `async_nats::Client`.
impl ResultSink for async_nats::Client {
    type Error = CronError;

    async fn publish_result(&self, record: JobExecuteRecord) -> Result<(), CronError> {
        let payload = serde_json::to_vec(&record)?;
        self.publish(results_subject(&record.job_name), payload.into())
            .await
            .map_err(CronError::store)
    }
}

/// Concrete `JobCatalog` backed by the jobs and locks KV buckets.
#[derive(Clone)]
pub struct NatsJobCatalog {
    jobs: kv::Store,
    locks: kv::Store,
}

impl NatsJobCatalog {
    pub fn new(jobs: kv::Store, locks: kv::Store) -> Self {
        Self { jobs, locks }
    }
}

/// Translate a KV entry under `jobs.*` into a `JobEvent`.
///
/// Undecodable values and values whose `name` disagrees with their key are
/// dropped with a warning rather than scheduled under the wrong name.
pub fn job_event_from_entry(entry: &kv::Entry) -> Option<JobEvent> {
    let name = job_name_from_key(&entry.key, JOBS_KEY_PREFIX);
    match entry.operation {
        kv::Operation::Put => match serde_json::from_slice::<Job>(&entry.value) {
            Ok(job) if job.name == name => Some(JobEvent::Save(job)),
            Ok(job) => {
                tracing::warn!(key = %entry.key, job = %job.name, "Job name does not match its key, ignoring");
                None
            }
            Err(e) => {
                tracing::warn!(key = %entry.key, error = %e, "Failed to deserialize job");
                None
            }
        },
        kv::Operation::Delete | kv::Operation::Purge => Some(JobEvent::Delete(name.to_string())),
    }
}

impl JobCatalog for NatsJobCatalog {
    type Error = CronError;

    async fn snapshot_and_watch(&self) -> Result<(Vec<Job>, JobEventStream<CronError>), CronError> {
        let (jobs, watcher) = load_jobs_and_watch(&self.jobs).await?;
        let events = watcher
            .filter_map(|entry| async move {
                match entry {
                    Ok(e) => job_event_from_entry(&e).map(Ok),
                    Err(e) => Some(Err(CronError::store(e))),
                }
            })
            .boxed();
        Ok((jobs, events))
    }

    async fn watch_kill_requests(&self) -> Result<KillRequestStream<CronError>, CronError> {
        let watcher = self
            .locks
            .watch(KILL_WATCH_PATTERN)
            .await
            .map_err(CronError::store)?;
        let requests = watcher
            .filter_map(|entry| async move {
                match entry {
                    Ok(e) if e.operation == kv::Operation::Put => {
                        Some(Ok(job_name_from_key(&e.key, KILL_KEY_PREFIX).to_string()))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(CronError::store(e))),
                }
            })
            .boxed();
        Ok(requests)
    }
}

/// Concrete `LockStore` backed by the TTL-limited locks bucket.
#[derive(Clone)]
pub struct NatsLockStore {
    store: kv::Store,
}

impl NatsLockStore {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }
}

impl LockStore for NatsLockStore {
    type Error = CronError;

    async fn try_create(&self, key: String, holder: Bytes) -> Result<Option<u64>, CronError> {
        match self.store.create(&key, holder).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => Ok(None),
            Err(e) => Err(CronError::store(e)),
        }
    }

    async fn renew(&self, key: String, holder: Bytes, revision: u64) -> Result<u64, CronError> {
        self.store
            .update(&key, holder, revision)
            .await
            .map_err(CronError::store)
    }

    async fn release(&self, key: String, revision: u64) -> Result<(), CronError> {
        // The server rejects the delete if anyone wrote the key after us, so
        // a lock taken over after our lease lapsed is left alone.
        self.store
            .delete_expect_revision(&key, Some(revision))
            .await
            .map_err(CronError::store)
    }
}
