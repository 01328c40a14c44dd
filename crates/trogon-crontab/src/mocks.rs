//! In-memory implementations for testing without a real NATS server.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-crontab = { path = "...", features = ["test-support"] }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{
    config::DEFAULT_LOCK_TTL,
    job::{Job, JobEvent, JobExecuteRecord},
    kv::{LOCK_KEY_PREFIX, job_name_from_key},
    traits::{JobCatalog, JobEventStream, KillRequestStream, LockStore, ResultSink},
};

#[derive(Debug, Clone)]
pub struct MockStoreError(pub String);

impl std::fmt::Display for MockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockStoreError {}

// ── MemoryStore ───────────────────────────────────────────────────────────────

struct LockEntry {
    holder: Bytes,
    revision: u64,
    expires_at: Instant,
}

struct Inner {
    jobs: BTreeMap<String, Job>,
    job_watchers: Vec<mpsc::UnboundedSender<JobEvent>>,
    kill_watchers: Vec<mpsc::UnboundedSender<String>>,
    locks: HashMap<String, LockEntry>,
    lock_ttl: Duration,
    next_revision: u64,
    fail_locks: bool,
    fail_watch: bool,
}

/// Shared in-memory stand-in for both KV buckets.
///
/// Lock keys expire `lock_ttl` after their last write, measured with
/// `tokio::time::Instant` so tests can drive expiry with a paused clock.
/// Clones share state, so several simulated workers can use one store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_lock_ttl(DEFAULT_LOCK_TTL)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_ttl(lock_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: BTreeMap::new(),
                job_watchers: Vec::new(),
                kill_watchers: Vec::new(),
                locks: HashMap::new(),
                lock_ttl,
                next_revision: 1,
                fail_locks: false,
                fail_watch: false,
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Create or update a job and notify watchers, like an admin save.
    pub fn put_job(&self, job: Job) {
        let mut inner = self.inner();
        inner.jobs.insert(job.name.clone(), job.clone());
        let event = JobEvent::Save(job);
        inner.job_watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn delete_job(&self, name: &str) {
        let mut inner = self.inner();
        inner.jobs.remove(name);
        let event = JobEvent::Delete(name.to_string());
        inner.job_watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Change a job without notifying anyone, as if the update happened
    /// while watchers were disconnected.
    pub fn put_job_silently(&self, job: Job) {
        self.inner().jobs.insert(job.name.clone(), job);
    }

    pub fn delete_job_silently(&self, name: &str) {
        self.inner().jobs.remove(name);
    }

    pub fn request_kill(&self, name: &str) {
        let mut inner = self.inner();
        let name = name.to_string();
        inner.kill_watchers.retain(|tx| tx.send(name.clone()).is_ok());
    }

    /// End every open watch stream, simulating a dropped connection.
    pub fn disconnect_watchers(&self) {
        let mut inner = self.inner();
        inner.job_watchers.clear();
        inner.kill_watchers.clear();
    }

    pub fn job_watcher_count(&self) -> usize {
        let mut inner = self.inner();
        inner.job_watchers.retain(|tx| !tx.is_closed());
        inner.job_watchers.len()
    }

    /// Make new watch calls fail until switched back.
    pub fn fail_watch(&self, fail: bool) {
        self.inner().fail_watch = fail;
    }

    /// Make every lock operation fail until switched back.
    pub fn fail_locks(&self, fail: bool) {
        self.inner().fail_locks = fail;
    }

    /// Worker id currently holding the lock for `name`, if unexpired.
    pub fn lock_holder(&self, name: &str) -> Option<String> {
        let inner = self.inner();
        let key = format!("{LOCK_KEY_PREFIX}{name}");
        inner
            .locks
            .get(&key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| String::from_utf8_lossy(&entry.holder).into_owned())
    }

    /// Names of all jobs with an unexpired lock.
    pub fn locked_jobs(&self) -> Vec<String> {
        let inner = self.inner();
        let now = Instant::now();
        inner
            .locks
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, _)| job_name_from_key(key, LOCK_KEY_PREFIX).to_string())
            .collect()
    }
}

fn receiver_stream<T: Send + 'static, E: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> futures::stream::BoxStream<'static, Result<T, E>> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (Ok(item), rx))
    })
    .boxed()
}

impl JobCatalog for MemoryStore {
    type Error = MockStoreError;

    async fn snapshot_and_watch(
        &self,
    ) -> Result<(Vec<Job>, JobEventStream<MockStoreError>), MockStoreError> {
        let mut inner = self.inner();
        if inner.fail_watch {
            return Err(MockStoreError("watch unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.job_watchers.push(tx);
        let jobs = inner.jobs.values().cloned().collect();
        Ok((jobs, receiver_stream(rx)))
    }

    async fn watch_kill_requests(&self) -> Result<KillRequestStream<MockStoreError>, MockStoreError> {
        let mut inner = self.inner();
        if inner.fail_watch {
            return Err(MockStoreError("watch unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.kill_watchers.push(tx);
        Ok(receiver_stream(rx))
    }
}

impl LockStore for MemoryStore {
    type Error = MockStoreError;

    async fn try_create(&self, key: String, holder: Bytes) -> Result<Option<u64>, MockStoreError> {
        let mut inner = self.inner();
        if inner.fail_locks {
            return Err(MockStoreError("lock store unavailable".into()));
        }
        let now = Instant::now();
        if inner.locks.get(&key).is_some_and(|e| e.expires_at > now) {
            return Ok(None);
        }
        let revision = inner.next_revision;
        inner.next_revision += 1;
        let expires_at = now + inner.lock_ttl;
        inner.locks.insert(
            key,
            LockEntry {
                holder,
                revision,
                expires_at,
            },
        );
        Ok(Some(revision))
    }

    async fn renew(&self, key: String, holder: Bytes, revision: u64) -> Result<u64, MockStoreError> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        if inner.fail_locks {
            return Err(MockStoreError("lock store unavailable".into()));
        }
        let now = Instant::now();
        let next_revision = inner.next_revision;
        let ttl = inner.lock_ttl;
        match inner.locks.get_mut(&key) {
            Some(entry)
                if entry.expires_at > now && entry.revision == revision && entry.holder == holder =>
            {
                entry.revision = next_revision;
                entry.expires_at = now + ttl;
                inner.next_revision += 1;
                Ok(next_revision)
            }
            _ => Err(MockStoreError(format!("wrong last sequence for {key}"))),
        }
    }

    async fn release(&self, key: String, revision: u64) -> Result<(), MockStoreError> {
        let mut inner = self.inner();
        if inner.fail_locks {
            return Err(MockStoreError("lock store unavailable".into()));
        }
        let now = Instant::now();
        match inner.locks.get(&key) {
            None => Ok(()),
            Some(entry) if entry.expires_at <= now => {
                inner.locks.remove(&key);
                Ok(())
            }
            Some(entry) if entry.revision == revision => {
                inner.locks.remove(&key);
                Ok(())
            }
            Some(_) => Err(MockStoreError(format!("wrong last sequence for {key}"))),
        }
    }
}

// ── MockResultSink ────────────────────────────────────────────────────────────

/// Records every result forwarded by a reporter.
#[derive(Clone, Default)]
pub struct MockResultSink {
    records: Arc<Mutex<Vec<JobExecuteRecord>>>,
}

impl MockResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JobExecuteRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Poll until at least `count` records arrived or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<JobExecuteRecord> {
        let deadline = Instant::now() + timeout;
        while self.count() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.records()
    }
}

impl ResultSink for MockResultSink {
    type Error = std::convert::Infallible;

    async fn publish_result(&self, record: JobExecuteRecord) -> Result<(), Self::Error> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
