use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{error::CronError, kv::lock_key, traits::LockStore};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// This worker now owns the job until it releases or stops renewing.
    Held,
    /// Another worker owns it (or did, and its key has not expired yet).
    Contended,
}

/// Per-job distributed locks bound to this worker's liveness.
///
/// Every held lock has a keep-alive task that renews the key at a third of the
/// TTL. Dropping the manager stops all keep-alives without deleting any key,
/// which is exactly what a crashed worker looks like to the rest of the fleet:
/// its locks free themselves after one TTL.
pub struct LockManager<S: LockStore> {
    store: S,
    worker_id: String,
    ttl: Duration,
    held: Mutex<HashMap<String, HeldLock>>,
    shutdown: CancellationToken,
}

struct HeldLock {
    stop: CancellationToken,
    /// Resolves to the last revision written, once stopped.
    keep_alive: JoinHandle<u64>,
}

impl<S: LockStore> LockManager<S> {
    pub fn new(store: S, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            ttl,
            held: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(MIN_RENEW_INTERVAL)
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, HeldLock>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn holder(&self) -> Bytes {
        Bytes::from(self.worker_id.clone())
    }

    pub async fn try_acquire(&self, name: &str) -> Result<LockOutcome, CronError> {
        let key = lock_key(name);
        let revision = self
            .store
            .try_create(key.clone(), self.holder())
            .await
            .map_err(CronError::store)?;

        let Some(revision) = revision else {
            debug!(job = %name, "Job lock held elsewhere");
            return Ok(LockOutcome::Contended);
        };

        let stop = self.shutdown.child_token();
        let keep_alive = tokio::spawn(keep_alive(
            self.store.clone(),
            key,
            self.holder(),
            revision,
            self.renew_interval(),
            stop.clone(),
        ));
        if let Some(stale) = self
            .held()
            .insert(name.to_string(), HeldLock { stop, keep_alive })
        {
            stale.stop.cancel();
        }
        debug!(job = %name, worker_id = %self.worker_id, "Acquired job lock");
        Ok(LockOutcome::Held)
    }

    /// Stop renewing and delete the key. Returns false if this worker did not hold it.
    ///
    /// The delete is conditioned on the last revision the keep-alive wrote, so
    /// a key another worker took over after our lease lapsed survives.
    pub async fn release(&self, name: &str) -> Result<bool, CronError> {
        let Some(held) = self.held().remove(name) else {
            return Ok(false);
        };
        held.stop.cancel();
        let revision = held.keep_alive.await.map_err(CronError::store)?;
        self.store
            .release(lock_key(name), revision)
            .await
            .map_err(CronError::store)?;
        debug!(job = %name, worker_id = %self.worker_id, "Released job lock");
        Ok(true)
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held().contains_key(name)
    }
}

impl<S: LockStore> Drop for LockManager<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn keep_alive<S: LockStore>(
    store: S,
    key: String,
    holder: Bytes,
    mut revision: u64,
    interval: Duration,
    stop: CancellationToken,
) -> u64 {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return revision,
            _ = tokio::time::sleep(interval) => {}
        }
        match store.renew(key.clone(), holder.clone(), revision).await {
            Ok(next) => revision = next,
            Err(e) => {
                if !stop.is_cancelled() {
                    warn!(key = %key, error = %e, "Lost job lock (renew failed)");
                }
                return revision;
            }
        }
    }
}
