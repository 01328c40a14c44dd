use std::time::Duration;

use async_nats::jetstream::{self, kv};
use futures::StreamExt;

use crate::{error::CronError, job::Job};

pub const JOBS_BUCKET: &str = "crontab_jobs";
pub const LOCKS_BUCKET: &str = "crontab_locks";
pub const JOBS_KEY_PREFIX: &str = "jobs.";
pub const JOBS_WATCH_PATTERN: &str = "jobs.*";
pub const LOCK_KEY_PREFIX: &str = "lock.";
pub const KILL_KEY_PREFIX: &str = "kill.";
pub const KILL_WATCH_PATTERN: &str = "kill.*";
/// Finished executions are published on `crontab.results.<job name>`.
pub const RESULTS_SUBJECT_PREFIX: &str = "crontab.results.";

const SNAPSHOT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub fn job_key(name: &str) -> String {
    format!("{JOBS_KEY_PREFIX}{name}")
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{name}")
}

pub fn kill_key(name: &str) -> String {
    format!("{KILL_KEY_PREFIX}{name}")
}

pub fn results_subject(name: &str) -> String {
    format!("{RESULTS_SUBJECT_PREFIX}{name}")
}

/// Strip `prefix` from a KV key, yielding the job name.
pub fn job_name_from_key<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}

pub async fn get_or_create_jobs_bucket(js: &jetstream::Context) -> Result<kv::Store, CronError> {
    open_or_create(
        js,
        kv::Config {
            bucket: JOBS_BUCKET.to_string(),
            history: 5,
            ..Default::default()
        },
    )
    .await
}

/// Lock and kill-request keys share one bucket whose `max_age` is the lease
/// TTL: an entry that is not rewritten within the TTL is purged by the server.
pub async fn get_or_create_locks_bucket(
    js: &jetstream::Context,
    ttl: Duration,
) -> Result<kv::Store, CronError> {
    open_or_create(
        js,
        kv::Config {
            bucket: LOCKS_BUCKET.to_string(),
            history: 1,
            max_age: ttl,
            ..Default::default()
        },
    )
    .await
}

/// Bind to `config.bucket`, creating it on first use. An existing bucket is
/// used as is, even if its settings differ from `config`.
async fn open_or_create(js: &jetstream::Context, config: kv::Config) -> Result<kv::Store, CronError> {
    if let Ok(store) = js.get_key_value(&config.bucket).await {
        return Ok(store);
    }
    // Two workers may both land here; JetStream accepts a create that
    // matches the existing stream, so the loser still gets the bucket.
    js.create_key_value(config).await.map_err(CronError::store)
}

/// Decode one snapshot entry. Tombstones and unreadable values yield `None`.
fn snapshot_job(key: &str, operation: kv::Operation, value: &[u8]) -> Option<Job> {
    if operation != kv::Operation::Put {
        return None;
    }
    serde_json::from_slice(value)
        .inspect_err(|e| tracing::warn!(key, error = %e, "Skipping unreadable job in snapshot"))
        .ok()
}

/// Read the current job set and return it with the still-open watch.
///
/// The watch replays the newest revision of every key before streaming new
/// writes, so nothing written during the load is lost: it either shows up in
/// the snapshot or as the first live event.
pub async fn load_jobs_and_watch(kv: &kv::Store) -> Result<(Vec<Job>, kv::Watch), CronError> {
    let mut watch = kv
        .watch_with_history(JOBS_WATCH_PATTERN)
        .await
        .map_err(CronError::store)?;

    // An empty bucket replays nothing, so the replay is also cut off by time.
    let cutoff = tokio::time::Instant::now() + SNAPSHOT_DRAIN_TIMEOUT;
    let mut jobs = Vec::new();
    while let Ok(Some(entry)) = tokio::time::timeout_at(cutoff, watch.next()).await {
        let entry = entry.map_err(CronError::store)?;
        jobs.extend(snapshot_job(&entry.key, entry.operation, &entry.value));
        // Nothing pending behind this entry: the replay is complete.
        if entry.delta == 0 {
            break;
        }
    }

    Ok((jobs, watch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_by_kind() {
        assert_eq!(job_key("backup"), "jobs.backup");
        assert_eq!(lock_key("backup"), "lock.backup");
        assert_eq!(kill_key("backup"), "kill.backup");
        assert_eq!(results_subject("backup"), "crontab.results.backup");
    }

    #[test]
    fn name_is_recovered_from_key() {
        assert_eq!(job_name_from_key("jobs.backup", JOBS_KEY_PREFIX), "backup");
        assert_eq!(job_name_from_key("kill.backup", KILL_KEY_PREFIX), "backup");
        assert_eq!(job_name_from_key("backup", JOBS_KEY_PREFIX), "backup");
    }

    #[test]
    fn snapshot_keeps_only_readable_puts() {
        let job = Job::new("backup", "echo hi", "30 2 * * *");
        let value = serde_json::to_vec(&job).unwrap();

        assert_eq!(
            snapshot_job("jobs.backup", kv::Operation::Put, &value),
            Some(job)
        );
        assert_eq!(snapshot_job("jobs.backup", kv::Operation::Delete, &value), None);
        assert_eq!(snapshot_job("jobs.backup", kv::Operation::Purge, b""), None);
        assert_eq!(snapshot_job("jobs.broken", kv::Operation::Put, b"{not json"), None);
    }
}
