//! Integration tests: require a running NATS server with JetStream.
//!
//! Run with:
//!   NATS_TEST_URL=nats://localhost:4222 cargo test -p trogon-crontab --test integration -- --include-ignored --test-threads=1
//!
//! Every test uses a unique job name, but all of them share the two KV
//! buckets, so a worker started by one test may also run another test's jobs.
//!
//! These tests are marked `#[ignore]` so they don't run in CI without NATS.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use trogon_crontab::{
    CronError, CrontabClient, Job, JobExecuteRecord, LockStore, NatsJobCatalog, NatsLockStore,
    Worker, WorkerConfig, kv,
};

const LOCK_TTL: Duration = Duration::from_secs(10);

fn test_url() -> String {
    std::env::var("NATS_TEST_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

async fn connect() -> async_nats::Client {
    async_nats::connect(test_url())
        .await
        .expect("Failed to connect to NATS. Is NATS_TEST_URL set and NATS running?")
}

fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

async fn start_worker(nats: async_nats::Client) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let js = jetstream::new(nats.clone());
    let jobs = kv::get_or_create_jobs_bucket(&js).await.unwrap();
    let locks = kv::get_or_create_locks_bucket(&js, LOCK_TTL).await.unwrap();
    let worker = Arc::new(
        Worker::new(
            WorkerConfig::default().with_lock_ttl(LOCK_TTL),
            NatsJobCatalog::new(jobs, locks.clone()),
            NatsLockStore::new(locks),
            nats,
        )
        .unwrap(),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });
    (shutdown, task)
}

async fn next_record(results: &mut async_nats::Subscriber, timeout: Duration) -> JobExecuteRecord {
    let msg = tokio::time::timeout(timeout, results.next())
        .await
        .expect("timed out waiting for a result")
        .expect("result subscription closed");
    serde_json::from_slice(&msg.payload).expect("result is not a JobExecuteRecord")
}

// ── CrontabClient CRUD ───────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn save_get_list_and_delete_job() {
    let client = CrontabClient::new(connect().await, LOCK_TTL).await.unwrap();
    let name = unique_name("crud");
    let job = Job::new(&name, "echo hi", "0 0 * * * *");

    assert_eq!(client.save_job(&job).await.unwrap(), None);
    assert_eq!(client.get_job(&name).await.unwrap(), Some(job.clone()));
    assert!(client.list_jobs().await.unwrap().contains(&job));

    let updated = Job::new(&name, "echo bye", "0 0 * * * *");
    assert_eq!(client.save_job(&updated).await.unwrap(), Some(job));

    assert_eq!(client.delete_job(&name).await.unwrap(), Some(updated));
    assert_eq!(client.get_job(&name).await.unwrap(), None);
    assert_eq!(client.delete_job(&name).await.unwrap(), None);
    assert!(!client.list_jobs().await.unwrap().iter().any(|j| j.name == name));
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn save_rejects_invalid_cron_expression() {
    let client = CrontabClient::new(connect().await, LOCK_TTL).await.unwrap();
    let name = unique_name("invalid");

    let err = client
        .save_job(&Job::new(&name, "echo hi", "not a cron"))
        .await
        .unwrap_err();
    assert!(matches!(err, CronError::InvalidCronExpression { .. }));
    assert_eq!(client.get_job(&name).await.unwrap(), None);
}

// ── Lock store ───────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn lock_is_exclusive_until_released() {
    let js = jetstream::new(connect().await);
    let store = NatsLockStore::new(kv::get_or_create_locks_bucket(&js, LOCK_TTL).await.unwrap());
    let key = kv::lock_key(&unique_name("lock"));

    let revision = store
        .try_create(key.clone(), Bytes::from_static(b"w1"))
        .await
        .unwrap()
        .expect("first create should win");
    assert_eq!(store.try_create(key.clone(), Bytes::from_static(b"w2")).await.unwrap(), None);

    let renewed = store
        .renew(key.clone(), Bytes::from_static(b"w1"), revision)
        .await
        .unwrap();
    assert!(renewed > revision);
    assert!(store.renew(key.clone(), Bytes::from_static(b"w1"), revision).await.is_err());

    // A release at a revision the key has moved past must not free it.
    assert!(store.release(key.clone(), revision).await.is_err());
    assert_eq!(store.try_create(key.clone(), Bytes::from_static(b"w2")).await.unwrap(), None);

    store.release(key.clone(), renewed).await.unwrap();
    let taken = store
        .try_create(key.clone(), Bytes::from_static(b"w2"))
        .await
        .unwrap()
        .expect("released key should be free");
    store.release(key, taken).await.unwrap();
}

// ── Worker end to end ────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn saved_job_runs_and_publishes_result() {
    let nats = connect().await;
    let client = CrontabClient::new(nats.clone(), LOCK_TTL).await.unwrap();
    let name = unique_name("e2e");
    let mut results = nats.subscribe(kv::results_subject(&name)).await.unwrap();

    let (shutdown, task) = start_worker(nats).await;
    client
        .save_job(&Job::new(&name, "echo hi", "* * * * * *"))
        .await
        .unwrap();

    let record = next_record(&mut results, Duration::from_secs(3)).await;
    assert_eq!(record.job_name, name);
    assert_eq!(record.output, "hi\n");
    assert!(record.err.is_none());

    client.delete_job(&name).await.unwrap();
    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn kill_job_cancels_running_execution() {
    let nats = connect().await;
    let client = CrontabClient::new(nats.clone(), LOCK_TTL).await.unwrap();
    let name = unique_name("kill");
    let mut results = nats.subscribe(kv::results_subject(&name)).await.unwrap();

    let (shutdown, task) = start_worker(nats).await;
    client
        .save_job(&Job::new(&name, "sleep 30", "* * * * * *"))
        .await
        .unwrap();

    // Give the first fire time to start before asking for the kill.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    client.kill_job(&name).await.unwrap();

    let record = next_record(&mut results, Duration::from_secs(10)).await;
    assert!(record.cancelled);

    client.delete_job(&name).await.unwrap();
    shutdown.cancel();
    task.await.unwrap();
}
