//! End-to-end worker tests against the in-memory store.
//!
//! These spawn real shell processes, so they only run on Unix.
#![cfg(unix)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trogon_crontab::{
    Job, Worker, WorkerConfig,
    mocks::{MemoryStore, MockResultSink},
};

type TestWorker = Worker<MemoryStore, MemoryStore, MockResultSink>;

fn config(worker_id: &str) -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_id(worker_id)
        .with_poll_interval(Duration::from_millis(200))
        .with_kill_grace(Duration::from_secs(1))
}

struct Running {
    worker: Arc<TestWorker>,
    sink: MockResultSink,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(15), self.task)
            .await
            .expect("worker did not stop in time")
            .unwrap();
    }
}

fn start(store: &MemoryStore, worker_id: &str) -> Running {
    let sink = MockResultSink::new();
    let worker = Arc::new(
        Worker::new(config(worker_id), store.clone(), store.clone(), sink.clone()).unwrap(),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });
    Running {
        worker,
        sink,
        shutdown,
        task,
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn saved_job_fires_within_two_seconds() {
    let store = MemoryStore::new();
    let running = start(&store, "w1");

    store.put_job(Job::new("t1", "echo hi", "* * * * * *"));

    let records = running.sink.wait_for(1, Duration::from_secs(2)).await;
    assert!(!records.is_empty(), "no execution within 2s");
    let record = &records[0];
    assert_eq!(record.job_name, "t1");
    assert_eq!(record.output, "hi\n");
    assert!(record.err.is_none());
    assert!(!record.cancelled);
    assert_eq!(record.worker_id, "w1");
    assert!(record.schedule_time >= record.plan_time);
    assert!(record.end_time >= record.start_time);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_fire_runs_on_exactly_one_worker() {
    let store = MemoryStore::new();
    let a = start(&store, "a");
    let b = start(&store, "b");

    store.put_job(Job::new("shared", "sleep 0.5; echo done", "* * * * * *"));
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let (sink_a, sink_b) = (a.sink.clone(), b.sink.clone());
    a.stop().await;
    b.stop().await;

    let mut per_fire: HashMap<_, usize> = HashMap::new();
    let records: Vec<_> = sink_a.records().into_iter().chain(sink_b.records()).collect();
    for record in records.iter().filter(|r| !r.cancelled) {
        *per_fire.entry(record.plan_time).or_default() += 1;
    }
    assert!(per_fire.len() >= 2, "expected several fires, got {per_fire:?}");
    for (plan_time, count) in per_fire {
        assert_eq!(count, 1, "fire at {plan_time} ran {count} times");
    }
}

#[tokio::test]
async fn kill_request_cancels_running_job() {
    let store = MemoryStore::new();
    let running = start(&store, "w1");

    store.put_job(Job::new("long", "sleep 30", "* * * * * *"));
    wait_until(Duration::from_secs(3), || running.worker.registry().is_running("long")).await;

    store.request_kill("long");

    let records = running.sink.wait_for(1, Duration::from_secs(5)).await;
    assert!(records[0].cancelled);
    assert_eq!(records[0].err.as_deref(), Some("execution cancelled"));

    running.stop().await;
}

#[tokio::test]
async fn cancel_releases_lock_and_registry_entry() {
    let store = MemoryStore::new();
    let running = start(&store, "w1");

    store.put_job(Job::new("long", "sleep 30", "* * * * * *"));
    wait_until(Duration::from_secs(3), || store.lock_holder("long").is_some()).await;

    // Stop further fires so the lock stays free once released.
    store.delete_job("long");
    wait_until(Duration::from_secs(1), || running.worker.planner().get("long").is_none()).await;

    let started = Instant::now();
    assert!(running.worker.cancel("long"));
    wait_until(Duration::from_secs(3), || {
        store.lock_holder("long").is_none() && running.worker.registry().is_empty()
    })
    .await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(running.sink.records()[0].cancelled);

    running.stop().await;
}

#[tokio::test]
async fn shutdown_cancels_running_jobs_and_frees_locks() {
    let store = MemoryStore::new();
    let running = start(&store, "w1");

    store.put_job(Job::new("long", "sleep 30", "* * * * * *"));
    wait_until(Duration::from_secs(3), || running.worker.registry().is_running("long")).await;
    wait_until(Duration::from_secs(1), || store.lock_holder("long").is_some()).await;

    let sink = running.sink.clone();
    let worker = Arc::clone(&running.worker);
    running.stop().await;

    assert!(worker.registry().is_empty());
    assert!(store.locked_jobs().is_empty());
    assert!(sink.records().iter().all(|r| r.cancelled));
}

#[tokio::test]
async fn deleted_job_stops_firing() {
    let store = MemoryStore::new();
    let running = start(&store, "w1");

    store.put_job(Job::new("t1", "echo hi", "* * * * * *"));
    running.sink.wait_for(1, Duration::from_secs(2)).await;

    store.delete_job("t1");
    wait_until(Duration::from_secs(1), || running.worker.planner().is_empty()).await;
    wait_until(Duration::from_secs(1), || running.worker.registry().is_empty()).await;
    let count = running.sink.count();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(running.sink.count(), count);

    running.stop().await;
}

#[tokio::test]
async fn invalid_cron_expression_never_runs() {
    let store = MemoryStore::new();
    let running = start(&store, "w1");

    store.put_job(Job::new("bad", "echo bad", "61 * * * *"));
    store.put_job(Job::new("good", "echo good", "* * * * * *"));

    let records = running.sink.wait_for(1, Duration::from_secs(2)).await;
    assert!(!records.is_empty());
    assert!(running.worker.planner().get("bad").is_none());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(running.sink.records().iter().all(|r| r.job_name == "good"));

    running.stop().await;
}

#[tokio::test]
async fn jobs_present_before_start_are_scheduled() {
    let store = MemoryStore::new();
    store.put_job(Job::new("early", "echo early", "* * * * * *"));

    let running = start(&store, "w1");
    let records = running.sink.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(records[0].job_name, "early");
    assert_eq!(records[0].output, "early\n");

    running.stop().await;
}
