use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    executor::Executor,
    job::JobExecuteInfo,
    lock::{LockManager, LockOutcome},
    planner::{FiredPlan, SchedulePlanner},
    registry::{ExecutionRegistry, StartOutcome},
    reporter::ResultReporter,
    traits::{LockStore, ResultSink},
};

/// Fires due plans and hands each one to an execution task.
///
/// A fire passes three gates in order: the local registry (no overlap on this
/// worker), then the job lock (no overlap across workers), then the executor.
pub struct Scheduler<L: LockStore, K: ResultSink> {
    planner: Arc<SchedulePlanner>,
    registry: Arc<ExecutionRegistry>,
    locks: Arc<LockManager<L>>,
    executor: Arc<Executor>,
    reporter: Arc<ResultReporter<L, K>>,
    poll_interval: Duration,
}

impl<L: LockStore, K: ResultSink> Scheduler<L, K> {
    pub fn new(
        planner: Arc<SchedulePlanner>,
        registry: Arc<ExecutionRegistry>,
        locks: Arc<LockManager<L>>,
        executor: Arc<Executor>,
        sink: K,
        poll_interval: Duration,
    ) -> Self {
        let reporter = Arc::new(ResultReporter::new(
            Arc::clone(&locks),
            Arc::clone(&registry),
            sink,
        ));
        Self {
            planner,
            registry,
            locks,
            executor,
            reporter,
            poll_interval,
        }
    }

    /// Loop until `shutdown` fires. In-flight executions are left to the caller.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.locks.worker_id(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Scheduler starting"
        );
        loop {
            let wait = self.next_wait(Utc::now());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = self.planner.changed() => {}
            }
            self.tick(Utc::now());
        }
        tracing::info!("Scheduler stopped");
    }

    /// Time until the earliest plan is due, bounded by the poll interval.
    fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        match self.planner.next_wakeup() {
            Some(next) => (next - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    /// Fire every plan due at `now`. Returns how many executions were started.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        self.planner
            .fire_due(now)
            .into_iter()
            .map(|fired| self.dispatch(fired, now))
            .filter(|started| *started)
            .count()
    }

    fn dispatch(&self, fired: FiredPlan, now: DateTime<Utc>) -> bool {
        let FiredPlan { job, plan_time } = fired;
        let name = job.name.clone();
        let mut info = JobExecuteInfo::new(job, plan_time, now);
        let execution_id = info.execution_id;

        if self.registry.try_start(info.clone()) == StartOutcome::AlreadyRunning {
            tracing::debug!(job = %name, plan_time = %plan_time, "Previous execution still running, skipping fire");
            return false;
        }

        let locks = Arc::clone(&self.locks);
        let registry = Arc::clone(&self.registry);
        let executor = Arc::clone(&self.executor);
        let reporter = Arc::clone(&self.reporter);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            match locks.try_acquire(&task_name).await {
                Ok(LockOutcome::Held) => {
                    // Scheduling latency runs until this worker owns the fire.
                    info.real_time = Utc::now();
                    tracing::debug!(job = %task_name, %execution_id, "Executing job");
                    let result = executor.run(info).await;
                    reporter.report(result).await;
                }
                Ok(LockOutcome::Contended) => {
                    registry.finish(&task_name, execution_id);
                }
                Err(e) => {
                    tracing::warn!(job = %task_name, error = %e, "Could not acquire job lock, skipping fire");
                    registry.finish(&task_name, execution_id);
                }
            }
        });
        self.registry.attach(&name, execution_id, handle);
        true
    }
}
