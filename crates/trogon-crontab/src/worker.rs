use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::WorkerConfig,
    error::CronError,
    executor::Executor,
    lock::LockManager,
    planner::SchedulePlanner,
    registry::ExecutionRegistry,
    scheduler::Scheduler,
    traits::{JobCatalog, LockStore, ResultSink},
    watcher::{JobWatcher, KillWatcher},
};

/// One worker process: the shared plan table, execution registry and lock
/// manager, plus the tasks that drive them.
///
/// Any number of workers may share a store. Each fire runs on at most one of
/// them, whichever takes the job lock first.
pub struct Worker<C: JobCatalog, L: LockStore, K: ResultSink> {
    config: WorkerConfig,
    catalog: C,
    planner: Arc<SchedulePlanner>,
    registry: Arc<ExecutionRegistry>,
    locks: Arc<LockManager<L>>,
    scheduler: Scheduler<L, K>,
}

impl<C: JobCatalog, L: LockStore, K: ResultSink> Worker<C, L, K> {
    pub fn new(config: WorkerConfig, catalog: C, lock_store: L, sink: K) -> Result<Self, CronError> {
        config.validate()?;

        let planner = Arc::new(SchedulePlanner::new());
        let registry = Arc::new(ExecutionRegistry::new());
        let locks = Arc::new(LockManager::new(
            lock_store,
            config.worker_id.clone(),
            config.lock_ttl,
        ));
        let executor = Arc::new(Executor::new(config.shell.clone(), config.kill_grace));
        let scheduler = Scheduler::new(
            Arc::clone(&planner),
            Arc::clone(&registry),
            Arc::clone(&locks),
            executor,
            sink,
            config.poll_interval,
        );

        Ok(Self {
            config,
            catalog,
            planner,
            registry,
            locks,
            scheduler,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn planner(&self) -> &Arc<SchedulePlanner> {
        &self.planner
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<LockManager<L>> {
        &self.locks
    }

    /// Cancel the running execution of `name` on this worker, if any.
    pub fn cancel(&self, name: &str) -> bool {
        self.registry.cancel(name)
    }

    /// Run until `shutdown` fires, then cancel in-flight executions and wait
    /// up to `shutdown_timeout` for them to report and release their locks.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.config.worker_id, "Worker starting");

        let watchers = shutdown.child_token();
        let job_watcher = tokio::spawn(
            JobWatcher::new(self.catalog.clone(), Arc::clone(&self.planner)).run(watchers.clone()),
        );
        let kill_watcher = tokio::spawn(
            KillWatcher::new(self.catalog.clone(), Arc::clone(&self.registry)).run(watchers.clone()),
        );

        self.scheduler.run(shutdown.clone()).await;

        watchers.cancel();
        for (watcher, task) in [("job", job_watcher), ("kill", kill_watcher)] {
            if let Err(e) = task.await {
                tracing::error!(watcher, error = %e, "Watcher task failed");
            }
        }

        let handles = self.registry.cancel_all();
        if !handles.is_empty() {
            tracing::info!(count = handles.len(), "Cancelling running executions");
            let drained = tokio::time::timeout(
                self.config.shutdown_timeout,
                futures::future::join_all(handles),
            )
            .await;
            if drained.is_err() {
                tracing::warn!(
                    remaining = self.registry.len(),
                    "Executions still running after shutdown timeout"
                );
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
    }
}
