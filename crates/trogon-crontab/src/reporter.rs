use std::sync::Arc;

use crate::{
    job::{JobExecuteRecord, JobExecuteResult},
    lock::LockManager,
    registry::ExecutionRegistry,
    traits::{LockStore, ResultSink},
};

/// Where every execution ends: the lock is released and the registry entry
/// removed together, then the result goes out to the sink.
pub struct ResultReporter<L: LockStore, K: ResultSink> {
    locks: Arc<LockManager<L>>,
    registry: Arc<ExecutionRegistry>,
    sink: K,
}

impl<L: LockStore, K: ResultSink> ResultReporter<L, K> {
    pub fn new(locks: Arc<LockManager<L>>, registry: Arc<ExecutionRegistry>, sink: K) -> Self {
        Self {
            locks,
            registry,
            sink,
        }
    }

    pub async fn report(&self, result: JobExecuteResult) {
        let name = result.job_name();

        if let Err(e) = self.locks.release(name).await {
            // The lease expires on its own; nothing else to do here.
            tracing::warn!(job = %name, error = %e, "Failed to release job lock");
        }
        self.registry.finish(name, result.info.execution_id);

        let skew_ms = result.info.skew().num_milliseconds();
        let duration_ms = (result.end_time - result.start_time).num_milliseconds();
        match &result.err {
            None => tracing::info!(
                job = %name,
                execution_id = %result.info.execution_id,
                skew_ms,
                duration_ms,
                output_bytes = result.output.len(),
                "Job completed"
            ),
            Some(e) if e.is_cancelled() => tracing::info!(
                job = %name,
                execution_id = %result.info.execution_id,
                duration_ms,
                "Job cancelled"
            ),
            Some(e) => tracing::warn!(
                job = %name,
                execution_id = %result.info.execution_id,
                skew_ms,
                duration_ms,
                error = %e,
                "Job failed"
            ),
        }

        let record = JobExecuteRecord::from_result(&result, self.locks.worker_id());
        if let Err(e) = self.sink.publish_result(record).await {
            tracing::error!(job = %name, error = %e, "Failed to publish job result");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::{
        error::ExecutionError,
        job::{Job, JobExecuteInfo},
        lock::LockOutcome,
        mocks::{MemoryStore, MockResultSink},
        registry::StartOutcome,
    };

    fn result_for(info: JobExecuteInfo, err: Option<ExecutionError>) -> JobExecuteResult {
        let now = Utc::now();
        JobExecuteResult {
            info,
            output: Bytes::from_static(b"hi\n"),
            err,
            start_time: now,
            end_time: now,
        }
    }

    #[tokio::test]
    async fn report_releases_lock_clears_registry_and_forwards() {
        let store = MemoryStore::new();
        let locks = Arc::new(LockManager::new(store.clone(), "w1", Duration::from_secs(5)));
        let registry = Arc::new(ExecutionRegistry::new());
        let sink = MockResultSink::new();
        let reporter = ResultReporter::new(locks.clone(), registry.clone(), sink.clone());

        let now = Utc::now();
        let info = JobExecuteInfo::new(Job::new("t1", "echo hi", "* * * * * *"), now, now);
        assert_eq!(registry.try_start(info.clone()), StartOutcome::Accepted);
        assert_eq!(locks.try_acquire("t1").await.unwrap(), LockOutcome::Held);

        reporter.report(result_for(info, None)).await;

        assert!(!locks.is_held("t1"));
        assert!(registry.is_empty());
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_name, "t1");
        assert_eq!(records[0].worker_id, "w1");
        assert_eq!(records[0].output, "hi\n");

        let other = LockManager::new(store, "w2", Duration::from_secs(5));
        assert_eq!(other.try_acquire("t1").await.unwrap(), LockOutcome::Held);
    }

    #[tokio::test]
    async fn cancelled_result_is_forwarded_as_cancelled() {
        let locks = Arc::new(LockManager::new(MemoryStore::new(), "w1", Duration::from_secs(5)));
        let registry = Arc::new(ExecutionRegistry::new());
        let sink = MockResultSink::new();
        let reporter = ResultReporter::new(locks, registry, sink.clone());

        let now = Utc::now();
        let info = JobExecuteInfo::new(Job::new("t1", "sleep 9", "* * * * * *"), now, now);
        reporter
            .report(result_for(info, Some(ExecutionError::Cancelled)))
            .await;

        let records = sink.records();
        assert!(records[0].cancelled);
    }
}
