use std::future::Future;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::job::{Job, JobEvent, JobExecuteRecord};

/// Live job changes following a snapshot.
pub type JobEventStream<E> = BoxStream<'static, Result<JobEvent, E>>;

/// Names of jobs an operator asked to kill.
pub type KillRequestStream<E> = BoxStream<'static, Result<String, E>>;

/// Read side of the job catalog.
pub trait JobCatalog: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Current set of jobs plus a stream of every change made after it.
    ///
    /// Implementations must start watching before reading the snapshot so no
    /// change can fall between the two.
    fn snapshot_and_watch(
        &self,
    ) -> impl Future<Output = Result<(Vec<Job>, JobEventStream<Self::Error>), Self::Error>> + Send;

    fn watch_kill_requests(
        &self,
    ) -> impl Future<Output = Result<KillRequestStream<Self::Error>, Self::Error>> + Send;
}

/// TTL-bound keys used for per-job locks.
///
/// Keys expire unless renewed, so a crashed holder never blocks a job for
/// longer than one TTL.
pub trait LockStore: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically create `key`. Returns its revision, or `None` if someone holds it.
    fn try_create(
        &self,
        key: String,
        holder: Bytes,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send;

    /// Revision-checked rewrite that restarts the TTL. Fails if the key changed hands.
    fn renew(
        &self,
        key: String,
        holder: Bytes,
        revision: u64,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    /// Delete `key` only if it is still at `revision`, the last one this
    /// holder wrote. Errors if the key has moved on, for example because
    /// another worker took it over after our lease lapsed.
    fn release(
        &self,
        key: String,
        revision: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Destination for finished executions (log shipping, history).
pub trait ResultSink: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    fn publish_result(
        &self,
        record: JobExecuteRecord,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
