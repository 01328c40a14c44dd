//! # trogon-crontab
//!
//! Distributed crontab workers coordinated through NATS KV.
//!
//! ## Features
//!
//! - Job definitions stored in NATS KV (`crontab_jobs` bucket) and hot-reloaded
//!   by every worker through a KV watch.
//! - Cron expressions with 5 (classic crontab), 6 (with seconds) or 7 (with
//!   year) fields.
//! - Every worker plans every job; a per-job lease lock in the `crontab_locks`
//!   bucket makes each fire run on at most one worker. A crashed worker's locks
//!   expire after the lease TTL.
//! - A job never overlaps itself: a fire that finds the previous execution
//!   still running is skipped.
//! - Running jobs can be killed by name through a `kill.<name>` key.
//! - Output and timing of every execution are published on
//!   `crontab.results.<name>`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trogon_crontab::{NatsJobCatalog, NatsLockStore, Worker, WorkerConfig, kv};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trogon_crontab::CronError> {
//!     let nats = async_nats::connect("nats://localhost:4222").await.unwrap();
//!     let js = async_nats::jetstream::new(nats.clone());
//!     let config = WorkerConfig::default();
//!     let jobs = kv::get_or_create_jobs_bucket(&js).await?;
//!     let locks = kv::get_or_create_locks_bucket(&js, config.lock_ttl).await?;
//!
//!     let worker = Worker::new(
//!         config,
//!         NatsJobCatalog::new(jobs, locks.clone()),
//!         NatsLockStore::new(locks),
//!         nats,
//!     )?;
//!     worker.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Job example (JSON stored in NATS KV under key `jobs.backup`)
//!
//! ```json
//! { "name": "backup", "command": "pg_dump main > /tmp/main.sql", "cronExpr": "30 2 * * *" }
//! ```

mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod kv;
pub mod lock;
pub mod nats_impls;
pub mod planner;
pub mod registry;
pub mod reporter;
pub mod scheduler;
pub mod traits;
pub mod watcher;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use client::CrontabClient;
pub use config::{ShellConfig, WorkerConfig};
pub use error::{CronError, ExecutionError};
pub use job::{Job, JobEvent, JobExecuteInfo, JobExecuteRecord, JobExecuteResult};
pub use lock::{LockManager, LockOutcome};
pub use nats_impls::{NatsJobCatalog, NatsLockStore};
pub use planner::{JobSchedulePlan, SchedulePlanner, parse_cron_expr};
pub use registry::{ExecutionRegistry, StartOutcome};
pub use traits::{JobCatalog, LockStore, ResultSink};
pub use worker::Worker;
