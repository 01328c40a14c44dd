//! Store watchers feeding the plan table and the execution registry.
//!
//! Both watchers resubscribe with exponential backoff when the store goes
//! away. While disconnected the scheduler keeps firing from the last known
//! plan table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    backoff::backoff_with_jitter, planner::SchedulePlanner, registry::ExecutionRegistry,
    traits::JobCatalog,
};

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Sleep before the next subscribe attempt. Returns false if shut down meanwhile.
async fn wait_before_retry(attempt: u32, shutdown: &CancellationToken) -> bool {
    let delay = backoff_with_jitter(RECONNECT_BASE, attempt, RECONNECT_MAX);
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Keeps the plan table in step with the job catalog.
pub struct JobWatcher<C: JobCatalog> {
    catalog: C,
    planner: Arc<SchedulePlanner>,
}

impl<C: JobCatalog> JobWatcher<C> {
    pub fn new(catalog: C, planner: Arc<SchedulePlanner>) -> Self {
        Self { catalog, planner }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            let watched = tokio::select! {
                _ = shutdown.cancelled() => return,
                watched = self.catalog.snapshot_and_watch() => watched,
            };
            match watched {
                Ok((jobs, mut events)) => {
                    attempt = 0;
                    self.planner.hydrate(jobs, Utc::now());
                    loop {
                        let event = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            event = events.next() => event,
                        };
                        match event {
                            Some(Ok(event)) => self.planner.apply(event),
                            Some(Err(e)) => {
                                warn!(error = %e, "Job watch failed, resubscribing");
                                break;
                            }
                            None => {
                                warn!("Job watch stream ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(attempt, error = %e, "Failed to watch jobs"),
            }
            attempt += 1;
            if !wait_before_retry(attempt, &shutdown).await {
                return;
            }
        }
    }
}

/// Cancels local executions named by kill requests.
pub struct KillWatcher<C: JobCatalog> {
    catalog: C,
    registry: Arc<ExecutionRegistry>,
}

impl<C: JobCatalog> KillWatcher<C> {
    pub fn new(catalog: C, registry: Arc<ExecutionRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            let watched = tokio::select! {
                _ = shutdown.cancelled() => return,
                watched = self.catalog.watch_kill_requests() => watched,
            };
            match watched {
                Ok(mut requests) => {
                    attempt = 0;
                    loop {
                        let request = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            request = requests.next() => request,
                        };
                        match request {
                            Some(Ok(name)) => {
                                if self.registry.cancel(&name) {
                                    info!(job = %name, "Kill request received, cancelling execution");
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Kill watch failed, resubscribing");
                                break;
                            }
                            None => {
                                warn!("Kill watch stream ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(attempt, error = %e, "Failed to watch kill requests"),
            }
            attempt += 1;
            if !wait_before_retry(attempt, &shutdown).await {
                return;
            }
        }
    }
}
