use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::job::JobExecuteInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    /// An execution of this job is already in flight on this worker.
    AlreadyRunning,
}

#[derive(Debug)]
pub struct ExecutionEntry {
    pub info: JobExecuteInfo,
    pub handle: Option<JoinHandle<()>>,
}

/// In-flight executions on this worker, keyed by job name.
///
/// Guards against a job overlapping itself locally; the distributed lock
/// covers overlap across workers.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: Mutex<HashMap<String, ExecutionEntry>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ExecutionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_start(&self, info: JobExecuteInfo) -> StartOutcome {
        let mut entries = self.entries();
        if entries.contains_key(&info.job.name) {
            return StartOutcome::AlreadyRunning;
        }
        entries.insert(info.job.name.clone(), ExecutionEntry { info, handle: None });
        StartOutcome::Accepted
    }

    /// Store the task driving `execution_id`. Ignored if that execution already finished.
    pub fn attach(&self, name: &str, execution_id: Uuid, handle: JoinHandle<()>) {
        if let Some(entry) = self
            .entries()
            .get_mut(name)
            .filter(|e| e.info.execution_id == execution_id)
        {
            entry.handle = Some(handle);
        }
    }

    /// Remove the entry for `name` if it still belongs to `execution_id`.
    pub fn finish(&self, name: &str, execution_id: Uuid) -> Option<ExecutionEntry> {
        let mut entries = self.entries();
        if entries
            .get(name)
            .is_some_and(|e| e.info.execution_id == execution_id)
        {
            entries.remove(name)
        } else {
            None
        }
    }

    /// Signal the running execution of `name`. Returns whether one existed.
    pub fn cancel(&self, name: &str) -> bool {
        match self.entries().get(name) {
            Some(entry) => {
                entry.info.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything and hand back the task handles so the caller can wait on them.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        let mut entries = self.entries();
        entries
            .values_mut()
            .filter_map(|entry| {
                entry.info.cancel.cancel();
                entry.handle.take()
            })
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.entries().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
