//! Plan table: job name → next fire time.
//!
//! The table is a `BTreeMap` so due plans come out in lexical name order,
//! which keeps firing order deterministic when several jobs share an instant.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::{
    error::CronError,
    job::{Job, JobEvent},
};

/// Compile a 5-, 6- or 7-field cron expression.
///
/// - 5 fields: `min hour dom month dow`, fires at second 0.
/// - 6 fields: `sec min hour dom month dow`.
/// - 7 fields: as 6, plus a trailing year.
///
/// Numeric weekdays use the classic numbering in every form: 0 or 7 is
/// Sunday, 1 is Monday.
pub fn parse_cron_expr(expr: &str) -> Result<cron::Schedule, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let dow = classic_weekdays(fields[4]);
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
        }
        6 | 7 => {
            let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
            fields[5] = classic_weekdays(&fields[5]);
            fields.join(" ")
        }
        n => {
            return Err(CronError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: format!("expected 5, 6 or 7 fields, got {n}"),
            });
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| CronError::InvalidCronExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite a classic weekday field for the `cron` crate, which numbers
/// weekdays 1-7 starting on Sunday.
///
/// Numeric ranges and steps are expanded to explicit lists before mapping,
/// since a range ending on Sunday (`5-7`, `6-0`) would otherwise wrap
/// around. Names and anything unrecognised pass through untouched.
fn classic_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(classic_weekday_part)
        .collect::<Vec<_>>()
        .join(",")
}

fn classic_weekday_part(part: &str) -> String {
    let (values, step) = match part.split_once('/') {
        Some((values, step)) => match step.parse::<usize>() {
            Ok(step) if step > 0 => (values, step),
            _ => return part.to_string(),
        },
        None => (part, 1),
    };
    let (start, end) = match values.split_once('-') {
        Some(bounds) => bounds,
        // `*` already means every day in both numberings.
        None if values == "*" => return part.to_string(),
        // `n/step` runs from n to the end of the week.
        None if step > 1 => (values, "7"),
        None => (values, values),
    };
    let (Ok(start), Ok(end)) = (start.parse::<u8>(), end.parse::<u8>()) else {
        return part.to_string();
    };
    let end = if end == 0 && start > 0 { 7 } else { end };
    if start > end || end > 7 {
        return part.to_string();
    }

    let mut days: Vec<u8> = (start..=end).step_by(step).map(|n| (n % 7) + 1).collect();
    days.sort_unstable();
    days.dedup();
    days.iter().map(u8::to_string).collect::<Vec<_>>().join(",")
}

/// A job paired with its compiled schedule and the next instant it is due.
#[derive(Debug, Clone)]
pub struct JobSchedulePlan {
    pub job: Job,
    pub schedule: cron::Schedule,
    pub next_time: DateTime<Utc>,
}

impl JobSchedulePlan {
    /// Compile the job's expression and compute the first fire strictly after `now`.
    pub fn build(job: Job, now: DateTime<Utc>) -> Result<Self, CronError> {
        job.validate()?;
        let schedule = parse_cron_expr(&job.cron_expr)?;
        let next_time = schedule
            .after(&now)
            .next()
            .ok_or_else(|| CronError::NoUpcomingFireTime {
                expr: job.cron_expr.clone(),
            })?;
        Ok(Self {
            job,
            schedule,
            next_time,
        })
    }

    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.next_time <= at
    }

    /// Move `next_time` past `now`. Returns false once the schedule is exhausted.
    fn advance(&mut self, now: DateTime<Utc>) -> bool {
        match self.schedule.after(&now).next() {
            Some(next) => {
                self.next_time = next;
                true
            }
            None => false,
        }
    }
}

/// A plan selected by [`SchedulePlanner::fire_due`].
#[derive(Debug, Clone)]
pub struct FiredPlan {
    pub job: Job,
    /// The `next_time` the plan held when it was selected.
    pub plan_time: DateTime<Utc>,
}

/// Owner of the plan table.
///
/// Every mutation wakes the scheduler loop so a newly saved job that is due
/// sooner than the current sleep is not delayed until the next poll.
#[derive(Debug, Default)]
pub struct SchedulePlanner {
    plans: Mutex<BTreeMap<String, JobSchedulePlan>>,
    changed: Notify,
}

impl SchedulePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn plans(&self) -> MutexGuard<'_, BTreeMap<String, JobSchedulePlan>> {
        // A panic while holding the lock cannot leave a map half-mutated.
        self.plans.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn upsert(&self, job: Job) -> Result<DateTime<Utc>, CronError> {
        self.upsert_at(job, Utc::now())
    }

    /// Insert or replace the plan for `job.name`, computing the first fire after `now`.
    ///
    /// On error nothing is inserted and any plan previously held under the same
    /// name is dropped: the job stays unschedulable until a valid definition
    /// is saved.
    pub fn upsert_at(&self, job: Job, now: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let name = job.name.clone();
        let result = JobSchedulePlan::build(job, now);
        let mut plans = self.plans();
        let outcome = match result {
            Ok(plan) => {
                let next = plan.next_time;
                plans.insert(name, plan);
                Ok(next)
            }
            Err(e) => {
                plans.remove(&name);
                Err(e)
            }
        };
        drop(plans);
        self.changed.notify_one();
        outcome
    }

    /// Remove a plan. Removing an absent name is a no-op.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.plans().remove(name).is_some();
        if removed {
            self.changed.notify_one();
        }
        removed
    }

    /// Apply a catalog change. Invalid definitions are logged and left unscheduled.
    pub fn apply(&self, event: JobEvent) {
        match event {
            JobEvent::Save(job) => {
                let name = job.name.clone();
                match self.upsert(job) {
                    Ok(next) => tracing::info!(job = %name, next_time = %next, "Job scheduled"),
                    Err(e) => {
                        tracing::error!(job = %name, error = %e, "Invalid job definition, not scheduled")
                    }
                }
            }
            JobEvent::Delete(name) => {
                if self.remove(&name) {
                    tracing::info!(job = %name, "Job unscheduled");
                }
            }
        }
    }

    /// Reconcile the table with a full catalog snapshot.
    ///
    /// Plans whose job is absent from the snapshot are dropped. Plans whose job
    /// definition is unchanged keep their `next_time`, so reconnecting to the
    /// store does not skip a fire that is already due.
    pub fn hydrate(&self, jobs: Vec<Job>, now: DateTime<Utc>) {
        let names: HashSet<String> = jobs.iter().map(|j| j.name.clone()).collect();
        let mut plans = self.plans();
        plans.retain(|name, _| names.contains(name));
        for job in jobs {
            if plans.get(&job.name).is_some_and(|p| p.job == job) {
                continue;
            }
            let name = job.name.clone();
            match JobSchedulePlan::build(job, now) {
                Ok(plan) => {
                    plans.insert(name, plan);
                }
                Err(e) => {
                    plans.remove(&name);
                    tracing::error!(job = %name, error = %e, "Skipping invalid job during hydration");
                }
            }
        }
        let count = plans.len();
        drop(plans);
        tracing::info!(job_count = count, "Plan table hydrated");
        self.changed.notify_one();
    }

    /// All plans with `next_time <= at`, in lexical name order.
    pub fn due_before(&self, at: DateTime<Utc>) -> Vec<JobSchedulePlan> {
        self.plans()
            .values()
            .filter(|p| p.is_due(at))
            .cloned()
            .collect()
    }

    /// Select every due plan and immediately advance it past `now`.
    ///
    /// Advancing happens here rather than after execution so that lock
    /// contention or a failed run never stalls future fires of the job.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Vec<FiredPlan> {
        let mut plans = self.plans();
        let mut fired = Vec::new();
        let mut exhausted = Vec::new();
        for (name, plan) in plans.iter_mut().filter(|(_, p)| p.is_due(now)) {
            fired.push(FiredPlan {
                job: plan.job.clone(),
                plan_time: plan.next_time,
            });
            if !plan.advance(now) {
                exhausted.push(name.clone());
            }
        }
        for name in exhausted {
            tracing::info!(job = %name, "Schedule exhausted, removing plan");
            plans.remove(&name);
        }
        fired
    }

    /// Earliest `next_time` across all plans.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.plans().values().map(|p| p.next_time).min()
    }

    pub fn get(&self, name: &str) -> Option<JobSchedulePlan> {
        self.plans().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.plans().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next table mutation (or immediately if one happened
    /// since the last call).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
