use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::config::SchedulerConfig;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    executor::DeliveryExecutor,
    store::{JobStore, RecoveryReport},
    trigger::compute_next_fire,
    types::{Claim, DeliveryRecord, Job},
};

/// What happened to one claimed job during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// One-shot delivered, or a recurring trigger with no occurrences left.
    Completed,
    /// Recurring job delivered and waiting for its next occurrence.
    Rescheduled,
    /// Transient failure; back in `Scheduled` after a backoff delay.
    Retrying,
    /// Recurring job out of retries; this occurrence was abandoned.
    Skipped,
    Failed,
    /// A store transition was rejected; the stale-claim sweep will pick it up.
    Error,
}

/// Per-tick counters, mostly for tests and debug logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub retrying: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Rescheduled => self.rescheduled += 1,
            JobOutcome::Retrying => self.retrying += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Error => self.errors += 1,
        }
    }
}

/// The scheduler loop: claim due jobs, hand them to the executor, and move
/// each one to its next state.
///
/// Holds nothing but a store and an executor, so any number of loops (in one
/// process or many) can share a store; the atomic claim keeps them apart.
pub struct SchedulerLoop {
    store: Arc<dyn JobStore>,
    executor: Arc<DeliveryExecutor>,
    workers: Arc<Semaphore>,
    tick_interval: Duration,
    batch_limit: usize,
    stale_claim_timeout: Duration,
    recovery_interval: Duration,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<DeliveryExecutor>,
        cfg: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            workers: Arc::new(Semaphore::new(cfg.worker_limit.max(1))),
            tick_interval: cfg.tick_interval(),
            batch_limit: cfg.batch_limit.max(1),
            stale_claim_timeout: cfg.stale_claim_timeout(),
            recovery_interval: cfg.recovery_interval(),
        }
    }

    /// Main event loop. Ticks until `shutdown` broadcasts `true`; the stale
    /// claim sweep runs at its own, slower cadence.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            batch_limit = self.batch_limit,
            "scheduler loop started"
        );

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.recovery_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    if let Err(e) = self.recover(Utc::now()) {
                        error!("stale claim sweep failed: {e}");
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!("scheduler tick error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: claim up to `batch_limit` due jobs and drive each to its next
    /// state. Returns once every claimed job has been handled.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let jobs = self.store.claim_due(now, self.batch_limit)?;
        let mut report = TickReport {
            claimed: jobs.len(),
            ..TickReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let mut running = JoinSet::new();
        for job in jobs {
            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    // Left Claimed; the stale-claim sweep returns it to Scheduled.
                    error!(job_id = %job.id, "worker pool closed: {e}");
                    report.errors += 1;
                    continue;
                }
            };
            let store = Arc::clone(&self.store);
            let executor = Arc::clone(&self.executor);
            running.spawn(async move {
                let _permit = permit;
                process(store.as_ref(), &executor, job, now).await
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("job task panicked: {e}");
                    report.errors += 1;
                }
            }
        }
        debug!(?report, "scheduler tick finished");
        Ok(report)
    }

    /// Stale-claim recovery sweep.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        self.store.recover_stale(now, self.stale_claim_timeout)
    }
}

/// Drive one claimed job through execution to its next state.
async fn process(
    store: &dyn JobStore,
    executor: &DeliveryExecutor,
    job: Job,
    now: DateTime<Utc>,
) -> JobOutcome {
    let Some(claim) = job.claim() else {
        error!(job_id = %job.id, state = %job.state, "claimed job carries no claim");
        return JobOutcome::Error;
    };
    if let Err(e) = store.mark_executing(&claim, now) {
        error!(job_id = %job.id, "cannot start job: {e}");
        return JobOutcome::Error;
    }

    let verdict = match executor.execute(&job).await {
        Ok(result) => {
            let record = DeliveryRecord {
                job_id: job.id.clone(),
                attempt: job.attempt_count,
                fired_at: now,
                succeeded: result.succeeded.len(),
                failed: result.failure_pairs(),
            };
            if let Err(e) = store.record_delivery(&record) {
                warn!(job_id = %job.id, "delivery history not recorded: {e}");
            }
            result.verdict()
        }
        Err(e) => Err(e),
    };

    match finish(store, &job, &claim, verdict, now) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(job_id = %job.id, "job state update failed: {e}");
            JobOutcome::Error
        }
    }
}

fn finish(
    store: &dyn JobStore,
    job: &Job,
    claim: &Claim,
    verdict: Result<()>,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    match verdict {
        Ok(()) => {
            if !job.trigger.is_recurring() {
                store.mark_completed(claim, now)?;
                return Ok(JobOutcome::Completed);
            }
            match next_occurrence(job, now)? {
                Some(next) => {
                    store.reschedule(claim, next, now)?;
                    Ok(JobOutcome::Rescheduled)
                }
                None => {
                    info!(job_id = %job.id, "recurring trigger has no further occurrences");
                    store.mark_completed(claim, now)?;
                    Ok(JobOutcome::Completed)
                }
            }
        }

        Err(SchedulerError::TransientDelivery(reason)) => {
            let policy = store.retry_policy();
            if job.trigger.is_recurring() && policy.exhausted(job.attempt_count) {
                if let Some(next) = next_occurrence(job, now)? {
                    store.skip_occurrence(claim, next, &reason, now)?;
                    return Ok(JobOutcome::Skipped);
                }
            }
            match store.mark_failed(claim, true, &reason, now)? {
                crate::types::JobState::Scheduled => Ok(JobOutcome::Retrying),
                _ => Ok(JobOutcome::Failed),
            }
        }

        Err(other) => {
            store.mark_failed(claim, false, &other.to_string(), now)?;
            Ok(JobOutcome::Failed)
        }
    }
}

/// Next regular fire time, measured from whichever is later: now, or the
/// occurrence being handled (a retry may run before its nominal slot passes).
fn next_occurrence(job: &Job, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let reference = job.next_fire_at.map_or(now, |at| at.max(now));
    compute_next_fire(&job.trigger, reference)
}
