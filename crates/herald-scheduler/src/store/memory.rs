use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{stale_cutoff, JobStore, RecoveryReport, STALE_EXHAUSTED, STALE_RECOVERED};
use crate::error::{Result, SchedulerError};
use crate::retry::RetryPolicy;
use crate::types::{Claim, DeliveryRecord, Job, JobFilter, JobState, NewJob};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    deliveries: Vec<DeliveryRecord>,
}

/// In-process [`JobStore`]; one mutex makes every operation atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    retry: RetryPolicy,
}

const IN_FLIGHT: &[JobState] = &[JobState::Claimed, JobState::Executing];

impl MemoryJobStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retry,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SchedulerError::StoreConsistency("job store lock poisoned".to_string()))
    }

    /// Apply `f` to the job if it is in one of the `expected` states and
    /// still held under `claim`.
    fn transition<T>(
        &self,
        claim: &Claim,
        expected: &[JobState],
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<T> {
        let id = &claim.job_id;
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.clone() })?;
        if !expected.contains(&job.state) {
            return Err(SchedulerError::StoreConsistency(format!(
                "job {id} is {}, expected one of {expected:?}",
                job.state
            )));
        }
        if job.attempt_count != claim.attempt || job.claimed_at != Some(claim.claimed_at) {
            warn!(job_id = %id, attempt = claim.attempt, current = job.attempt_count, "claim superseded");
            return Err(SchedulerError::StoreConsistency(format!(
                "job {id}: claim for attempt {} was superseded",
                claim.attempt
            )));
        }
        job.updated_at = now;
        Ok(f(job))
    }
}

fn new_record(job: NewJob, now: DateTime<Utc>) -> Job {
    Job {
        id: Uuid::new_v4().to_string(),
        name: job.name,
        trigger: job.trigger,
        payload: job.payload,
        state: JobState::Scheduled,
        next_fire_at: Some(job.next_fire_at),
        group_id: job.group_id,
        attempt_count: 0,
        run_count: 0,
        last_fired_at: None,
        last_error: None,
        claimed_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn release(job: &mut Job, state: JobState, next_fire_at: Option<DateTime<Utc>>) {
    job.state = state;
    job.next_fire_at = next_fire_at;
    job.claimed_at = None;
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<String> {
        let record = new_record(job, now);
        let id = record.id.clone();
        self.lock()?.jobs.insert(id.clone(), record);
        debug!(job_id = %id, "job created");
        Ok(id)
    }

    fn create_many(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<Vec<String>> {
        let records: Vec<Job> = jobs.into_iter().map(|j| new_record(j, now)).collect();
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let mut inner = self.lock()?;
        inner
            .jobs
            .extend(records.into_iter().map(|r| (r.id.clone(), r)));
        debug!(count = ids.len(), "jobs created");
        Ok(ids)
    }

    fn get(&self, id: &str) -> Result<Job> {
        self.lock()?
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut inner = self.lock()?;
        let mut due: Vec<(DateTime<Utc>, String)> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled)
            .filter_map(|j| j.next_fire_at.filter(|t| *t <= now).map(|t| (t, j.id.clone())))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.state = JobState::Claimed;
                job.attempt_count += 1;
                job.claimed_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    fn mark_executing(&self, claim: &Claim, now: DateTime<Utc>) -> Result<()> {
        self.transition(claim, &[JobState::Claimed], now, |job| {
            job.state = JobState::Executing;
        })
    }

    fn mark_completed(&self, claim: &Claim, now: DateTime<Utc>) -> Result<()> {
        self.transition(claim, IN_FLIGHT, now, |job| {
            release(job, JobState::Completed, None);
            job.run_count += 1;
            job.last_fired_at = Some(now);
            job.last_error = None;
        })
    }

    fn mark_failed(
        &self,
        claim: &Claim,
        retry: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        let policy = self.retry;
        let state = self.transition(claim, IN_FLIGHT, now, |job| {
            job.last_error = Some(reason.to_string());
            if retry && !policy.exhausted(job.attempt_count) {
                let next = policy.next_attempt_at(now, job.attempt_count);
                release(job, JobState::Scheduled, Some(next));
            } else {
                release(job, JobState::Failed, None);
            }
            job.state
        })?;
        warn!(job_id = %claim.job_id, %state, %reason, "delivery failed");
        Ok(state)
    }

    fn reschedule(&self, claim: &Claim, next_fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        self.transition(claim, IN_FLIGHT, now, |job| {
            release(job, JobState::Scheduled, Some(next_fire_at));
            job.run_count += 1;
            job.attempt_count = 0;
            job.last_fired_at = Some(now);
            job.last_error = None;
        })
    }

    fn skip_occurrence(
        &self,
        claim: &Claim,
        next_fire_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(claim, IN_FLIGHT, now, |job| {
            release(job, JobState::Scheduled, Some(next_fire_at));
            job.attempt_count = 0;
            job.last_error = Some(reason.to_string());
        })
    }

    fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Scheduled => {
                release(job, JobState::Cancelled, None);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn cancel_group(&self, group_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut n = 0;
        for job in inner.jobs.values_mut().filter(|j| {
            j.state == JobState::Scheduled && j.group_id.as_deref() == Some(group_id)
        }) {
            release(job, JobState::Cancelled, None);
            job.updated_at = now;
            n += 1;
        }
        Ok(n)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            (a.next_fire_at.is_none(), a.next_fire_at, a.created_at, &a.id).cmp(&(
                b.next_fire_at.is_none(),
                b.next_fire_at,
                b.created_at,
                &b.id,
            ))
        });
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn recover_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<RecoveryReport> {
        let cutoff = stale_cutoff(now, timeout);
        let mut inner = self.lock()?;
        let mut report = RecoveryReport::default();
        for job in inner.jobs.values_mut() {
            let stale = IN_FLIGHT.contains(&job.state) && job.claimed_at.is_some_and(|c| c <= cutoff);
            if !stale {
                continue;
            }
            job.updated_at = now;
            if self.retry.exhausted(job.attempt_count) {
                release(job, JobState::Failed, None);
                job.last_error = Some(STALE_EXHAUSTED.to_string());
                report.failed += 1;
            } else {
                release(job, JobState::Scheduled, Some(now));
                job.last_error = Some(STALE_RECOVERED.to_string());
                report.requeued += 1;
            }
        }
        if report != RecoveryReport::default() {
            warn!(requeued = report.requeued, failed = report.failed, "stale claims recovered");
        }
        Ok(report)
    }

    fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.lock()?.deliveries.push(record.clone());
        Ok(())
    }

    fn deliveries(&self, job_id: &str) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .lock()?
            .deliveries
            .iter()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}
