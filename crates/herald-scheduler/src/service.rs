use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::config::RecurringJobConfig;
use herald_core::Payload;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    executor::{DeliveryExecutor, DeliveryResult},
    sequence::{compose, SequenceSpec},
    store::JobStore,
    trigger::{self, compute_next_fire},
    types::{DeliveryRecord, Job, JobFilter, JobState, JobSummary, NewJob, Trigger},
};

/// Ids created by one sequence request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceHandle {
    pub group_id: String,
    pub job_ids: Vec<String>,
}

/// Result of reconciling a configured recurring job with the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created { id: String },
    Unchanged { id: String },
    Replaced { id: String, cancelled: Vec<String> },
}

/// Entry point for everything that creates, inspects or cancels jobs.
///
/// Creation-time validation lives here: a malformed trigger or payload is
/// rejected before anything reaches the store.
pub struct NotificationScheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<DeliveryExecutor>,
    misfire_grace: chrono::Duration,
}

impl NotificationScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<DeliveryExecutor>,
        misfire_grace: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            misfire_grace: chrono::Duration::from_std(misfire_grace)
                .unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<DeliveryExecutor> {
        &self.executor
    }

    pub fn schedule(&self, name: &str, trigger: Trigger, payload: Payload) -> Result<String> {
        self.schedule_at(name, trigger, payload, Utc::now())
    }

    /// [`schedule`](Self::schedule) with an explicit clock.
    pub fn schedule_at(
        &self,
        name: &str,
        trigger: Trigger,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let next_fire_at = self.first_fire(&trigger, &payload, now)?;
        let id = self.store.create(
            NewJob {
                name: job_name(name, &trigger),
                trigger,
                payload,
                next_fire_at,
                group_id: None,
            },
            now,
        )?;
        Ok(id)
    }

    /// Validate and compute the first `next_fire_at`.
    fn first_fire(
        &self,
        trigger: &Trigger,
        payload: &Payload,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        payload.validate()?;
        trigger::validate(trigger, now)?;

        if let Some(next) = compute_next_fire(trigger, now)? {
            return Ok(next);
        }
        match trigger {
            // Elapsed a moment ago (clock skew, slow client): fire right away.
            Trigger::OneShot { at } if now - *at <= self.misfire_grace => Ok(now),
            Trigger::OneShot { at } => Err(SchedulerError::InvalidTrigger(format!(
                "one-shot time {} is in the past",
                at.to_rfc3339()
            ))),
            _ => Err(SchedulerError::InvalidTrigger(format!(
                "trigger {trigger} has no future occurrence"
            ))),
        }
    }

    /// `false` when the job is unknown, in flight, or already terminal.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        self.store.cancel(id, Utc::now())
    }

    pub fn cancel_group(&self, group_id: &str) -> Result<usize> {
        self.store.cancel_group(group_id, Utc::now())
    }

    pub fn list_scheduled(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        Ok(self
            .store
            .list(filter)?
            .iter()
            .map(JobSummary::from)
            .collect())
    }

    pub fn job(&self, id: &str) -> Result<Job> {
        self.store.get(id)
    }

    pub fn deliveries(&self, id: &str) -> Result<Vec<DeliveryRecord>> {
        // Distinguish "unknown job" from "never fired".
        self.store.get(id)?;
        self.store.deliveries(id)
    }

    pub fn compose_sequence(&self, spec: &SequenceSpec) -> Result<SequenceHandle> {
        self.compose_sequence_at(spec, Utc::now())
    }

    /// Create one one-shot job per future offset, all in a fresh group.
    /// Either every member is stored or none is.
    pub fn compose_sequence_at(
        &self,
        spec: &SequenceSpec,
        now: DateTime<Utc>,
    ) -> Result<SequenceHandle> {
        let group_id = Uuid::new_v4().to_string();
        let jobs = compose(spec, &group_id, now)?;
        let job_ids = self.store.create_many(jobs, now).inspect_err(|e| {
            error!(%group_id, name = %spec.name, "sequence not created: {e}");
        })?;
        info!(%group_id, name = %spec.name, count = job_ids.len(), "sequence composed");
        Ok(SequenceHandle { group_id, job_ids })
    }

    /// Deliver immediately without creating a job.
    pub async fn send_now(&self, payload: &Payload) -> Result<DeliveryResult> {
        payload.validate()?;
        self.executor.deliver(payload).await
    }

    /// Make sure exactly one active job exists for a configured recurring
    /// broadcast. Idempotent across restarts: an identical job is kept, a
    /// changed one is cancelled and replaced.
    pub fn ensure_recurring(&self, cfg: &RecurringJobConfig) -> Result<EnsureOutcome> {
        self.ensure_recurring_at(cfg, Utc::now())
    }

    pub fn ensure_recurring_at(
        &self,
        cfg: &RecurringJobConfig,
        now: DateTime<Utc>,
    ) -> Result<EnsureOutcome> {
        let trigger = Trigger::Cron {
            expression: cfg.cron.clone(),
            timezone: cfg.timezone.clone(),
        };
        let payload = Payload::new(cfg.target.clone(), cfg.message.clone());

        let active: Vec<Job> = self
            .store
            .list(&JobFilter {
                name: Some(cfg.name.clone()),
                ..JobFilter::default()
            })?
            .into_iter()
            .filter(|j| !j.state.is_terminal())
            .collect();

        if let Some(same) = active
            .iter()
            .find(|j| j.trigger == trigger && j.payload == payload)
        {
            return Ok(EnsureOutcome::Unchanged { id: same.id.clone() });
        }

        let next_fire_at = self.first_fire(&trigger, &payload, now)?;
        let mut cancelled = Vec::new();
        for job in active.iter().filter(|j| j.state == JobState::Scheduled) {
            if self.store.cancel(&job.id, now)? {
                cancelled.push(job.id.clone());
            }
        }
        let id = self.store.create(
            NewJob {
                name: cfg.name.clone(),
                trigger,
                payload,
                next_fire_at,
                group_id: None,
            },
            now,
        )?;
        info!(name = %cfg.name, job_id = %id, replaced = cancelled.len(), "recurring job ensured");

        if active.is_empty() {
            Ok(EnsureOutcome::Created { id })
        } else {
            Ok(EnsureOutcome::Replaced { id, cancelled })
        }
    }
}

fn job_name(name: &str, trigger: &Trigger) -> String {
    let name = name.trim();
    if name.is_empty() {
        trigger.to_string()
    } else {
        name.to_string()
    }
}
