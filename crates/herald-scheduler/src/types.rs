use chrono::{DateTime, Utc};
use herald_core::Payload;
use serde::{Deserialize, Serialize};

/// Defines when a job becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire exactly once at the given UTC instant.
    OneShot { at: DateTime<Utc> },

    /// Fire at `start + k * every_secs` for k = 0, 1, 2, …
    Interval {
        every_secs: u64,
        start: DateTime<Utc>,
    },

    /// Fire on every local time matching `expression` in `timezone` (IANA name).
    Cron {
        expression: String,
        #[serde(default = "utc_name")]
        timezone: String,
    },
}

fn utc_name() -> String {
    "UTC".to_string()
}

impl Trigger {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Trigger::OneShot { .. })
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::OneShot { at } => write!(f, "once at {}", at.to_rfc3339()),
            Trigger::Interval { every_secs, start } => {
                write!(f, "every {every_secs}s from {}", start.to_rfc3339())
            }
            Trigger::Cron {
                expression,
                timezone,
            } => write!(f, "cron '{expression}' ({timezone})"),
        }
    }
}

/// Lifecycle state of a job.
///
/// `Scheduled → Claimed → Executing → {Completed | Scheduled (retry/recur) | Failed}`;
/// `Cancelled` is only reachable from `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `next_fire_at`.
    Scheduled,
    /// Owned by one scheduler pass, not yet handed to the executor.
    Claimed,
    /// The executor is talking to the gateway.
    Executing,
    /// One-shot job delivered.
    Completed,
    /// Gave up; surfaced to operators.
    Failed,
    /// Cancelled while still scheduled.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Claimed => "claimed",
            JobState::Executing => "executing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobState::Scheduled),
            "claimed" => Ok(JobState::Claimed),
            "executing" => Ok(JobState::Executing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUID v4 string, assigned at creation.
    pub id: String,
    /// Human-readable label; recurring broadcasts are looked up by it.
    pub name: String,
    pub trigger: Trigger,
    pub payload: Payload,
    pub state: JobState,
    /// `None` once a one-shot job is terminal.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Shared by every job created from one sequence.
    pub group_id: Option<String>,
    /// Claims since the last success; drives backoff and give-up.
    pub attempt_count: u32,
    /// Successful fires.
    pub run_count: u32,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// When the current claim was taken; used by the stale-claim sweep.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The claim this record currently carries, if it is in flight.
    pub fn claim(&self) -> Option<Claim> {
        match (self.state, self.claimed_at) {
            (JobState::Claimed | JobState::Executing, Some(claimed_at)) => Some(Claim {
                job_id: self.id.clone(),
                attempt: self.attempt_count,
                claimed_at,
            }),
            _ => None,
        }
    }
}

/// Proof of one claim on a job, taken from a record returned by `claim_due`.
///
/// Every post-claim transition is checked against it; once the claim is
/// recovered as stale and taken again, the old holder's updates are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: String,
    pub attempt: u32,
    pub claimed_at: DateTime<Utc>,
}

/// Everything needed to create a job; the store assigns id and state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub trigger: Trigger,
    pub payload: Payload,
    pub next_fire_at: DateTime<Utc>,
    pub group_id: Option<String>,
}

/// Read-only query over the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |s| s == job.state)
            && self
                .group_id
                .as_deref()
                .map_or(true, |g| job.group_id.as_deref() == Some(g))
            && self.name.as_deref().map_or(true, |n| job.name == n)
    }
}

/// Operator-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub state: JobState,
    pub trigger: Trigger,
    pub target: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub group_id: Option<String>,
    pub attempt_count: u32,
    pub run_count: u32,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            state: job.state,
            trigger: job.trigger.clone(),
            target: job.payload.target.to_string(),
            next_fire_at: job.next_fire_at,
            group_id: job.group_id.clone(),
            attempt_count: job.attempt_count,
            run_count: job.run_count,
            last_fired_at: job.last_fired_at,
            last_error: job.last_error.clone(),
        }
    }
}

/// One execution of a job, appended to the delivery history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub job_id: String,
    pub attempt: u32,
    pub fired_at: DateTime<Utc>,
    pub succeeded: usize,
    /// `(target, reason)` for every target the gateway did not accept.
    pub failed: Vec<(String, String)>,
}
