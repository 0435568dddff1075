//! Sequence composer: one composite request → several one-shot jobs sharing a
//! `group_id`, so the whole sequence can be cancelled at once.

use chrono::{DateTime, Duration, Utc};
use herald_core::types::{NotificationKind, Payload, Priority, PushMessage, TargetSelector};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, SchedulerError};
use crate::types::{NewJob, Trigger};

/// One offset of a sequence. Step-level `target` / `message` replace the
/// sequence defaults for that step only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    /// Minutes before the anchor; `0` fires at the anchor itself.
    pub minutes_before: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<PushMessage>,
}

impl SequenceStep {
    pub fn at(minutes_before: u32) -> Self {
        Self {
            minutes_before,
            target: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    /// Base name for the generated jobs.
    pub name: String,
    pub anchor: DateTime<Utc>,
    pub steps: Vec<SequenceStep>,
    pub target: TargetSelector,
    /// Template; `{minutes}` is replaced with each step's offset.
    pub message: PushMessage,
}

impl SequenceSpec {
    pub fn new(
        name: impl Into<String>,
        anchor: DateTime<Utc>,
        offsets: &[u32],
        template: Payload,
    ) -> Self {
        Self {
            name: name.into(),
            anchor,
            steps: offsets.iter().copied().map(SequenceStep::at).collect(),
            target: template.target,
            message: template.message,
        }
    }

    /// Reminders to the tournament's own topic, then a high-priority
    /// announcement to everyone following tournaments when it starts.
    pub fn tournament(
        tournament_id: &str,
        tournament_name: &str,
        start: DateTime<Utc>,
        reminder_minutes: &[u32],
    ) -> Self {
        let route_params = json!({ "tournament_id": tournament_id });
        let reminder = |minutes: u32| SequenceStep {
            minutes_before: minutes,
            target: None,
            message: Some(
                PushMessage::new(
                    NotificationKind::Tournament,
                    "🏆 Tournament Starting Soon!",
                    format!("{tournament_name} starts in {minutes} minutes!"),
                )
                .with_route("tournament_detail", Some(route_params.clone()))
                .with_data("tournament_id", tournament_id)
                .with_data("minutes_until", minutes),
            ),
        };

        let mut steps: Vec<SequenceStep> = reminder_minutes
            .iter()
            .copied()
            .filter(|m| *m > 0)
            .map(reminder)
            .collect();
        steps.push(SequenceStep {
            minutes_before: 0,
            target: Some(TargetSelector::Topic {
                topic: "tournaments".to_string(),
            }),
            message: Some(
                PushMessage::new(
                    NotificationKind::Tournament,
                    "🏆 Tournament Started!",
                    format!("{tournament_name} has begun! Join now to compete!"),
                )
                .with_priority(Priority::High)
                .with_route("tournament_detail", Some(route_params.clone()))
                .with_data("tournament_id", tournament_id)
                .with_data("action", "join"),
            ),
        });

        Self {
            name: format!("tournament:{tournament_id}"),
            anchor: start,
            steps,
            target: TargetSelector::Topic {
                topic: format!("tournament_{tournament_id}"),
            },
            message: PushMessage::new(
                NotificationKind::Tournament,
                "🏆 Tournament Starting Soon!",
                format!("{tournament_name} starts in {{minutes}} minutes!"),
            ),
        }
    }
}

/// Expand `spec` into jobs relative to `now`.
///
/// Offsets whose fire time is already past are dropped; one landing exactly
/// on `now` is kept. Every step payload is validated, including skipped ones,
/// so a bad request is rejected regardless of timing.
pub fn compose(spec: &SequenceSpec, group_id: &str, now: DateTime<Utc>) -> Result<Vec<NewJob>> {
    if spec.steps.is_empty() {
        return Err(SchedulerError::InvalidTrigger(
            "sequence needs at least one offset".to_string(),
        ));
    }

    let mut jobs = Vec::with_capacity(spec.steps.len());
    for step in &spec.steps {
        let message = match &step.message {
            Some(m) => m.clone(),
            None => spec
                .message
                .render(&[("minutes", step.minutes_before.to_string())]),
        };
        let payload = Payload::new(
            step.target.clone().unwrap_or_else(|| spec.target.clone()),
            message,
        );
        payload.validate()?;

        let at = spec.anchor - Duration::minutes(i64::from(step.minutes_before));
        if at < now {
            continue;
        }
        let name = if step.minutes_before == 0 {
            format!("{} (start)", spec.name)
        } else {
            format!("{} (T-{}min)", spec.name, step.minutes_before)
        };
        jobs.push(NewJob {
            name,
            trigger: Trigger::OneShot { at },
            payload,
            next_fire_at: at,
            group_id: Some(group_id.to_string()),
        });
    }
    Ok(jobs)
}
