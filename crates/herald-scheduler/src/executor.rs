use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use herald_core::{Payload, PushMessage};
use herald_push::{DeliveryTarget, GatewayError, PushGateway, TargetResolver};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::types::Job;

/// One target the gateway did not accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub target: DeliveryTarget,
    pub reason: String,
    /// Whether a later attempt could succeed (timeout, rate limit, 5xx).
    pub transient: bool,
}

/// Per-target outcome of one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub succeeded: Vec<DeliveryTarget>,
    pub failed: Vec<TargetFailure>,
}

impl DeliveryResult {
    /// Overall verdict for the job.
    ///
    /// Any accepted target makes the delivery a success; per-target failures
    /// are only logged. With nothing accepted the job fails, transiently if at
    /// least one target may still succeed on retry.
    pub fn verdict(&self) -> Result<()> {
        if !self.succeeded.is_empty() {
            return Ok(());
        }
        let Some(first) = self.failed.first() else {
            return Err(SchedulerError::PermanentDelivery(
                "selector resolved to no delivery targets".to_string(),
            ));
        };
        let summary = if self.failed.len() == 1 {
            format!("{}: {}", first.target, first.reason)
        } else {
            format!(
                "all {} targets failed, first {}: {}",
                self.failed.len(),
                first.target,
                first.reason
            )
        };
        if self.failed.iter().any(|f| f.transient) {
            Err(SchedulerError::TransientDelivery(summary))
        } else {
            Err(SchedulerError::PermanentDelivery(summary))
        }
    }

    /// `(target, reason)` pairs for the delivery history.
    pub fn failure_pairs(&self) -> Vec<(String, String)> {
        self.failed
            .iter()
            .map(|f| (f.target.to_string(), f.reason.clone()))
            .collect()
    }
}

/// Turns a job payload into gateway calls.
///
/// Targets are resolved through the registry, then sent concurrently (at most
/// `fanout_limit` in flight), each call bounded by `send_timeout`. There is
/// no deduplication: a job recovered after a crash may be delivered twice.
pub struct DeliveryExecutor {
    gateway: Arc<dyn PushGateway>,
    resolver: Arc<dyn TargetResolver>,
    send_timeout: Duration,
    fanout_limit: usize,
}

impl DeliveryExecutor {
    pub fn new(
        gateway: Arc<dyn PushGateway>,
        resolver: Arc<dyn TargetResolver>,
        send_timeout: Duration,
        fanout_limit: usize,
    ) -> Self {
        Self {
            gateway,
            resolver,
            send_timeout,
            fanout_limit: fanout_limit.max(1),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn PushGateway> {
        &self.gateway
    }

    /// Deliver a claimed job's payload.
    pub async fn execute(&self, job: &Job) -> Result<DeliveryResult> {
        debug!(job_id = %job.id, name = %job.name, attempt = job.attempt_count, "executing job");
        let result = self.deliver(&job.payload).await?;
        info!(
            job_id = %job.id,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "job delivery finished"
        );
        Ok(result)
    }

    /// Resolve and send a payload. Errors only when the registry lookup itself
    /// fails; gateway failures are reported per target in the result.
    pub async fn deliver(&self, payload: &Payload) -> Result<DeliveryResult> {
        let targets = self.resolver.resolve(&payload.target).map_err(|e| {
            SchedulerError::TransientDelivery(format!("target resolution failed: {e}"))
        })?;

        let message = &payload.message;
        let outcomes: Vec<(DeliveryTarget, std::result::Result<(), GatewayError>)> =
            stream::iter(targets)
                .map(|target| async move {
                    let outcome = self.send_one(&target, message).await;
                    (target, outcome)
                })
                .buffer_unordered(self.fanout_limit)
                .collect()
                .await;

        let mut result = DeliveryResult::default();
        for (target, outcome) in outcomes {
            match outcome {
                Ok(()) => result.succeeded.push(target),
                Err(e) => {
                    warn!(%target, error = %e, transient = e.is_transient(), "push to target failed");
                    result.failed.push(TargetFailure {
                        reason: e.to_string(),
                        transient: e.is_transient(),
                        target,
                    });
                }
            }
        }
        Ok(result)
    }

    async fn send_one(
        &self,
        target: &DeliveryTarget,
        message: &PushMessage,
    ) -> std::result::Result<(), GatewayError> {
        match tokio::time::timeout(self.send_timeout, self.gateway.send(target, message)).await {
            Ok(Ok(receipt)) => {
                debug!(%target, message_id = %receipt.message_id, "push accepted");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::Timeout {
                ms: u64::try_from(self.send_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use herald_core::{NotificationKind, TargetSelector};
    use herald_push::SendReceipt;

    use super::*;

    /// Gateway whose answer per target is scripted; unknown targets succeed.
    #[derive(Default)]
    struct ScriptedGateway {
        answers: HashMap<String, fn() -> GatewayError>,
        hang: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    fn key(target: &DeliveryTarget) -> String {
        match target {
            DeliveryTarget::Token(t) | DeliveryTarget::Topic(t) | DeliveryTarget::Condition(t) => {
                t.clone()
            }
        }
    }

    #[async_trait]
    impl PushGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            target: &DeliveryTarget,
            _message: &PushMessage,
        ) -> std::result::Result<SendReceipt, GatewayError> {
            let k = key(target);
            self.calls.lock().unwrap().push(k.clone());
            if self.hang.contains(&k) {
                std::future::pending::<()>().await;
            }
            match self.answers.get(&k) {
                Some(make) => Err(make()),
                None => Ok(SendReceipt {
                    message_id: format!("msg-{k}"),
                }),
            }
        }

        async fn subscribe(&self, _: &[String], _: &str) -> std::result::Result<(), GatewayError> {
            Ok(())
        }

        async fn unsubscribe(&self, _: &[String], _: &str) -> std::result::Result<(), GatewayError> {
            Ok(())
        }
    }

    /// Resolves `Tokens` verbatim and `User` to nothing.
    struct PassThrough;

    impl TargetResolver for PassThrough {
        fn resolve(&self, selector: &TargetSelector) -> herald_push::error::Result<Vec<DeliveryTarget>> {
            Ok(match selector {
                TargetSelector::Token { token } => vec![DeliveryTarget::Token(token.clone())],
                TargetSelector::Tokens { tokens } => {
                    tokens.iter().cloned().map(DeliveryTarget::Token).collect()
                }
                TargetSelector::Topic { topic } => vec![DeliveryTarget::Topic(topic.clone())],
                TargetSelector::Condition { condition } => {
                    vec![DeliveryTarget::Condition(condition.clone())]
                }
                TargetSelector::User { .. } => Vec::new(),
            })
        }
    }

    fn executor(gateway: ScriptedGateway) -> (DeliveryExecutor, Arc<ScriptedGateway>) {
        let gateway = Arc::new(gateway);
        let exec = DeliveryExecutor::new(
            gateway.clone(),
            Arc::new(PassThrough),
            Duration::from_millis(200),
            4,
        );
        (exec, gateway)
    }

    fn tokens(list: &[&str]) -> Payload {
        Payload::new(
            TargetSelector::Tokens {
                tokens: list.iter().map(|s| s.to_string()).collect(),
            },
            PushMessage::new(NotificationKind::Social, "Friend request", "Ana wants to connect"),
        )
    }

    #[tokio::test]
    async fn partial_failure_is_success() {
        let mut gw = ScriptedGateway::default();
        gw.answers
            .insert("dead".into(), || GatewayError::Unregistered("dead".into()));
        let (exec, gateway) = executor(gw);

        let result = exec.deliver(&tokens(&["a", "dead", "b"])).await.unwrap();
        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert!(!result.failed[0].transient);
        assert!(result.verdict().is_ok());
        assert_eq!(gateway.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn total_outage_is_transient() {
        let mut gw = ScriptedGateway::default();
        gw.answers
            .insert("news".into(), || GatewayError::Unavailable("503".into()));
        let (exec, _) = executor(gw);

        let payload = Payload::new(
            TargetSelector::Topic { topic: "news".into() },
            PushMessage::new(NotificationKind::SpecialEvent, "Event", "Starts now"),
        );
        let result = exec.deliver(&payload).await.unwrap();
        assert!(matches!(
            result.verdict(),
            Err(SchedulerError::TransientDelivery(_))
        ));
    }

    #[tokio::test]
    async fn all_permanent_failures_are_permanent() {
        let mut gw = ScriptedGateway::default();
        gw.answers
            .insert("x".into(), || GatewayError::Rejected("bad".into()));
        gw.answers
            .insert("y".into(), || GatewayError::Unregistered("y".into()));
        let (exec, _) = executor(gw);

        let result = exec.deliver(&tokens(&["x", "y"])).await.unwrap();
        let verdict = result.verdict();
        assert!(matches!(verdict, Err(SchedulerError::PermanentDelivery(ref m)) if m.contains("all 2 targets")));
        assert_eq!(result.failure_pairs().len(), 2);
    }

    #[tokio::test]
    async fn empty_resolution_is_permanent() {
        let (exec, gateway) = executor(ScriptedGateway::default());
        let payload = Payload::new(
            TargetSelector::User { user_id: "nobody".into() },
            PushMessage::new(NotificationKind::Achievement, "Badge", "Unlocked"),
        );
        let result = exec.deliver(&payload).await.unwrap();
        assert!(result.succeeded.is_empty() && result.failed.is_empty());
        assert!(matches!(
            result.verdict(),
            Err(SchedulerError::PermanentDelivery(_))
        ));
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hung_gateway_call_times_out_as_transient() {
        let gw = ScriptedGateway {
            hang: vec!["slow".into()],
            ..ScriptedGateway::default()
        };
        let (exec, _) = executor(gw);

        let result = exec.deliver(&tokens(&["slow"])).await.unwrap();
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].transient);
        assert!(result.failed[0].reason.contains("timed out"));
        assert!(matches!(
            result.verdict(),
            Err(SchedulerError::TransientDelivery(_))
        ));
    }
}
