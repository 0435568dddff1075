use async_trait::async_trait;
use herald_core::types::{redact, PushMessage};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GatewayError;

/// A concrete address the gateway can deliver to, after registry resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeliveryTarget {
    Token(String),
    Topic(String),
    Condition(String),
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTarget::Token(t) => write!(f, "token:{}", redact(t)),
            DeliveryTarget::Topic(t) => write!(f, "topic:{t}"),
            DeliveryTarget::Condition(c) => write!(f, "condition:{c}"),
        }
    }
}

/// Gateway acknowledgement for one accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Interface implemented by every push gateway (FCM, dry-run, test doubles).
///
/// Calls may be repeated for the same logical job after a crash recovery;
/// implementations must not assume exactly-once invocation.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Stable lowercase identifier (e.g. `"fcm"`).
    fn name(&self) -> &str;

    /// Deliver `message` to a single target.
    async fn send(
        &self,
        target: &DeliveryTarget,
        message: &PushMessage,
    ) -> Result<SendReceipt, GatewayError>;

    /// Subscribe device tokens to a gateway-side topic.
    async fn subscribe(&self, tokens: &[String], topic: &str) -> Result<(), GatewayError>;

    /// Remove device tokens from a gateway-side topic.
    async fn unsubscribe(&self, tokens: &[String], topic: &str) -> Result<(), GatewayError>;
}
