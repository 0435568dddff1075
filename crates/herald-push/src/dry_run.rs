use async_trait::async_trait;
use herald_core::types::PushMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::{
    error::GatewayError,
    gateway::{DeliveryTarget, PushGateway, SendReceipt},
};

/// Accepts everything and logs it. Used when no FCM credentials are configured.
#[derive(Default)]
pub struct DryRunGateway {
    sent: AtomicU64,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PushGateway for DryRunGateway {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(
        &self,
        target: &DeliveryTarget,
        message: &PushMessage,
    ) -> Result<SendReceipt, GatewayError> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        info!(%target, title = %message.title, kind = message.kind.as_str(), "dry-run push");
        Ok(SendReceipt {
            message_id: format!("dry-run-{n}"),
        })
    }

    async fn subscribe(&self, tokens: &[String], topic: &str) -> Result<(), GatewayError> {
        info!(topic, count = tokens.len(), "dry-run topic subscribe");
        Ok(())
    }

    async fn unsubscribe(&self, tokens: &[String], topic: &str) -> Result<(), GatewayError> {
        info!(topic, count = tokens.len(), "dry-run topic unsubscribe");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::NotificationKind;

    #[tokio::test]
    async fn numbers_accepted_messages() {
        let gw = DryRunGateway::new();
        let msg = PushMessage::new(NotificationKind::Social, "hi", "there");
        let receipt = gw
            .send(&DeliveryTarget::Topic("news".into()), &msg)
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "dry-run-1");
        let receipt = gw
            .send(&DeliveryTarget::Token("tok".into()), &msg)
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "dry-run-2");
    }
}
