//! Firebase Cloud Messaging HTTP v1 client.
//!
//! Sends go to `POST {base}/v1/projects/{project}/messages:send`; topic
//! management goes to the instance-id batch endpoints. Non-2xx answers are
//! mapped onto [`GatewayError`] so the executor can tell a dead token from an
//! outage.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use herald_core::config::FcmConfig;
use herald_core::types::{redact, PushMessage};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::{
    error::GatewayError,
    gateway::{DeliveryTarget, PushGateway, SendReceipt},
};

pub struct FcmGateway {
    client: reqwest::Client,
    project_id: String,
    access_token: String,
    base_url: String,
    iid_base_url: String,
}

impl FcmGateway {
    pub fn new(config: &FcmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            project_id: config.project_id.clone(),
            access_token: config.access_token.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            iid_base_url: config.iid_base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn batch_topic_call(
        &self,
        op: &str,
        tokens: &[String],
        topic: &str,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/iid/v1:{op}", self.iid_base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("access_token_auth", "true")
            .json(&json!({
                "to": format!("/topics/{topic}"),
                "registration_tokens": tokens,
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_secs(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            warn!(status, topic, op, body = %text, "FCM topic management error");
            return Err(classify_error(status, &text, retry_after));
        }
        debug!(topic, op, count = tokens.len(), "FCM topic management ok");
        Ok(())
    }
}

#[derive(Deserialize)]
struct SendResponse {
    name: String,
}

#[async_trait]
impl PushGateway for FcmGateway {
    fn name(&self) -> &str {
        "fcm"
    }

    async fn send(
        &self,
        target: &DeliveryTarget,
        message: &PushMessage,
    ) -> Result<SendReceipt, GatewayError> {
        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.base_url, self.project_id
        );
        let sent_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body = json!({ "message": build_message(target, message, &sent_at) });

        debug!(%target, "sending FCM message");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_secs(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            warn!(status, %target, body = %text, "FCM send error");
            return Err(classify_error(status, &text, retry_after));
        }

        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("unreadable FCM response: {e}")))?;

        Ok(SendReceipt {
            message_id: parsed.name,
        })
    }

    async fn subscribe(&self, tokens: &[String], topic: &str) -> Result<(), GatewayError> {
        self.batch_topic_call("batchAdd", tokens, topic).await
    }

    async fn unsubscribe(&self, tokens: &[String], topic: &str) -> Result<(), GatewayError> {
        self.batch_topic_call("batchRemove", tokens, topic).await
    }
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Build the v1 `message` object for one target.
///
/// The data map only carries strings on the wire, so every value is
/// stringified and the routing/metadata keys the mobile client reads are added.
pub fn build_message(target: &DeliveryTarget, message: &PushMessage, sent_at: &str) -> Value {
    let mut data: Map<String, Value> = message
        .data
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(stringify(v))))
        .collect();
    if let Some(route) = &message.route {
        data.insert("route".into(), Value::String(route.clone()));
    }
    if let Some(params) = &message.route_params {
        data.insert("route_params".into(), Value::String(params.to_string()));
    }
    data.insert("notification_type".into(), message.kind.as_str().into());
    data.insert("priority".into(), message.priority.as_str().into());
    data.insert("sent_at".into(), sent_at.into());

    let mut notification = json!({ "title": message.title, "body": message.body });
    if let Some(image) = &message.image_url {
        notification["image"] = Value::String(image.clone());
    }

    let android_priority = match message.priority {
        herald_core::Priority::High => "high",
        _ => "normal",
    };

    let mut out = json!({
        "notification": notification,
        "data": data,
        "android": {
            "priority": android_priority,
            "notification": { "sound": "default" },
        },
        "apns": {
            "payload": {
                "aps": {
                    "alert": { "title": message.title, "body": message.body },
                    "badge": 1,
                    "sound": "default",
                }
            }
        },
    });

    let (key, value) = match target {
        DeliveryTarget::Token(t) => ("token", t),
        DeliveryTarget::Topic(t) => ("topic", t),
        DeliveryTarget::Condition(c) => ("condition", c),
    };
    out[key] = Value::String(value.clone());
    out
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Map an FCM error response onto the gateway error taxonomy.
pub fn classify_error(status: u16, body: &str, retry_after: Option<u64>) -> GatewayError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error_code = parsed
        .as_ref()
        .and_then(|v| v["error"]["details"].as_array())
        .and_then(|details| {
            details
                .iter()
                .find_map(|d| d["errorCode"].as_str().map(str::to_string))
        });
    let message = parsed
        .as_ref()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {status}"));

    match (error_code.as_deref(), status) {
        (Some("UNREGISTERED"), _) | (None, 404) => GatewayError::Unregistered(message),
        (Some("SENDER_ID_MISMATCH"), _) | (Some("INVALID_ARGUMENT"), _) => {
            GatewayError::Rejected(message)
        }
        (Some("QUOTA_EXCEEDED"), _) | (_, 429) => GatewayError::RateLimited {
            retry_after_secs: retry_after,
        },
        (Some("THIRD_PARTY_AUTH_ERROR"), _) | (_, 401) | (_, 403) => {
            GatewayError::AuthFailed(message)
        }
        (_, s) if s >= 500 => GatewayError::Unavailable(message),
        _ => GatewayError::Rejected(message),
    }
}

impl std::fmt::Debug for FcmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmGateway")
            .field("project_id", &self.project_id)
            .field("access_token", &redact(&self.access_token))
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::{NotificationKind, Priority};

    fn message() -> PushMessage {
        PushMessage::new(NotificationKind::Tournament, "Tournament Started!", "Weekly Cup has begun!")
            .with_priority(Priority::High)
            .with_route("tournament_detail", Some(json!({"tournament_id": "t-1"})))
            .with_data("minutes_until", 15)
            .with_data("tournament_id", "t-1")
    }

    #[test]
    fn data_values_are_stringified() {
        let msg = build_message(&DeliveryTarget::Topic("tournaments".into()), &message(), "now");
        assert_eq!(msg["topic"], "tournaments");
        assert_eq!(msg["data"]["minutes_until"], "15");
        assert_eq!(msg["data"]["tournament_id"], "t-1");
        assert_eq!(msg["data"]["route"], "tournament_detail");
        assert_eq!(msg["data"]["route_params"], r#"{"tournament_id":"t-1"}"#);
        assert_eq!(msg["data"]["notification_type"], "tournament");
        assert_eq!(msg["data"]["priority"], "high");
        assert_eq!(msg["android"]["priority"], "high");
        assert!(msg.get("token").is_none());
    }

    #[test]
    fn token_target_sets_token_field() {
        let msg = build_message(&DeliveryTarget::Token("abc".into()), &message(), "now");
        assert_eq!(msg["token"], "abc");
        assert!(msg.get("topic").is_none());
    }

    #[test]
    fn classifies_unregistered_token() {
        let body = r#"{"error":{"code":404,"message":"Requested entity was not found.","status":"NOT_FOUND",
            "details":[{"@type":"type.googleapis.com/google.firebase.fcm.v1.FcmError","errorCode":"UNREGISTERED"}]}}"#;
        let err = classify_error(404, body, None);
        assert!(matches!(err, GatewayError::Unregistered(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn classifies_quota_and_outage_as_transient() {
        let err = classify_error(429, "", Some(30));
        assert!(matches!(err, GatewayError::RateLimited { retry_after_secs: Some(30) }));
        assert!(classify_error(503, "upstream down", None).is_transient());
        assert!(classify_error(401, "", None).is_transient());
    }

    #[test]
    fn classifies_invalid_argument_as_rejected() {
        let body = r#"{"error":{"code":400,"message":"Invalid topic","details":[{"errorCode":"INVALID_ARGUMENT"}]}}"#;
        let err = classify_error(400, body, None);
        assert!(matches!(err, GatewayError::Rejected(ref m) if m == "Invalid topic"));
    }
}
