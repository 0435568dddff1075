use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{HeraldError, Result};

/// Most topics a single condition expression may reference (gateway limit).
pub const MAX_CONDITION_TOPICS: usize = 5;

/// Who a notification is addressed to, before registry resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSelector {
    /// A single device registration token.
    Token { token: String },
    /// Several device tokens delivered as one multicast.
    Tokens { tokens: Vec<String> },
    /// Every token registered for a user.
    User { user_id: String },
    /// A gateway-side topic; the gateway fans out to subscribers.
    Topic { topic: String },
    /// A boolean expression over topics, e.g. `'a' in topics && 'b' in topics`.
    Condition { condition: String },
}

impl TargetSelector {
    pub fn validate(&self) -> Result<()> {
        match self {
            TargetSelector::Token { token } => validate_token(token),
            TargetSelector::Tokens { tokens } => {
                if tokens.is_empty() {
                    return Err(HeraldError::InvalidPayload(
                        "token list must not be empty".to_string(),
                    ));
                }
                tokens.iter().try_for_each(|t| validate_token(t))
            }
            TargetSelector::User { user_id } => {
                if user_id.trim().is_empty() {
                    return Err(HeraldError::InvalidPayload(
                        "user_id must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            TargetSelector::Topic { topic } => validate_topic(topic),
            TargetSelector::Condition { condition } => validate_condition(condition),
        }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Token { token } => write!(f, "token:{}", redact(token)),
            TargetSelector::Tokens { tokens } => write!(f, "tokens:{}", tokens.len()),
            TargetSelector::User { user_id } => write!(f, "user:{user_id}"),
            TargetSelector::Topic { topic } => write!(f, "topic:{topic}"),
            TargetSelector::Condition { condition } => write!(f, "condition:{condition}"),
        }
    }
}

/// Shorten a device token for log output; tokens are long-lived credentials.
pub fn redact(token: &str) -> String {
    let head: String = token.chars().take(10).collect();
    format!("{head}...")
}

fn validate_token(token: &str) -> Result<()> {
    if token.trim().is_empty() {
        return Err(HeraldError::InvalidPayload(
            "device token must not be empty".to_string(),
        ));
    }
    if token.chars().any(char::is_whitespace) {
        return Err(HeraldError::InvalidPayload(
            "device token must not contain whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Topic names follow the gateway pattern `[a-zA-Z0-9-_.~%]+`.
pub fn validate_topic(topic: &str) -> Result<()> {
    let valid = !topic.is_empty()
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '%'));
    if valid {
        Ok(())
    } else {
        Err(HeraldError::InvalidPayload(format!(
            "invalid topic name: {topic:?}"
        )))
    }
}

fn validate_condition(condition: &str) -> Result<()> {
    let topics = condition.matches("in topics").count();
    if topics == 0 {
        return Err(HeraldError::InvalidPayload(
            "condition must reference at least one topic".to_string(),
        ));
    }
    if topics > MAX_CONDITION_TOPICS {
        return Err(HeraldError::InvalidPayload(format!(
            "condition references {topics} topics (max {MAX_CONDITION_TOPICS})"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Tournament,
    Social,
    Achievement,
    DailyReminder,
    SpecialEvent,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Tournament => "tournament",
            NotificationKind::Social => "social",
            NotificationKind::Achievement => "achievement",
            NotificationKind::DailyReminder => "daily_reminder",
            NotificationKind::SpecialEvent => "special_event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// Notification content. Presentation is data; Herald never inspects it
/// beyond validation and placeholder substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// App route to open when the notification is tapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_params: Option<serde_json::Value>,
    /// Free-form data payload; values are stringified by the gateway.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl PushMessage {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            kind,
            priority: Priority::Normal,
            image_url: None,
            route: None,
            route_params: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_route(mut self, route: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        self.route = Some(route.into());
        self.route_params = params;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(HeraldError::InvalidPayload(
                "title must not be empty".to_string(),
            ));
        }
        if self.body.trim().is_empty() {
            return Err(HeraldError::InvalidPayload(
                "body must not be empty".to_string(),
            ));
        }
        if let Some(url) = &self.image_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(HeraldError::InvalidPayload(format!(
                    "image_url must be an http(s) URL: {url}"
                )));
            }
        }
        Ok(())
    }

    /// Replace `{name}` placeholders in title and body.
    pub fn render(&self, vars: &[(&str, String)]) -> PushMessage {
        let mut out = self.clone();
        for (name, value) in vars {
            let needle = format!("{{{name}}}");
            out.title = out.title.replace(&needle, value);
            out.body = out.body.replace(&needle, value);
        }
        out
    }
}

/// A delivery instruction: who to notify and with what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub target: TargetSelector,
    pub message: PushMessage,
}

impl Payload {
    pub fn new(target: TargetSelector, message: PushMessage) -> Self {
        Self { target, message }
    }

    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        self.message.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> PushMessage {
        PushMessage::new(NotificationKind::Tournament, "Starting soon", "Weekly Cup starts in {minutes} minutes!")
    }

    #[test]
    fn selector_serializes_with_kind_tag() {
        let sel = TargetSelector::Topic { topic: "tournaments".to_string() };
        let json = serde_json::to_string(&sel).unwrap();
        assert_eq!(json, r#"{"kind":"topic","topic":"tournaments"}"#);
    }

    #[test]
    fn topic_validation_rejects_spaces_and_empty() {
        assert!(validate_topic("daily_challenge").is_ok());
        assert!(validate_topic("tournament_42-a.b~c%d").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("two words").is_err());
        assert!(validate_topic("/topics/x").is_err());
    }

    #[test]
    fn condition_must_reference_between_one_and_five_topics() {
        let ok = TargetSelector::Condition {
            condition: "'a' in topics && 'b' in topics".to_string(),
        };
        assert!(ok.validate().is_ok());

        let none = TargetSelector::Condition { condition: "true".to_string() };
        assert!(none.validate().is_err());

        let many = (0..6)
            .map(|i| format!("'t{i}' in topics"))
            .collect::<Vec<_>>()
            .join(" || ");
        assert!(TargetSelector::Condition { condition: many }.validate().is_err());
    }

    #[test]
    fn empty_token_list_is_invalid() {
        let sel = TargetSelector::Tokens { tokens: vec![] };
        assert!(matches!(sel.validate(), Err(HeraldError::InvalidPayload(_))));
    }

    #[test]
    fn message_requires_title_and_body() {
        let mut msg = message();
        assert!(msg.validate().is_ok());
        msg.title = "  ".to_string();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn render_substitutes_placeholders() {
        let rendered = message().render(&[("minutes", "15".to_string())]);
        assert_eq!(rendered.body, "Weekly Cup starts in 15 minutes!");
        assert_eq!(rendered.title, "Starting soon");
    }

    #[test]
    fn redact_keeps_prefix_only() {
        assert_eq!(redact("abcdefghijklmnop"), "abcdefghij...");
    }
}
