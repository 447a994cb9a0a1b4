use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message sent through FCM. Exactly one of `token`, `topic` or `condition`
/// must be set when sending; multicast base messages carry none of them.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub android: Option<AndroidConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webpush: Option<WebpushConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub apns: Option<ApnsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcm_options: Option<FcmOptions>,

    /// Registration token of a single device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Topic name without the `/topics/` prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Topic condition, e.g. `'news' in topics && 'sports' in topics`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Message {
    /// Number of targets set on the message.
    pub fn target_count(&self) -> usize {
        [self.token.is_some(), self.topic.is_some(), self.condition.is_some()]
            .iter()
            .filter(|&&set| set)
            .count()
    }

    /// A copy of this message addressed to `token`.
    pub fn for_token(&self, token: &str) -> Message {
        Message {
            token: Some(token.to_string()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AndroidConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<AndroidMessagePriority>,

    /// Time to live as a duration string, e.g. `"3600s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,

    /// Android notification options, passed through as JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AndroidMessagePriority {
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebpushConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApnsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Full APNs payload including the `aps` dictionary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FcmOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics_label: Option<String>,
}

/// Outcome of a batch send.
#[derive(Debug, Clone, Default)]
pub struct BatchResponse {
    pub success_count: usize,
    pub failure_count: usize,
    /// One entry per message, in request order.
    pub responses: Vec<SendResponse>,
}

impl BatchResponse {
    pub(crate) fn from_responses(responses: Vec<SendResponse>) -> Self {
        let success_count = responses.iter().filter(|r| r.success).count();
        Self {
            success_count,
            failure_count: responses.len() - success_count,
            responses,
        }
    }

    /// Appends the results of a later chunk.
    pub(crate) fn merge(&mut self, other: BatchResponse) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.responses.extend(other.responses);
    }
}

#[derive(Debug, Clone)]
pub struct SendResponse {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendResponseInternal {
    pub name: String,
}
