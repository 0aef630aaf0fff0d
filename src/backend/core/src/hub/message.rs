//! Hub message envelope and inbound control messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::experiments::ExperimentId;

/// Kind of message carried by the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ExperimentUpdate,
    MetricUpdate,
    StatusChange,
    Notification,
    Heartbeat,
    Subscribe,
    Unsubscribe,
    Error,
}

/// Envelope delivered to hub clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Scope of delivery. `None` reaches every registered client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl HubMessage {
    pub fn new(message_type: MessageType, data: serde_json::Value) -> Self {
        Self {
            message_type,
            topic: None,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Add a field to an object payload.
    pub fn with_data_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn experiment_update(experiment_id: ExperimentId, data: serde_json::Value) -> Self {
        Self::new(MessageType::ExperimentUpdate, data).with_topic(experiment_topic(experiment_id))
    }

    pub fn metric_update(experiment_id: ExperimentId, data: serde_json::Value) -> Self {
        Self::new(MessageType::MetricUpdate, data).with_topic(metrics_topic(experiment_id))
    }

    pub fn status_change(topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(MessageType::StatusChange, data).with_topic(topic)
    }

    pub fn notification(message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Notification,
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, serde_json::Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

/// Topic carrying phase changes and task status for an experiment.
pub fn experiment_topic(experiment_id: ExperimentId) -> String {
    format!("experiment:{}", experiment_id)
}

/// Topic carrying KPI results for an experiment.
pub fn metrics_topic(experiment_id: ExperimentId) -> String {
    format!("metrics:{}", experiment_id)
}

/// Control messages a client may send over its connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let id = ExperimentId::new();
        let msg = HubMessage::experiment_update(id, serde_json::json!({"phase": "running"}));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "experiment_update");
        assert_eq!(json["topic"], format!("experiment:{}", id));
        assert_eq!(json["data"]["phase"], "running");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_untopiced_message_omits_topic() {
        let json = serde_json::to_value(HubMessage::heartbeat()).unwrap();
        assert!(json.get("topic").is_none());
    }

    #[test]
    fn test_parse_client_message() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","data":{"topic":"experiment:42"}}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                topic: "experiment:42".to_string()
            }
        );

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"unsubscribe","data":{"topic":"metrics:1"},"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe { .. }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }
}
