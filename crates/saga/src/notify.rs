//! Notifications emitted for external collaborators (audit, notification
//! delivery). Delivery is fire-and-forget; the log stays the source of truth.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "workflow.step.succeeded")]
    StepSucceeded,
    #[serde(rename = "workflow.step.failed")]
    StepFailed,
    #[serde(rename = "workflow.instance.completed")]
    InstanceCompleted,
    #[serde(rename = "workflow.instance.failed")]
    InstanceFailed,
    #[serde(rename = "workflow.instance.compensation_failed")]
    InstanceCompensationFailed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::StepSucceeded => "workflow.step.succeeded",
            Topic::StepFailed => "workflow.step.failed",
            Topic::InstanceCompleted => "workflow.instance.completed",
            Topic::InstanceFailed => "workflow.instance.failed",
            Topic::InstanceCompensationFailed => "workflow.instance.compensation_failed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: Topic,
    pub instance_id: AggregateId,
    pub step_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(
        topic: Topic,
        instance_id: AggregateId,
        step_name: Option<&str>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic,
            instance_id,
            step_name: step_name.map(str::to_string),
            timestamp: Utc::now(),
            payload,
        }
    }
}

pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// Drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl NotificationPublisher for NoopPublisher {
    fn publish(&self, _notification: Notification) {}
}

/// Fans notifications out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl NotificationPublisher for BroadcastPublisher {
    fn publish(&self, notification: Notification) {
        tracing::debug!(topic = %notification.topic, instance_id = %notification.instance_id, "publishing notification");
        // No subscribers is fine.
        let _ = self.sender.send(notification);
    }
}
