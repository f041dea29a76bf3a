// ── Notifications ──
//
// Change events produced while a command runs. They are buffered per
// command by a `NotificationAccumulator` and leave the engine as one
// `NotificationBatch` when the command completes.

mod accumulator;
mod dispatcher;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use strum::Display;

use crate::model::ResourcePath;

pub use accumulator::NotificationAccumulator;
pub use dispatcher::{ListenerId, NotificationDispatcher, NotificationListener};

/// Structural change reported by a lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    ProviderCreated,
    ProviderDeleted,
    ServiceCreated,
    ResourceCreated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleNotification {
    pub status: LifecycleStatus,
    pub model: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDataNotification {
    #[serde(flatten)]
    pub path: ResourcePath,
    pub old_value: Value,
    pub new_value: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMetadataNotification {
    #[serde(flatten)]
    pub path: ResourcePath,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceActionNotification {
    #[serde(flatten)]
    pub path: ResourcePath,
    pub timestamp: DateTime<Utc>,
}

/// A single twin change event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Lifecycle(LifecycleNotification),
    ResourceData(ResourceDataNotification),
    ResourceMetadata(ResourceMetadataNotification),
    ResourceAction(ResourceActionNotification),
}

impl Notification {
    /// Routing topic, e.g. `DATA/sensor-1/temperature/value`.
    pub fn topic(&self) -> String {
        match self {
            Self::Lifecycle(n) => {
                let mut topic = format!("LIFECYCLE/{}", n.provider);
                for segment in [&n.service, &n.resource].into_iter().flatten() {
                    topic.push('/');
                    topic.push_str(segment);
                }
                topic
            }
            Self::ResourceData(n) => path_topic("DATA", &n.path),
            Self::ResourceMetadata(n) => path_topic("METADATA", &n.path),
            Self::ResourceAction(n) => path_topic("ACTION", &n.path),
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Lifecycle(n) => &n.provider,
            Self::ResourceData(n) => &n.path.provider,
            Self::ResourceMetadata(n) => &n.path.provider,
            Self::ResourceAction(n) => &n.path.provider,
        }
    }
}

fn path_topic(prefix: &str, path: &ResourcePath) -> String {
    format!(
        "{prefix}/{}/{}/{}",
        path.provider, path.service, path.resource
    )
}

/// Everything one command emitted, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationBatch {
    pub command_id: u64,
    pub notifications: Vec<Notification>,
}

impl NotificationBatch {
    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Notification> {
        self.notifications.iter()
    }
}

impl<'a> IntoIterator for &'a NotificationBatch {
    type Item = &'a Notification;
    type IntoIter = std::slice::Iter<'a, Notification>;

    fn into_iter(self) -> Self::IntoIter {
        self.notifications.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lifecycle(service: Option<&str>, resource: Option<&str>) -> Notification {
        Notification::Lifecycle(LifecycleNotification {
            status: LifecycleStatus::ServiceCreated,
            model: "m".into(),
            provider: "p".into(),
            service: service.map(Into::into),
            resource: resource.map(Into::into),
        })
    }

    #[test]
    fn lifecycle_topic_grows_with_depth() {
        assert_eq!(lifecycle(None, None).topic(), "LIFECYCLE/p");
        assert_eq!(lifecycle(Some("s"), None).topic(), "LIFECYCLE/p/s");
        assert_eq!(lifecycle(Some("s"), Some("r")).topic(), "LIFECYCLE/p/s/r");
    }

    #[test]
    fn data_notification_serializes_flat() {
        let n = Notification::ResourceData(ResourceDataNotification {
            path: ResourcePath::new("m", "p", "s", "r"),
            old_value: Value::Null,
            new_value: json!(5),
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
        });
        assert_eq!(n.topic(), "DATA/p/s/r");
        let encoded = serde_json::to_value(&n).unwrap();
        assert_eq!(encoded["type"], "resource_data");
        assert_eq!(encoded["provider"], "p");
        assert_eq!(encoded["new_value"], 5);
    }
}
