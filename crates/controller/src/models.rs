//! Domain model for the managed `Simple` resource.
//!
//! Field names mirror the resource schema: `spec.message` is a required
//! non-empty string, `status.replied` defaults to false. `resource_version`
//! is an opaque optimistic-concurrency token owned by the resource store;
//! the reconciler only ever echoes it back on conditional writes.

use crate::registry::SeriesSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Desired state of a `Simple` resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSpec {
    /// The string to print. Required, non-empty.
    pub message: String,
}

/// Observed state of a `Simple` resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStatus {
    /// Set once the controller has seen and logged the message.
    #[serde(default)]
    pub replied: bool,
}

/// A `Simple` resource record as held by the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleResource {
    pub namespace: String,
    pub name: String,
    pub spec: SimpleSpec,
    #[serde(default)]
    pub status: SimpleStatus,
    /// Opaque optimistic-concurrency token; monotonic in the in-memory store.
    pub resource_version: u64,
    /// Bumped by the store on each spec change. `status.replied` transitions
    /// false -> true at most once per generation.
    #[serde(default)]
    pub generation: u64,
}

impl SimpleResource {
    /// Create a fresh record with an empty status.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            spec: SimpleSpec {
                message: message.into(),
            },
            status: SimpleStatus::default(),
            resource_version: 0,
            generation: 1,
        }
    }

    /// The `namespace/name` key this record is addressed by.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A metric event owned by the async publisher queue until delivered or
/// dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEvent {
    /// Series values captured when the event was created.
    pub series: Vec<SeriesSnapshot>,
    /// Publisher-assigned monotonic sequence number.
    pub sequence: u64,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// When the event entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

impl PublishEvent {
    /// Create an unsequenced event; the publisher assigns `sequence` at
    /// enqueue time.
    #[must_use]
    pub fn new(series: Vec<SeriesSnapshot>) -> Self {
        Self {
            series,
            sequence: 0,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key() {
        let resource = SimpleResource::new("demo", "foo", "Hallo Welt!");
        assert_eq!(resource.key(), "demo/foo");
    }

    #[test]
    fn test_status_defaults_to_not_replied() {
        let resource = SimpleResource::new("demo", "foo", "Hallo Welt!");
        assert!(!resource.status.replied);
        assert_eq!(resource.generation, 1);
    }

    #[test]
    fn test_serde_round_trip_preserves_wire_names() {
        let resource = SimpleResource::new("demo", "foo", "Hallo Welt!");
        let json = serde_json::to_value(&resource).unwrap();

        assert_eq!(json["spec"]["message"], "Hallo Welt!");
        assert_eq!(json["status"]["replied"], false);

        let back: SimpleResource = serde_json::from_value(json).unwrap();
        assert_eq!(back, resource);
    }

    #[test]
    fn test_status_replied_optional_on_deserialize() {
        let raw = r#"{
            "namespace": "demo",
            "name": "foo",
            "spec": { "message": "Hallo Welt!" },
            "resource_version": 4
        }"#;
        let resource: SimpleResource = serde_json::from_str(raw).unwrap();
        assert!(!resource.status.replied);
        assert_eq!(resource.resource_version, 4);
    }
}
