//! The event record and shared event-identity types.
//!
//! Every state transition in the system is described by exactly one
//! [`Event`]. Events are produced locally by store dispatchers or arrive
//! from the central server through fetch or push; both paths feed the same
//! record through [`AggregateStore::apply_event`](crate::AggregateStore::apply_event).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The three state transitions an event can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Brings a new aggregate into existence.
    Create,
    /// Advances the state of a live aggregate.
    Update,
    /// Removes a live aggregate.
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// An immutable record describing one state transition on one aggregate.
///
/// Events are append-only. `(aggregate_id, prev_id)` chains every event back
/// to the aggregate's first `create`. Once `recorded_at` is set by the
/// server, neither it nor `created_by` may change again, with one exception:
/// a `created_by` that was absent at dispatch time (the device was logged
/// out) is filled in on first recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier, generated locally.
    pub id: String,
    /// Which transition this event describes.
    pub operation: Operation,
    /// Routes the event to the store owning this aggregate type.
    pub aggregate_type: String,
    /// Identifier of the target aggregate.
    pub aggregate_id: String,
    /// Logical event name, e.g. `"profile.create"`.
    pub event_type: String,
    /// Operation-specific data, validated against the configured payload
    /// schema. `None` for payload-less events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
    /// Wall-clock timestamp at the originating device.
    pub dispatched_at: DateTime<Utc>,
    /// Originating account id. Absent when dispatched while logged out;
    /// stamped on first recording.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<String>,
    /// Originating device id.
    pub created_on: String,
    /// Id of the last event on this aggregate known to the originator.
    /// Absent for `create`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prev_id: Option<String>,
    /// Server-assigned timestamp set when the event is durably recorded
    /// centrally. Absent until then.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Generator for event and aggregate identifiers.
///
/// The broker carries one as the default for all stores; aggregate configs
/// may override id minting per aggregate type.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// The default id generator: random UUID v4, rendered as a hyphenated string.
pub fn random_id() -> String {
    Uuid::new_v4().to_string()
}

/// Normalize a payload for persistence by passing it through serde.
///
/// Whatever the caller hands a dispatcher -- a typed struct, a
/// `serde_json::json!` literal, or `()` for payload-less events -- comes out
/// the other side as a plain JSON value that is safe to persist and to ship
/// to the server. Typed timestamps serialize to their ISO-8601 UTC form and
/// revive into `chrono` types when a reducer deserializes them back.
///
/// # Errors
///
/// Returns `serde_json::Error` if the payload cannot be represented as JSON
/// (e.g. a map with non-string keys).
pub fn normalize_payload<T: Serialize>(payload: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        Event {
            id: random_id(),
            operation: Operation::Create,
            aggregate_type: "profile".to_string(),
            aggregate_id: "p-1".to_string(),
            event_type: "profile.create".to_string(),
            payload: Some(json!({"name": "ada"})),
            dispatched_at: Utc::now(),
            created_by: None,
            created_on: "device-1".to_string(),
            prev_id: None,
            recorded_at: None,
        }
    }

    #[test]
    fn operation_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Operation::Create).expect("serialize should succeed"),
            "\"create\""
        );
        assert_eq!(
            serde_json::to_string(&Operation::Delete).expect("serialize should succeed"),
            "\"delete\""
        );
    }

    #[test]
    fn event_serde_roundtrip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).expect("serialize should succeed");
        let back: Event = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, event);
    }

    #[test]
    fn absent_optionals_are_omitted_from_json() {
        let event = sample_event();
        let json = serde_json::to_string(&event).expect("serialize should succeed");
        assert!(!json.contains("created_by"), "got: {json}");
        assert!(!json.contains("prev_id"), "got: {json}");
        assert!(!json.contains("recorded_at"), "got: {json}");
    }

    #[test]
    fn random_id_is_unique_per_call() {
        assert_ne!(random_id(), random_id());
    }

    #[test]
    fn normalize_typed_struct_to_value() {
        #[derive(Serialize)]
        struct Payload {
            name: &'static str,
            when: DateTime<Utc>,
        }

        let when = Utc::now();
        let value =
            normalize_payload(&Payload { name: "ada", when }).expect("normalize should succeed");
        assert_eq!(value["name"], "ada");
        // Timestamps land as ISO-8601 strings.
        let revived: DateTime<Utc> = serde_json::from_value(value["when"].clone())
            .expect("timestamp should revive through serde");
        assert_eq!(revived, when);
    }

    #[test]
    fn normalize_unit_is_null() {
        let value = normalize_payload(&()).expect("normalize should succeed");
        assert!(value.is_null());
    }
}
