//! The materialized projection of a single aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Bounds every user-defined aggregate state type must satisfy.
///
/// Blanket-implemented: any `Clone + Serialize + DeserializeOwned` type that
/// can cross task boundaries qualifies. The serde bounds exist so snapshots
/// can be persisted by an aggregate repository and validated by an optional
/// aggregate schema.
pub trait AggregateState:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> AggregateState for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// The current state of one aggregate, derived from its event history.
///
/// The base metadata fields are owned by the runtime and stamped on every
/// applied event; the user-defined remainder lives in
/// [`state`](Snapshot::state) and is produced by the configured
/// construct/reduce handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned"))]
pub struct Snapshot<S> {
    /// The aggregate id.
    pub id: String,
    /// Account that created the aggregate, if known. Backfilled on first
    /// recording when the create was dispatched logged-out.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<String>,
    /// Device the aggregate was created on.
    pub created_on: String,
    /// Id of the most recently applied event.
    pub last_event_id: String,
    /// Dispatch time of the create event.
    pub created_at: DateTime<Utc>,
    /// Dispatch time of the most recently applied event.
    pub updated_at: DateTime<Utc>,
    /// Monotonic count of applied events; starts at 1 on create.
    pub version: u64,
    /// Server record time of the most recent recorded event applied to or
    /// marked on this aggregate. Absent while everything is local-only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_recorded_at: Option<DateTime<Utc>>,
    /// The user-defined projection state.
    pub state: S,
}
