//! Crate-level error types.
//!
//! One enum per concern, following a shared propagation policy: failures
//! detected before any side effect are returned to the caller; failures
//! after persistence has begun roll the in-memory state back and terminate
//! the event bus instead of rethrowing, so the bus termination hook is the
//! single funnel for terminal conditions.

use crate::event::Operation;
use crate::validate::ValidationIssues;

/// Boxed error for collaborator failures whose concrete type the core does
/// not care about.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by [`EventBus`](crate::EventBus) operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus is in its terminal state; no event may be dispatched.
    #[error("event bus is terminated")]
    Terminated,

    /// A subscriber failed while handling a dispatched event.
    ///
    /// Never swallowed: the store routes this into bus termination so the
    /// process stops propagating events after an integrity failure.
    #[error("bus subscriber failed")]
    Subscriber(#[source] BoxError),
}

/// Error returned when an aggregate configuration is rejected at
/// registration time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The aggregate type tag is empty.
    #[error("aggregate type must not be empty")]
    EmptyAggregateType,

    /// Two event configs share the same event type name.
    #[error("duplicate event type '{0}'")]
    DuplicateEvent(String),

    /// Two commands share the same name.
    #[error("duplicate command '{0}'")]
    DuplicateCommand(String),

    /// An event type or command collides with a store method name.
    #[error("'{0}' is a reserved store name")]
    RestrictedName(String),

    /// A second store was registered for an aggregate type the broker
    /// already routes.
    #[error("aggregate type '{0}' is already registered")]
    DuplicateAggregateType(String),
}

/// Error returned by event-log and snapshot repositories.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The addressed record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The underlying storage failed.
    #[error("storage failure")]
    Storage(#[source] BoxError),
}

/// Error returned by the event-server adapter.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Transient transport failure; the event stays unrecorded and is
    /// retried on the next sync cycle.
    #[error("network failure")]
    Network(#[source] BoxError),

    /// The server refused the request. Currently retried the same way as a
    /// network failure.
    #[error("server rejected the request: {0}")]
    Rejected(String),
}

/// Error returned by store dispatchers, `apply_event`, and `mark_recorded`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The payload failed schema validation. Rejected before any side
    /// effect; the issue list is the source.
    #[error("payload failed schema validation")]
    InvalidInput(#[source] ValidationIssues),

    /// The dispatch policy rejected the event. No side effect occurred.
    #[error("dispatch of '{event_type}' rejected by policy")]
    Unauthorized {
        /// The event that was refused.
        event_type: String,
    },

    /// An update/delete/mark targeted an aggregate that does not exist.
    #[error("aggregate '{aggregate_id}' not found")]
    NotFound {
        /// The missing aggregate id.
        aggregate_id: String,
    },

    /// The event names a different aggregate type than the store owns.
    /// Programmer error; raised synchronously before any side effect.
    #[error("event targets aggregate type '{actual}' but this store owns '{expected}'")]
    AggregateTypeMismatch {
        /// The store's aggregate type.
        expected: String,
        /// The event's aggregate type.
        actual: String,
    },

    /// No event config is registered under this event type.
    #[error("no event configured under '{0}'")]
    UnknownEvent(String),

    /// No command is registered under this name.
    #[error("no command configured under '{0}'")]
    UnknownCommand(String),

    /// A dispatcher was invoked for an event configured with a different
    /// operation (e.g. `create` called for an update event).
    #[error("'{event_type}' is a {actual} event, not {expected}")]
    OperationMismatch {
        /// The event type involved.
        event_type: String,
        /// The operation the caller asked for.
        expected: Operation,
        /// The operation the event is configured with.
        actual: Operation,
    },

    /// An update or delete was dispatched without a target aggregate id.
    #[error("'{0}' requires a target aggregate id")]
    MissingTarget(String),

    /// A user command detected a conflicting concurrent change.
    #[error("command conflict: {0}")]
    Conflict(String),

    /// The event bus is terminated; dispatchers reject immediately.
    #[error("event bus is terminated")]
    Terminated,

    /// A repository operation outside the apply path failed (initial load,
    /// mark-recorded persistence, reset).
    #[error("repository operation failed")]
    Storage(#[source] RepositoryError),
}

impl DispatchError {
    /// Build an [`InvalidInput`](DispatchError::InvalidInput) from a single
    /// message, for failures that are not schema issue lists (e.g. a
    /// payload that cannot be represented as JSON).
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        DispatchError::InvalidInput(ValidationIssues(vec![
            crate::validate::ValidationIssue::new(message),
        ]))
    }
}

/// Error returned by broker lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Clearing the event log failed during reset.
    #[error("event log reset failed")]
    Storage(#[source] RepositoryError),

    /// Resetting a registered store failed.
    #[error("store '{aggregate_type}' reset failed")]
    Store {
        /// The store that failed.
        aggregate_type: String,
        /// The underlying failure.
        #[source]
        source: DispatchError,
    },
}
