//! Offline-first, distributed event-sourcing runtime for client
//! applications.
//!
//! `driftsync` derives all aggregate state from an append-only log of
//! events. Events dispatched locally are applied to in-memory state
//! immediately, persisted to an injected event log and snapshot store, and
//! recorded on a central server in the background; events produced on other
//! devices arrive through fetch or push and are applied identically. The
//! device stays usable while the network is away and resynchronizes on its
//! own once it returns.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Broker`] | Coordinator: owns the bus, registers stores, runs the sync loop |
//! | [`AggregateStore`] | Per-type projection engine: dispatchers, apply, mark-recorded |
//! | [`EventBus`] | Replaying, terminable pub/sub conduit |
//! | [`Event`] | One immutable state transition |
//! | [`Snapshot`] | Materialized current state of one aggregate |
//! | [`EventConfig`] | One event kind: handler, payload schema, policy |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use driftsync::{Broker, EventConfig, MemoryEventsRepository};
//! use serde::{Deserialize, Serialize};
//! use serde_json::{Value, json};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Profile {
//!     name: String,
//! }
//!
//! # async fn run(auth: Arc<dyn driftsync::AuthAdapter>) -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::builder(auth)
//!     .events_repository(Arc::new(MemoryEventsRepository::new()))
//!     .build();
//!
//! let profiles = broker
//!     .aggregate::<Profile>("profile")
//!     .event(EventConfig::create("profile.create", |payload: Option<&Value>| Profile {
//!         name: payload
//!             .and_then(|p| p.get("name"))
//!             .and_then(Value::as_str)
//!             .unwrap_or_default()
//!             .to_string(),
//!     }))
//!     .event(EventConfig::update("profile.update", |current, payload: Option<&Value>| {
//!         Profile {
//!             name: payload
//!                 .and_then(|p| p.get("name"))
//!                 .and_then(Value::as_str)
//!                 .unwrap_or(current.state.name.as_str())
//!                 .to_string(),
//!         }
//!     }))
//!     .register()?;
//!
//! let id = profiles.create("profile.create", json!({"name": "ada"})).await?;
//! profiles.update("profile.update", &id, json!({"name": "grace"})).await?;
//! assert_eq!(profiles.get(&id).unwrap().state.name, "grace");
//! # Ok(())
//! # }
//! ```
//!
//! Storage, transport, auth, and connectivity are all injected through the
//! narrow adapter traits in this crate; see [`EventsRepository`],
//! [`AggregateRepository`], [`AuthAdapter`], [`EventServerAdapter`], and
//! [`ConnectionStatusAdapter`].

mod aggregate;
mod auth;
mod broker;
mod bus;
mod error;
mod event;
mod memory;
mod repository;
mod server;
mod snapshot;
mod store;
mod sync;
mod validate;

pub use aggregate::{
    AggregateBuilder, AggregateConfig, CommandFn, CommandFuture, ConstructFn,
    DefaultDispatchPolicy, DestructFn, DispatchPolicy, EventConfig, EventHandler,
    RESERVED_STORE_NAMES, ReduceFn,
};
pub use auth::{Account, AuthAdapter};
pub use broker::{Broker, BrokerBuilder, DEFAULT_RETRY_SYNC_INTERVAL};
pub use bus::{EventBus, Subscription, TerminalError};
pub use error::{
    BoxError, BrokerError, BusError, ConfigError, DispatchError, RepositoryError, ServerError,
};
pub use event::{Event, IdGenerator, Operation, normalize_payload, random_id};
pub use memory::{MemoryAggregateRepository, MemoryEventsRepository};
pub use repository::{AggregateRepository, EventsRepository};
pub use server::{ConnectionStatusAdapter, EventServerAdapter};
pub use snapshot::{AggregateState, Snapshot};
pub use store::AggregateStore;
pub use validate::{TypedSchema, ValidationIssue, ValidationIssues, Validator};
