//! Aggregate configuration: event handlers, policies, commands, and the
//! fluent registration builder.
//!
//! Each event kind an aggregate understands is described by one
//! [`EventConfig`]. The handler is a tagged variant over the three
//! operations, so the operation an event performs and the code that
//! computes its state transition cannot disagree.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::auth::Account;
use crate::broker::Broker;
use crate::error::{ConfigError, DispatchError};
use crate::event::{Event, IdGenerator, Operation};
use crate::repository::AggregateRepository;
use crate::snapshot::{AggregateState, Snapshot};
use crate::store::AggregateStore;
use crate::validate::Validator;

/// Builds the initial user state for a `create` event from its payload.
pub type ConstructFn<S> = Arc<dyn Fn(Option<&Value>) -> S + Send + Sync>;

/// Folds an `update` event's payload into the current snapshot, producing
/// the next user state.
pub type ReduceFn<S> = Arc<dyn Fn(&Snapshot<S>, Option<&Value>) -> S + Send + Sync>;

/// Side-effect hook invoked just before a `delete` removes the snapshot.
pub type DestructFn<S> = Arc<dyn Fn(&Snapshot<S>, Option<&Value>) + Send + Sync>;

/// Authorization check evaluated before a locally dispatched event is
/// applied. Receives the current account, the current snapshot (absent for
/// `create`), and the fully built event.
pub type DispatchPolicy<S> =
    Arc<dyn Fn(Option<&dyn Account>, Option<&Snapshot<S>>, &Event) -> bool + Send + Sync>;

/// Broker-wide fallback policy. Snapshot-agnostic, because one policy spans
/// every registered aggregate type.
pub type DefaultDispatchPolicy = Arc<dyn Fn(Option<&dyn Account>, &Event) -> bool + Send + Sync>;

/// Future returned by a user command.
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<String>, DispatchError>> + Send + 'a>>;

/// A user command: a named composite operation that drives one or more
/// dispatchers on its store. Resolves to a newly created aggregate id when
/// the command creates one.
pub type CommandFn<S> =
    Arc<dyn for<'a> Fn(&'a AggregateStore<S>, Option<Value>) -> CommandFuture<'a> + Send + Sync>;

/// Names the store claims for itself; event types and commands may not
/// shadow them.
pub const RESERVED_STORE_NAMES: &[&str] = &[
    "state",
    "subscribe",
    "reset",
    "initialize",
    "initialized",
    "mark_recorded",
    "apply_event",
];

/// The state-transition code for one event kind.
///
/// Exactly one variant exists per event config, and the variant determines
/// the event's [`Operation`].
#[derive(Clone)]
pub enum EventHandler<S> {
    /// Brings a new aggregate into existence.
    Create {
        /// Builds the initial user state from the payload.
        construct: ConstructFn<S>,
    },
    /// Advances a live aggregate.
    Update {
        /// Folds the payload into the current snapshot.
        reduce: ReduceFn<S>,
    },
    /// Removes a live aggregate.
    Delete {
        /// Optional hook for teardown side effects.
        destruct: Option<DestructFn<S>>,
    },
}

impl<S> EventHandler<S> {
    /// The operation this handler performs.
    pub fn operation(&self) -> Operation {
        match self {
            EventHandler::Create { .. } => Operation::Create,
            EventHandler::Update { .. } => Operation::Update,
            EventHandler::Delete { .. } => Operation::Delete,
        }
    }
}

impl<S> std::fmt::Debug for EventHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandler").field(&self.operation()).finish()
    }
}

/// Immutable metadata for one event kind.
#[derive(Clone)]
pub struct EventConfig<S> {
    /// Logical event name, e.g. `"profile.create"`.
    pub event_type: String,
    /// Transition code; the variant fixes the operation.
    pub handler: EventHandler<S>,
    /// Payload schema; dispatchers reject non-conforming payloads with
    /// `InvalidInput` before any side effect.
    pub payload_schema: Option<Arc<dyn Validator>>,
    /// Event-level policy; overrides the aggregate and broker defaults.
    pub dispatch_policy: Option<DispatchPolicy<S>>,
}

impl<S: AggregateState> EventConfig<S> {
    /// Configure a `create` event.
    pub fn create(
        event_type: impl Into<String>,
        construct: impl Fn(Option<&Value>) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            handler: EventHandler::Create {
                construct: Arc::new(construct),
            },
            payload_schema: None,
            dispatch_policy: None,
        }
    }

    /// Configure an `update` event.
    pub fn update(
        event_type: impl Into<String>,
        reduce: impl Fn(&Snapshot<S>, Option<&Value>) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            handler: EventHandler::Update {
                reduce: Arc::new(reduce),
            },
            payload_schema: None,
            dispatch_policy: None,
        }
    }

    /// Configure a `delete` event with no teardown hook.
    pub fn delete(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            handler: EventHandler::Delete { destruct: None },
            payload_schema: None,
            dispatch_policy: None,
        }
    }

    /// Attach a teardown hook. Only meaningful on `delete` configs; a
    /// non-delete handler is left untouched.
    pub fn destruct(
        mut self,
        hook: impl Fn(&Snapshot<S>, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        if let EventHandler::Delete { destruct } = &mut self.handler {
            *destruct = Some(Arc::new(hook));
        }
        self
    }

    /// Attach a payload schema.
    pub fn payload_schema(mut self, schema: impl Validator + 'static) -> Self {
        self.payload_schema = Some(Arc::new(schema));
        self
    }

    /// Attach an event-level dispatch policy.
    pub fn dispatch_policy(
        mut self,
        policy: impl Fn(Option<&dyn Account>, Option<&Snapshot<S>>, &Event) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.dispatch_policy = Some(Arc::new(policy));
        self
    }

    /// The operation this event performs.
    pub fn operation(&self) -> Operation {
        self.handler.operation()
    }
}

impl<S> std::fmt::Debug for EventConfig<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConfig")
            .field("event_type", &self.event_type)
            .field("operation", &self.handler.operation())
            .field("has_payload_schema", &self.payload_schema.is_some())
            .field("has_dispatch_policy", &self.dispatch_policy.is_some())
            .finish()
    }
}

/// Everything the broker needs to instantiate an aggregate store.
pub struct AggregateConfig<S> {
    /// The aggregate type tag events are routed by.
    pub aggregate_type: String,
    /// Optional schema validating each computed snapshot state.
    pub aggregate_schema: Option<Arc<dyn Validator>>,
    /// Snapshot persistence; `None` keeps the collection memory-only.
    pub repository: Option<Arc<dyn AggregateRepository<S>>>,
    /// One config per event kind.
    pub events: Vec<EventConfig<S>>,
    /// Named user commands.
    pub commands: Vec<(String, CommandFn<S>)>,
    /// Id minting for `create` dispatchers; falls back to the broker's
    /// event-id generator.
    pub create_aggregate_id: Option<IdGenerator>,
    /// Aggregate-level policy applied when an event config has none.
    pub default_dispatch_policy: Option<DispatchPolicy<S>>,
}

impl<S: AggregateState> AggregateConfig<S> {
    /// Start an empty config for `aggregate_type`.
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_schema: None,
            repository: None,
            events: Vec::new(),
            commands: Vec::new(),
            create_aggregate_id: None,
            default_dispatch_policy: None,
        }
    }

    /// Reject configurations with an empty type tag, duplicate event or
    /// command names, or names colliding with the store's own surface.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregate_type.is_empty() {
            return Err(ConfigError::EmptyAggregateType);
        }

        let mut event_types = HashSet::new();
        for event in &self.events {
            if RESERVED_STORE_NAMES.contains(&event.event_type.as_str()) {
                return Err(ConfigError::RestrictedName(event.event_type.clone()));
            }
            if !event_types.insert(event.event_type.as_str()) {
                return Err(ConfigError::DuplicateEvent(event.event_type.clone()));
            }
        }

        let mut command_names = HashSet::new();
        for (name, _) in &self.commands {
            if RESERVED_STORE_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::RestrictedName(name.clone()));
            }
            if !command_names.insert(name.as_str()) {
                return Err(ConfigError::DuplicateCommand(name.clone()));
            }
        }

        Ok(())
    }
}

impl<S> std::fmt::Debug for AggregateConfig<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateConfig")
            .field("aggregate_type", &self.aggregate_type)
            .field("events", &self.events.len())
            .field("commands", &self.commands.len())
            .field("has_repository", &self.repository.is_some())
            .finish()
    }
}

/// Fluent builder for registering an aggregate with a broker.
///
/// Produced by [`Broker::aggregate`]; `register()` validates the
/// accumulated [`AggregateConfig`] and hands it to [`Broker::register`].
///
/// # Examples
///
/// ```no_run
/// # use driftsync::{Broker, EventConfig};
/// # use serde::{Deserialize, Serialize};
/// # use serde_json::Value;
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Profile { name: String }
///
/// # fn example(broker: &Broker) -> Result<(), driftsync::ConfigError> {
/// let profiles = broker
///     .aggregate::<Profile>("profile")
///     .event(EventConfig::create("profile.create", |payload: Option<&Value>| Profile {
///         name: payload
///             .and_then(|p| p.get("name"))
///             .and_then(Value::as_str)
///             .unwrap_or_default()
///             .to_string(),
///     }))
///     .register()?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateBuilder<'a, S> {
    broker: &'a Broker,
    config: AggregateConfig<S>,
}

impl<'a, S: AggregateState> AggregateBuilder<'a, S> {
    pub(crate) fn new(broker: &'a Broker, aggregate_type: impl Into<String>) -> Self {
        Self {
            broker,
            config: AggregateConfig::new(aggregate_type),
        }
    }

    /// Validate every computed snapshot state against `schema`.
    pub fn schema(mut self, schema: impl Validator + 'static) -> Self {
        self.config.aggregate_schema = Some(Arc::new(schema));
        self
    }

    /// Persist snapshots through `repository`.
    pub fn repository(mut self, repository: Arc<dyn AggregateRepository<S>>) -> Self {
        self.config.repository = Some(repository);
        self
    }

    /// Add one event kind.
    pub fn event(mut self, event: EventConfig<S>) -> Self {
        self.config.events.push(event);
        self
    }

    /// Add a named user command.
    pub fn command(
        mut self,
        name: impl Into<String>,
        command: impl for<'c> Fn(&'c AggregateStore<S>, Option<Value>) -> CommandFuture<'c>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.config.commands.push((name.into(), Arc::new(command)));
        self
    }

    /// Mint aggregate ids for `create` dispatchers with `generator` instead
    /// of the broker's event-id generator.
    pub fn aggregate_id_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.config.create_aggregate_id = Some(Arc::new(generator));
        self
    }

    /// Aggregate-level dispatch policy, applied when an event config has
    /// none of its own.
    pub fn dispatch_policy(
        mut self,
        policy: impl Fn(Option<&dyn Account>, Option<&Snapshot<S>>, &Event) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.config.default_dispatch_policy = Some(Arc::new(policy));
        self
    }

    /// Validate and register, returning the live store.
    pub fn register(self) -> Result<Arc<AggregateStore<S>>, ConfigError> {
        self.broker.register(self.config)
    }
}
