//! The aggregate store: one projection engine per aggregate type.
//!
//! A store exclusively owns the in-memory snapshot collection for its type.
//! Locally dispatched and remotely received events flow through the same
//! [`apply_event`](AggregateStore::apply_event) pipeline: compute the next
//! snapshot, update the collection optimistically, then persist to the
//! event log, the snapshot repository, and the bus, in that order. A
//! failure anywhere in persistence restores the collection and terminates
//! the bus instead of rethrowing -- the bus is the integrity boundary, and
//! a failed write means the process must stop propagating events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::aggregate::{AggregateConfig, CommandFn, DefaultDispatchPolicy, DispatchPolicy, EventConfig, EventHandler};
use crate::auth::AuthAdapter;
use crate::bus::{EventBus, Subscription};
use crate::error::{BoxError, ConfigError, DispatchError};
use crate::event::{Event, IdGenerator, Operation, normalize_payload};
use crate::repository::{AggregateRepository, EventsRepository};
use crate::snapshot::{AggregateState, Snapshot};
use crate::validate::Validator;

/// Callback observing the store's full collection on every committed
/// change.
type StateSubscriber<S> = Arc<dyn Fn(&HashMap<String, Snapshot<S>>) + Send + Sync>;

/// The broker-owned context shared by every store it registers.
#[derive(Clone)]
pub(crate) struct StoreContext {
    pub(crate) bus: Arc<EventBus>,
    pub(crate) auth: Arc<dyn AuthAdapter>,
    pub(crate) events_repository: Option<Arc<dyn EventsRepository>>,
    pub(crate) create_event_id: IdGenerator,
    pub(crate) default_dispatch_policy: Option<DefaultDispatchPolicy>,
}

/// The computed outcome of applying one event.
enum Transition<S> {
    Put(Snapshot<S>),
    Remove,
}

/// Type-erased store surface the broker routes incoming events through.
///
/// Mirrors the pattern of holding heterogeneous typed stores in one map:
/// each `AggregateStore<S>` erases to this trait when registered.
#[async_trait]
pub(crate) trait RegisteredStore: Send + Sync {
    fn aggregate_type(&self) -> &str;
    async fn apply(&self, event: Event) -> Result<(), DispatchError>;
    async fn mark_recorded_event(&self, event: &Event) -> Result<(), DispatchError>;
    async fn reset_store(&self) -> Result<(), DispatchError>;
}

/// Projection engine for one aggregate type.
///
/// Created by [`Broker::register`](crate::Broker::register); the broker
/// keeps a type-erased handle for event routing and hands the typed store
/// to the application for dispatching and reads.
pub struct AggregateStore<S> {
    aggregate_type: String,
    events: HashMap<String, EventConfig<S>>,
    commands: HashMap<String, CommandFn<S>>,
    aggregate_schema: Option<Arc<dyn Validator>>,
    repository: Option<Arc<dyn AggregateRepository<S>>>,
    create_aggregate_id: IdGenerator,
    default_policy: Option<DispatchPolicy<S>>,
    context: StoreContext,
    collection: Arc<Mutex<HashMap<String, Snapshot<S>>>>,
    subscribers: Arc<Mutex<Vec<(u64, StateSubscriber<S>)>>>,
    next_subscriber_id: AtomicU64,
    /// Latch for the one-time repository load. `tokio::sync::Mutex` because
    /// the load awaits the repository; the bool inside is the loaded flag.
    init: tokio::sync::Mutex<bool>,
    init_flag: AtomicBool,
}

impl<S: AggregateState> AggregateStore<S> {
    pub(crate) fn new(
        config: AggregateConfig<S>,
        context: StoreContext,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let create_aggregate_id = config
            .create_aggregate_id
            .unwrap_or_else(|| Arc::clone(&context.create_event_id));
        let events = config
            .events
            .into_iter()
            .map(|event| (event.event_type.clone(), event))
            .collect();
        let commands = config.commands.into_iter().collect();

        tracing::debug!(aggregate_type = %config.aggregate_type, "aggregate store created");

        Ok(Arc::new(Self {
            aggregate_type: config.aggregate_type,
            events,
            commands,
            aggregate_schema: config.aggregate_schema,
            repository: config.repository,
            create_aggregate_id,
            default_policy: config.default_dispatch_policy,
            context,
            collection: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber_id: AtomicU64::new(0),
            init: tokio::sync::Mutex::new(false),
            init_flag: AtomicBool::new(false),
        }))
    }

    /// The aggregate type this store owns.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Load the collection from the aggregate repository.
    ///
    /// Idempotent; every dispatcher and `apply_event` awaits it before
    /// touching state. Without a repository this only flips the flag.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Storage`] if the repository load fails; a later
    /// call retries.
    pub async fn initialize(&self) -> Result<(), DispatchError> {
        let mut init = self.init.lock().await;
        if *init {
            return Ok(());
        }
        let loaded = match &self.repository {
            Some(repository) => {
                let all = repository.get_all().await.map_err(DispatchError::Storage)?;
                let loaded = !all.is_empty();
                *self.collection.lock().expect("collection lock poisoned") = all;
                loaded
            }
            None => false,
        };
        *init = true;
        self.init_flag.store(true, Ordering::Release);
        drop(init);
        if loaded {
            self.notify_subscribers();
        }
        Ok(())
    }

    /// Whether the one-time repository load has completed.
    pub fn initialized(&self) -> bool {
        self.init_flag.load(Ordering::Acquire)
    }

    /// A point-in-time copy of the full collection.
    pub fn state(&self) -> HashMap<String, Snapshot<S>> {
        self.collection
            .lock()
            .expect("collection lock poisoned")
            .clone()
    }

    /// A point-in-time copy of one snapshot.
    pub fn get(&self, id: &str) -> Option<Snapshot<S>> {
        self.collection
            .lock()
            .expect("collection lock poisoned")
            .get(id)
            .cloned()
    }

    /// Observe the collection: `subscriber` is invoked immediately with the
    /// current map, then after every committed change.
    ///
    /// Changes that roll back are never observed; the collection a
    /// subscriber sees always corresponds to persisted state.
    pub fn subscribe(
        &self,
        subscriber: impl Fn(&HashMap<String, Snapshot<S>>) + Send + Sync + 'static,
    ) -> Subscription {
        let subscriber: StateSubscriber<S> = Arc::new(subscriber);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .push((id, Arc::clone(&subscriber)));

        let current = self.state();
        subscriber(&current);

        let weak = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subscribers) = weak.upgrade() {
                subscribers
                    .lock()
                    .expect("subscribers lock poisoned")
                    .retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }

    /// Dispatch a `create` event, returning the newly minted aggregate id.
    ///
    /// Pass `()` for payload-less events.
    ///
    /// # Errors
    ///
    /// Pre-persistence failures (`InvalidInput`, `Unauthorized`,
    /// `UnknownEvent`, `OperationMismatch`, `Terminated`) are returned; a
    /// persistence failure resolves successfully after rolling back and
    /// terminating the bus.
    pub async fn create(
        &self,
        event_type: &str,
        payload: impl Serialize,
    ) -> Result<String, DispatchError> {
        self.expect_operation(event_type, Operation::Create)?;
        self.dispatch_event(event_type, None, to_payload_value(payload)?)
            .await
    }

    /// Dispatch an `update` event against the aggregate `id`.
    pub async fn update(
        &self,
        event_type: &str,
        id: &str,
        payload: impl Serialize,
    ) -> Result<(), DispatchError> {
        self.expect_operation(event_type, Operation::Update)?;
        self.dispatch_event(event_type, Some(id), to_payload_value(payload)?)
            .await
            .map(|_| ())
    }

    /// Dispatch a `delete` event against the aggregate `id`.
    pub async fn delete(
        &self,
        event_type: &str,
        id: &str,
        payload: impl Serialize,
    ) -> Result<(), DispatchError> {
        self.expect_operation(event_type, Operation::Delete)?;
        self.dispatch_event(event_type, Some(id), to_payload_value(payload)?)
            .await
            .map(|_| ())
    }

    /// The single name-keyed dispatch surface.
    ///
    /// Routes by the configured operation: `create` events mint and return
    /// a new aggregate id (`target` is ignored); `update`/`delete` events
    /// require `target` and resolve to `None`.
    pub async fn dispatch(
        &self,
        event_type: &str,
        target: Option<&str>,
        payload: Value,
    ) -> Result<Option<String>, DispatchError> {
        let operation = self
            .events
            .get(event_type)
            .ok_or_else(|| DispatchError::UnknownEvent(event_type.to_string()))?
            .operation();
        let id = self.dispatch_event(event_type, target, payload).await?;
        Ok(match operation {
            Operation::Create => Some(id),
            _ => None,
        })
    }

    /// Invoke a configured user command.
    pub async fn command(
        &self,
        name: &str,
        input: Option<Value>,
    ) -> Result<Option<String>, DispatchError> {
        let command = self
            .commands
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownCommand(name.to_string()))?;
        command(self, input).await
    }

    /// Apply one event to the collection and persist it.
    ///
    /// Entry point for both locally produced and remotely received events.
    /// Pre-state failures are returned before any side effect:
    /// type mismatch, unknown event, operation mismatch, schema rejection,
    /// and update/delete on a missing aggregate. After the optimistic
    /// in-memory update, a failing persistence step (event log, snapshot
    /// repository, or bus emission) restores the previous collection,
    /// terminates the bus with the failure, and resolves `Ok` -- the
    /// termination hook is the funnel for those errors.
    pub async fn apply_event(&self, event: Event) -> Result<(), DispatchError> {
        if event.aggregate_type != self.aggregate_type {
            return Err(DispatchError::AggregateTypeMismatch {
                expected: self.aggregate_type.clone(),
                actual: event.aggregate_type,
            });
        }
        self.initialize().await?;

        let config = self
            .events
            .get(&event.event_type)
            .ok_or_else(|| DispatchError::UnknownEvent(event.event_type.clone()))?;
        if config.operation() != event.operation {
            return Err(DispatchError::OperationMismatch {
                event_type: event.event_type.clone(),
                expected: event.operation,
                actual: config.operation(),
            });
        }

        let current = self.get(&event.aggregate_id);
        if event.operation != Operation::Create && current.is_none() {
            return Err(DispatchError::NotFound {
                aggregate_id: event.aggregate_id.clone(),
            });
        }

        let transition = match (&config.handler, current.as_ref()) {
            (EventHandler::Create { construct }, _) => {
                let state = self.check_state(construct(event.payload.as_ref()))?;
                Transition::Put(Snapshot {
                    id: event.aggregate_id.clone(),
                    created_by: event.created_by.clone(),
                    created_on: event.created_on.clone(),
                    last_event_id: event.id.clone(),
                    created_at: event.dispatched_at,
                    updated_at: event.dispatched_at,
                    version: 1,
                    last_recorded_at: event.recorded_at,
                    state,
                })
            }
            (EventHandler::Update { reduce }, Some(current)) => {
                let state = self.check_state(reduce(current, event.payload.as_ref()))?;
                Transition::Put(Snapshot {
                    id: current.id.clone(),
                    created_by: current.created_by.clone(),
                    created_on: current.created_on.clone(),
                    last_event_id: event.id.clone(),
                    created_at: current.created_at,
                    updated_at: event.dispatched_at,
                    version: current.version + 1,
                    last_recorded_at: event.recorded_at.or(current.last_recorded_at),
                    state,
                })
            }
            (EventHandler::Delete { destruct }, Some(current)) => {
                if let Some(hook) = destruct {
                    hook(current, event.payload.as_ref());
                }
                Transition::Remove
            }
            // Excluded by the missing-snapshot check above.
            (_, None) => {
                return Err(DispatchError::NotFound {
                    aggregate_id: event.aggregate_id.clone(),
                });
            }
        };

        // Optimistic: `state()` readers see the transition before the
        // repositories do. Subscribers are notified only after commit.
        let previous = {
            let mut collection = self.collection.lock().expect("collection lock poisoned");
            let previous = collection.clone();
            match &transition {
                Transition::Put(snapshot) => {
                    collection.insert(event.aggregate_id.clone(), snapshot.clone());
                }
                Transition::Remove => {
                    collection.remove(&event.aggregate_id);
                }
            }
            previous
        };

        if let Err(error) = self.persist(&event, &transition).await {
            *self.collection.lock().expect("collection lock poisoned") = previous;
            tracing::error!(
                aggregate_type = %self.aggregate_type,
                event_id = %event.id,
                error = %error,
                "persistence failed; rolled back and terminating the bus"
            );
            self.context.bus.terminate(Some(Arc::from(error)));
            return Ok(());
        }

        self.notify_subscribers();
        Ok(())
    }

    /// Stamp a server-recorded event onto the aggregate and the event log.
    ///
    /// Sets the snapshot's `last_recorded_at`, backfills `created_by` when
    /// it was previously absent, persists the snapshot, and delegates to
    /// the event repository's `mark_recorded`. A missing aggregate is
    /// tolerated silently: it may have been deleted or superseded since
    /// the event was dispatched.
    ///
    /// # Errors
    ///
    /// `AggregateTypeMismatch` for events of another type; `InvalidInput`
    /// when the event carries no `recorded_at`; `Storage` when persistence
    /// fails.
    pub async fn mark_recorded(&self, event: &Event) -> Result<(), DispatchError> {
        if event.aggregate_type != self.aggregate_type {
            return Err(DispatchError::AggregateTypeMismatch {
                expected: self.aggregate_type.clone(),
                actual: event.aggregate_type.clone(),
            });
        }
        let Some(recorded_at) = event.recorded_at else {
            return Err(DispatchError::invalid_input(
                "mark_recorded requires an event with recorded_at set",
            ));
        };
        self.initialize().await?;

        let updated = {
            let mut collection = self.collection.lock().expect("collection lock poisoned");
            match collection.get_mut(&event.aggregate_id) {
                Some(snapshot) => {
                    snapshot.last_recorded_at = Some(recorded_at);
                    if snapshot.created_by.is_none() {
                        snapshot.created_by = event.created_by.clone();
                    }
                    Some(snapshot.clone())
                }
                None => None,
            }
        };

        match updated {
            Some(snapshot) => {
                if let Some(repository) = &self.repository {
                    repository
                        .update(&event.aggregate_id, &snapshot)
                        .await
                        .map_err(DispatchError::Storage)?;
                }
                self.notify_subscribers();
            }
            None => tracing::debug!(
                aggregate_type = %self.aggregate_type,
                aggregate_id = %event.aggregate_id,
                "aggregate missing while marking recorded; snapshot update skipped"
            ),
        }

        if let Some(repository) = &self.context.events_repository {
            repository
                .mark_recorded(&event.id, recorded_at, event.created_by.as_deref())
                .await
                .map_err(DispatchError::Storage)?;
        }
        Ok(())
    }

    /// Clear the collection and the snapshot repository, and require a
    /// fresh initialization before the next dispatch.
    pub async fn reset(&self) -> Result<(), DispatchError> {
        let mut init = self.init.lock().await;
        self.collection
            .lock()
            .expect("collection lock poisoned")
            .clear();
        if let Some(repository) = &self.repository {
            repository.delete_all().await.map_err(DispatchError::Storage)?;
        }
        *init = false;
        self.init_flag.store(false, Ordering::Release);
        drop(init);
        self.notify_subscribers();
        tracing::debug!(aggregate_type = %self.aggregate_type, "store reset");
        Ok(())
    }

    /// Build, authorize, and apply one event. The dispatcher pipeline:
    /// reject on a terminated bus, await initialization, normalize and
    /// validate the payload, stamp identity from the auth adapter, link
    /// `prev_id`, evaluate the dispatch policy, then `apply_event`.
    async fn dispatch_event(
        &self,
        event_type: &str,
        target: Option<&str>,
        payload: Value,
    ) -> Result<String, DispatchError> {
        if self.context.bus.is_terminated() {
            return Err(DispatchError::Terminated);
        }
        self.initialize().await?;

        let config = self
            .events
            .get(event_type)
            .ok_or_else(|| DispatchError::UnknownEvent(event_type.to_string()))?;
        let operation = config.operation();

        let payload = match &config.payload_schema {
            Some(schema) => schema.parse(&payload).map_err(DispatchError::InvalidInput)?,
            None => payload,
        };
        let payload = (!payload.is_null()).then_some(payload);

        let device_id = self.context.auth.device_id().await;
        let account = self.context.auth.account().await;

        let aggregate_id = match (operation, target) {
            (Operation::Create, _) => (self.create_aggregate_id)(),
            (_, Some(id)) => id.to_string(),
            (_, None) => return Err(DispatchError::MissingTarget(event_type.to_string())),
        };
        let current = self.get(&aggregate_id);

        let event = Event {
            id: (self.context.create_event_id)(),
            operation,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: aggregate_id.clone(),
            event_type: event_type.to_string(),
            payload,
            dispatched_at: Utc::now(),
            created_by: account.as_ref().map(|a| a.id().to_string()),
            created_on: device_id,
            prev_id: match operation {
                Operation::Create => None,
                _ => current.as_ref().map(|s| s.last_event_id.clone()),
            },
            recorded_at: None,
        };

        let allowed = match (&config.dispatch_policy, &self.default_policy) {
            (Some(policy), _) => policy(account.as_deref(), current.as_ref(), &event),
            (None, Some(policy)) => policy(account.as_deref(), current.as_ref(), &event),
            (None, None) => match &self.context.default_dispatch_policy {
                Some(policy) => policy(account.as_deref(), &event),
                None => true,
            },
        };
        if !allowed {
            return Err(DispatchError::Unauthorized {
                event_type: event_type.to_string(),
            });
        }

        self.apply_event(event).await?;
        Ok(aggregate_id)
    }

    /// Run the three persistence steps in order: event log, snapshot
    /// repository, bus emission.
    async fn persist(&self, event: &Event, transition: &Transition<S>) -> Result<(), BoxError> {
        if let Some(repository) = &self.context.events_repository {
            repository.create(event).await?;
        }
        if let Some(repository) = &self.repository {
            match transition {
                Transition::Put(snapshot) if event.operation == Operation::Create => {
                    repository.create(snapshot).await?;
                }
                Transition::Put(snapshot) => {
                    repository.update(&event.aggregate_id, snapshot).await?;
                }
                Transition::Remove => {
                    repository.delete(&event.aggregate_id).await?;
                }
            }
        }
        self.context.bus.dispatch(event)?;
        Ok(())
    }

    /// Validate a computed state against the aggregate schema, if one is
    /// configured.
    fn check_state(&self, state: S) -> Result<S, DispatchError> {
        let Some(schema) = &self.aggregate_schema else {
            return Ok(state);
        };
        let value = serde_json::to_value(&state)
            .map_err(|e| DispatchError::invalid_input(e.to_string()))?;
        let parsed = schema.parse(&value).map_err(DispatchError::InvalidInput)?;
        serde_json::from_value(parsed).map_err(|e| DispatchError::invalid_input(e.to_string()))
    }

    fn expect_operation(&self, event_type: &str, expected: Operation) -> Result<(), DispatchError> {
        let actual = self
            .events
            .get(event_type)
            .ok_or_else(|| DispatchError::UnknownEvent(event_type.to_string()))?
            .operation();
        if actual != expected {
            return Err(DispatchError::OperationMismatch {
                event_type: event_type.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn notify_subscribers(&self) {
        let current = self.state();
        let subscribers: Vec<_> = self
            .subscribers
            .lock()
            .expect("subscribers lock poisoned")
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();
        for subscriber in subscribers {
            subscriber(&current);
        }
    }
}

impl<S> std::fmt::Debug for AggregateStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("aggregate_type", &self.aggregate_type)
            .field("events", &self.events.len())
            .field("initialized", &self.init_flag.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl<S: AggregateState> RegisteredStore for AggregateStore<S> {
    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    async fn apply(&self, event: Event) -> Result<(), DispatchError> {
        self.apply_event(event).await
    }

    async fn mark_recorded_event(&self, event: &Event) -> Result<(), DispatchError> {
        self.mark_recorded(event).await
    }

    async fn reset_store(&self) -> Result<(), DispatchError> {
        self.reset().await
    }
}

/// Normalize a dispatcher payload into a JSON value.
fn to_payload_value(payload: impl Serialize) -> Result<Value, DispatchError> {
    normalize_payload(&payload).map_err(|e| DispatchError::invalid_input(e.to_string()))
}
