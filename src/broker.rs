//! The broker: owner of the bus, the store registry, and the sync machinery.
//!
//! The broker wires the offline-first loop together: every event emitted on
//! the bus without a `recorded_at` flows through an mpsc channel into a
//! background recorder that ships it to the server; the sync loop flushes
//! whatever the recorder could not deliver and ingests remote events; pushed
//! events route straight into the owning store. Stores never see the broker
//! -- they hold only the bus -- so the ownership cycle is broken by plain
//! message passing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::aggregate::{AggregateBuilder, AggregateConfig, DefaultDispatchPolicy};
use crate::auth::AuthAdapter;
use crate::bus::{EventBus, Subscription, TerminalError};
use crate::error::{BrokerError, ConfigError};
use crate::event::{Event, IdGenerator, random_id};
use crate::repository::EventsRepository;
use crate::server::{ConnectionStatusAdapter, EventServerAdapter};
use crate::snapshot::AggregateState;
use crate::store::{AggregateStore, RegisteredStore, StoreContext};
use crate::sync::{SyncLoopHandle, spawn_sync_loop};

/// Default period of the retry sync loop: five minutes.
pub const DEFAULT_RETRY_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Shared broker state referenced by the background tasks.
pub(crate) struct BrokerInner {
    pub(crate) bus: Arc<EventBus>,
    pub(crate) auth: Arc<dyn AuthAdapter>,
    pub(crate) events_repository: Option<Arc<dyn EventsRepository>>,
    pub(crate) server: Option<Arc<dyn EventServerAdapter>>,
    pub(crate) connection: Option<Arc<dyn ConnectionStatusAdapter>>,
    pub(crate) retry_sync_interval: Duration,
    stores: RwLock<HashMap<String, Arc<dyn RegisteredStore>>>,
    create_event_id: IdGenerator,
    default_dispatch_policy: Option<DefaultDispatchPolicy>,
    /// Single-flight gate: holds the completion signal of the in-flight
    /// sync, if any. Followers await it instead of starting another pass.
    sync_flight: tokio::sync::Mutex<Option<watch::Receiver<bool>>>,
}

impl BrokerInner {
    fn store_context(&self) -> StoreContext {
        StoreContext {
            bus: Arc::clone(&self.bus),
            auth: Arc::clone(&self.auth),
            events_repository: self.events_repository.clone(),
            create_event_id: Arc::clone(&self.create_event_id),
            default_dispatch_policy: self.default_dispatch_policy.clone(),
        }
    }

    fn store_for(&self, aggregate_type: &str) -> Option<Arc<dyn RegisteredStore>> {
        self.stores
            .read()
            .expect("stores lock poisoned")
            .get(aggregate_type)
            .cloned()
    }

    /// Record one event on the server and mark it recorded locally.
    ///
    /// Skips silently when the event is already recorded, no server is
    /// configured, or no account is signed in (the event stays unrecorded
    /// and the sync loop retries it later). Server failures are swallowed
    /// the same way; all record errors are currently treated as retryable.
    pub(crate) async fn record_event(&self, event: Event) {
        if event.recorded_at.is_some() {
            return;
        }
        let Some(server) = &self.server else {
            return;
        };
        if self.auth.account().await.is_none() {
            tracing::debug!(event_id = %event.id, "no account signed in; leaving event unrecorded");
            return;
        }

        match server.record(&event).await {
            Ok(recorded) => match self.store_for(&recorded.aggregate_type) {
                Some(store) => {
                    if let Err(error) = store.mark_recorded_event(&recorded).await {
                        tracing::error!(
                            event_id = %recorded.id,
                            error = %error,
                            "failed to mark event recorded"
                        );
                    }
                }
                None => tracing::warn!(
                    aggregate_type = %recorded.aggregate_type,
                    "recorded event targets an unregistered aggregate type"
                ),
            },
            Err(error) => tracing::warn!(
                event_id = %event.id,
                error = %error,
                "record failed; will retry on next sync"
            ),
        }
    }

    /// Route a remotely received event into the store owning its type.
    pub(crate) async fn route_incoming(&self, event: Event) {
        match self.store_for(&event.aggregate_type) {
            Some(store) => {
                if let Err(error) = store.apply(event).await {
                    tracing::warn!(error = %error, "failed to apply incoming event");
                }
            }
            None => tracing::warn!(
                aggregate_type = %event.aggregate_type,
                "incoming event targets an unregistered aggregate type"
            ),
        }
    }

    /// Single-flight sync: the first caller becomes the leader and runs the
    /// pass; everyone arriving while it runs awaits the same completion.
    pub(crate) async fn sync(self: &Arc<Self>) {
        enum Role {
            Leader(watch::Sender<bool>),
            Follower(watch::Receiver<bool>),
        }

        let role = {
            let mut flight = self.sync_flight.lock().await;
            match flight.as_ref() {
                Some(receiver) => Role::Follower(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(false);
                    *flight = Some(receiver);
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Follower(mut receiver) => {
                let _ = receiver.changed().await;
            }
            Role::Leader(sender) => {
                self.run_sync().await;
                let mut flight = self.sync_flight.lock().await;
                *flight = None;
                let _ = sender.send(true);
            }
        }
    }

    /// One reconciliation pass: flush unrecorded local events in parallel,
    /// then fetch remote events from the last-received cursor and apply
    /// them in order.
    async fn run_sync(self: &Arc<Self>) {
        tracing::debug!("sync pass started");

        if let (Some(repository), Some(_)) = (&self.events_repository, &self.server) {
            match repository.get_unrecorded().await {
                Ok(unrecorded) if !unrecorded.is_empty() => {
                    tracing::info!(count = unrecorded.len(), "recording pending events");
                    let mut records = JoinSet::new();
                    for event in unrecorded {
                        let inner = Arc::clone(self);
                        records.spawn(async move { inner.record_event(event).await });
                    }
                    while let Some(joined) = records.join_next().await {
                        if let Err(error) = joined {
                            tracing::error!(error = %error, "record task panicked");
                        }
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "could not load unrecorded events");
                }
            }
        }

        let Some(server) = &self.server else {
            return;
        };
        let last_received_id = match &self.events_repository {
            Some(repository) => {
                let device_id = self.auth.device_id().await;
                match repository.get_last_received(&device_id).await {
                    Ok(last) => last.map(|event| event.id),
                    Err(error) => {
                        tracing::warn!(error = %error, "could not resolve fetch cursor");
                        None
                    }
                }
            }
            None => None,
        };

        match server.fetch(last_received_id.as_deref()).await {
            Ok(events) => {
                if !events.is_empty() {
                    tracing::info!(count = events.len(), "applying fetched events");
                }
                for event in events {
                    self.route_incoming(event).await;
                }
            }
            Err(error) => tracing::warn!(error = %error, "fetch failed; will retry next cycle"),
        }
    }
}

/// The background machinery of one broker: the bus-to-recorder pump, the
/// optional push router, and the sync loop.
struct BrokerTasks {
    recorder_sub: Subscription,
    recorder: JoinHandle<()>,
    push: Option<JoinHandle<()>>,
    sync_loop: SyncLoopHandle,
}

/// Coordinator of the offline-first runtime.
///
/// Owns the event bus, registers one [`AggregateStore`] per aggregate type,
/// records locally dispatched events on the server, ingests remote events,
/// and keeps everything reconciled through the connection-driven retry
/// loop.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use driftsync::{Broker, MemoryEventsRepository};
/// # fn example(auth: Arc<dyn driftsync::AuthAdapter>) {
/// let broker = Broker::builder(auth)
///     .events_repository(Arc::new(MemoryEventsRepository::new()))
///     .build();
/// # }
/// ```
pub struct Broker {
    inner: Arc<BrokerInner>,
    tasks: Mutex<Option<BrokerTasks>>,
}

impl Broker {
    /// Start configuring a broker around the one required collaborator.
    pub fn builder(auth: Arc<dyn AuthAdapter>) -> BrokerBuilder {
        BrokerBuilder {
            auth,
            create_event_id: Arc::new(random_id),
            default_dispatch_policy: None,
            events_repository: None,
            server: None,
            connection: None,
            retry_sync_interval: DEFAULT_RETRY_SYNC_INTERVAL,
            on_termination: None,
        }
    }

    /// The shared event bus, for external subscribers.
    ///
    /// External code observes only; `dispatch` and `terminate` belong to
    /// the stores and the broker.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Instantiate and index a store for `config.aggregate_type`.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the config fails validation or the type is
    /// already registered.
    pub fn register<S: AggregateState>(
        &self,
        config: AggregateConfig<S>,
    ) -> Result<Arc<AggregateStore<S>>, ConfigError> {
        let aggregate_type = config.aggregate_type.clone();
        if self
            .inner
            .stores
            .read()
            .expect("stores lock poisoned")
            .contains_key(&aggregate_type)
        {
            return Err(ConfigError::DuplicateAggregateType(aggregate_type));
        }

        let store = AggregateStore::new(config, self.inner.store_context())?;
        self.inner
            .stores
            .write()
            .expect("stores lock poisoned")
            .insert(
                aggregate_type.clone(),
                Arc::clone(&store) as Arc<dyn RegisteredStore>,
            );
        tracing::debug!(aggregate_type = %aggregate_type, "aggregate store registered");
        Ok(store)
    }

    /// Fluent registration: configure an aggregate and `register()` it.
    pub fn aggregate<S: AggregateState>(
        &self,
        aggregate_type: impl Into<String>,
    ) -> AggregateBuilder<'_, S> {
        AggregateBuilder::new(self, aggregate_type)
    }

    /// Reconcile with the server now.
    ///
    /// Single-flight: a call arriving while a sync is in flight awaits that
    /// sync instead of starting another. Failures are logged and retried on
    /// the next cycle; quiescent input produces no server writes.
    pub async fn sync(&self) {
        self.inner.sync().await;
    }

    /// Tear everything down, wipe local event and snapshot data, and start
    /// fresh: stops the background tasks, deletes all events from the event
    /// repository, resets the bus and every store, then reinitializes the
    /// subscriptions and the sync loop.
    ///
    /// # Errors
    ///
    /// [`BrokerError`] when clearing a repository fails. The background
    /// tasks are restarted either way.
    pub async fn reset(&self) -> Result<(), BrokerError> {
        self.stop_tasks().await;
        let result = self.reset_data().await;
        self.start_tasks();
        result
    }

    /// Stop the recorder, push router, and sync loop; leave all data
    /// intact. Idempotent.
    pub async fn shutdown(&self) {
        self.stop_tasks().await;
        tracing::debug!("broker shut down");
    }

    async fn reset_data(&self) -> Result<(), BrokerError> {
        if let Some(repository) = &self.inner.events_repository {
            repository.delete_all().await.map_err(BrokerError::Storage)?;
        }
        self.inner.bus.reset();

        let stores: Vec<_> = self
            .inner
            .stores
            .read()
            .expect("stores lock poisoned")
            .values()
            .cloned()
            .collect();
        for store in stores {
            store
                .reset_store()
                .await
                .map_err(|source| BrokerError::Store {
                    aggregate_type: store.aggregate_type().to_string(),
                    source,
                })?;
        }
        tracing::info!("broker reset");
        Ok(())
    }

    fn start_tasks(&self) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if tasks.is_some() {
            return;
        }

        // Recorder: a plain bus subscriber pumps unrecorded events into a
        // channel; the task drains it. The subscriber stays synchronous, so
        // bus dispatch never blocks on the network.
        let (record_tx, mut record_rx) = mpsc::unbounded_channel::<Event>();
        let recorder_sub = self.inner.bus.subscribe(move |event| {
            if event.recorded_at.is_none() {
                let _ = record_tx.send(event.clone());
            }
            Ok(())
        });
        let recorder_inner = Arc::clone(&self.inner);
        let recorder = tokio::spawn(async move {
            while let Some(event) = record_rx.recv().await {
                recorder_inner.record_event(event).await;
            }
        });

        let push = self
            .inner
            .server
            .as_ref()
            .and_then(|server| server.subscribe())
            .map(|mut push_rx| {
                let push_inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    while let Some(event) = push_rx.recv().await {
                        push_inner.route_incoming(event).await;
                    }
                })
            });

        let sync_loop = spawn_sync_loop(Arc::clone(&self.inner));

        *tasks = Some(BrokerTasks {
            recorder_sub,
            recorder,
            push,
            sync_loop,
        });
    }

    async fn stop_tasks(&self) {
        let taken = self.tasks.lock().expect("tasks lock poisoned").take();
        let Some(tasks) = taken else {
            return;
        };
        // Unsubscribing drops the channel sender, so the recorder drains
        // whatever is queued and exits on its own.
        tasks.recorder_sub.unsubscribe();
        tasks.sync_loop.shutdown().await;
        if let Some(push) = tasks.push {
            push.abort();
        }
        if let Err(error) = tasks.recorder.await {
            if !error.is_cancelled() {
                tracing::error!(error = %error, "recorder task panicked");
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // Best-effort teardown so dropped brokers do not leave tasks
        // spinning on the runtime.
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(tasks) = tasks.take() {
                tasks.recorder_sub.unsubscribe();
                tasks.recorder.abort();
                if let Some(push) = tasks.push {
                    push.abort();
                }
                tasks.sync_loop.abort();
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores = self.inner.stores.read().expect("stores lock poisoned");
        f.debug_struct("Broker")
            .field("stores", &stores.keys().collect::<Vec<_>>())
            .field("retry_sync_interval", &self.inner.retry_sync_interval)
            .finish()
    }
}

/// Configures and builds a [`Broker`].
pub struct BrokerBuilder {
    auth: Arc<dyn AuthAdapter>,
    create_event_id: IdGenerator,
    default_dispatch_policy: Option<DefaultDispatchPolicy>,
    events_repository: Option<Arc<dyn EventsRepository>>,
    server: Option<Arc<dyn EventServerAdapter>>,
    connection: Option<Arc<dyn ConnectionStatusAdapter>>,
    retry_sync_interval: Duration,
    on_termination: Option<Box<dyn FnOnce(Option<TerminalError>) + Send>>,
}

impl BrokerBuilder {
    /// Override the event/aggregate id generator (default: UUID v4).
    pub fn event_id_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.create_event_id = Arc::new(generator);
        self
    }

    /// Broker-wide dispatch policy, used when neither the event nor the
    /// aggregate configures one.
    pub fn default_dispatch_policy(
        mut self,
        policy: impl Fn(Option<&dyn crate::auth::Account>, &Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.default_dispatch_policy = Some(Arc::new(policy));
        self
    }

    /// The local event log shared by all stores.
    pub fn events_repository(mut self, repository: Arc<dyn EventsRepository>) -> Self {
        self.events_repository = Some(repository);
        self
    }

    /// The central event server.
    pub fn event_server_adapter(mut self, server: Arc<dyn EventServerAdapter>) -> Self {
        self.server = Some(server);
        self
    }

    /// The connectivity observer driving opportunistic syncs.
    pub fn connection_status_adapter(
        mut self,
        connection: Arc<dyn ConnectionStatusAdapter>,
    ) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Period of the retry sync loop (default: five minutes). Triggers are
    /// throttled to at most one sync per fifth of this interval.
    pub fn retry_sync_interval(mut self, interval: Duration) -> Self {
        self.retry_sync_interval = interval;
        self
    }

    /// Hook invoked once if the bus terminates, with the terminal error.
    pub fn on_termination(
        mut self,
        hook: impl FnOnce(Option<TerminalError>) + Send + 'static,
    ) -> Self {
        self.on_termination = Some(Box::new(hook));
        self
    }

    /// Build the broker: creates the bus, wires the termination hook, and
    /// starts the recorder, push router, and sync loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, because the background
    /// tasks are spawned immediately.
    pub fn build(self) -> Broker {
        let bus = Arc::new(EventBus::new());
        if let Some(hook) = self.on_termination {
            bus.on_termination(hook);
        }

        let inner = Arc::new(BrokerInner {
            bus,
            auth: self.auth,
            events_repository: self.events_repository,
            server: self.server,
            connection: self.connection,
            retry_sync_interval: self.retry_sync_interval,
            stores: RwLock::new(HashMap::new()),
            create_event_id: self.create_event_id,
            default_dispatch_policy: self.default_dispatch_policy,
            sync_flight: tokio::sync::Mutex::new(None),
        });

        let broker = Broker {
            inner,
            tasks: Mutex::new(None),
        };
        broker.start_tasks();
        broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Profile, profile_config};
    use crate::auth::test_fixtures::StaticAuth;
    use crate::error::DispatchError;
    use crate::memory::test_fixtures::FlakyEventsRepository;
    use crate::memory::{MemoryAggregateRepository, MemoryEventsRepository};
    use crate::repository::AggregateRepository;
    use crate::server::test_fixtures::{ManualConnection, ScriptedServer};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Yield long enough for the background tasks to drain their queues.
    /// Instant under paused time.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    struct World {
        broker: Broker,
        store: Arc<AggregateStore<Profile>>,
        auth: Arc<StaticAuth>,
        events: Arc<MemoryEventsRepository>,
        snapshots: Arc<MemoryAggregateRepository<Profile>>,
        server: Arc<ScriptedServer>,
        connection: Arc<ManualConnection>,
    }

    fn world(auth: Arc<StaticAuth>, initial_connection: Option<bool>) -> World {
        let events = Arc::new(MemoryEventsRepository::new());
        let snapshots = Arc::new(MemoryAggregateRepository::<Profile>::new());
        let server = ScriptedServer::new();
        let connection = ManualConnection::new(initial_connection);

        let broker = Broker::builder(Arc::clone(&auth) as Arc<dyn AuthAdapter>)
            .events_repository(Arc::clone(&events) as Arc<dyn EventsRepository>)
            .event_server_adapter(Arc::clone(&server) as Arc<dyn EventServerAdapter>)
            .connection_status_adapter(
                Arc::clone(&connection) as Arc<dyn ConnectionStatusAdapter>
            )
            .build();

        let mut config = profile_config();
        config.repository = Some(Arc::clone(&snapshots) as Arc<dyn AggregateRepository<Profile>>);
        let store = broker.register(config).expect("register should succeed");

        World {
            broker,
            store,
            auth,
            events,
            snapshots,
            server,
            connection,
        }
    }

    fn remote_create(aggregate_id: &str, name: &str) -> Event {
        Event {
            id: crate::event::random_id(),
            operation: crate::event::Operation::Create,
            aggregate_type: "profile".to_string(),
            aggregate_id: aggregate_id.to_string(),
            event_type: "profile.create".to_string(),
            payload: Some(json!({"name": name})),
            dispatched_at: Utc::now(),
            created_by: Some("acct-remote".to_string()),
            created_on: "device-2".to_string(),
            prev_id: None,
            recorded_at: Some(Utc::now()),
        }
    }

    fn remote_update(aggregate_id: &str, prev_id: &str, name: &str) -> Event {
        Event {
            id: crate::event::random_id(),
            operation: crate::event::Operation::Update,
            aggregate_type: "profile".to_string(),
            aggregate_id: aggregate_id.to_string(),
            event_type: "profile.update".to_string(),
            payload: Some(json!({"name": name})),
            dispatched_at: Utc::now(),
            created_by: Some("acct-remote".to_string()),
            created_on: "device-2".to_string(),
            prev_id: Some(prev_id.to_string()),
            recorded_at: Some(Utc::now()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatched_events_are_recorded_in_the_background() {
        let w = world(StaticAuth::logged_in("device-1", "acct-1"), Some(true));
        let id = w
            .store
            .create("profile.create", json!({"name": "a"}))
            .await
            .expect("create should succeed");
        settle().await;

        assert_eq!(w.server.recorded_ids().len(), 1);
        let log = w.events.events();
        assert!(log[0].recorded_at.is_some(), "log entry should be marked");
        let snapshot = w.store.get(&id).expect("snapshot should exist");
        assert!(snapshot.last_recorded_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_sync_fetches_from_null_cursor() {
        let events = Arc::new(MemoryEventsRepository::new());
        let server = ScriptedServer::new();
        let e1 = remote_create("G", "s");
        let e2 = remote_update("G", &e1.id, "s2");
        server.set_fetch_backlog(vec![e1, e2]);

        let broker = Broker::builder(
            StaticAuth::logged_in("device-1", "acct-1") as Arc<dyn AuthAdapter>
        )
        .events_repository(Arc::clone(&events) as Arc<dyn EventsRepository>)
        .event_server_adapter(Arc::clone(&server) as Arc<dyn EventServerAdapter>)
        .build();
        let store = broker
            .register(profile_config())
            .expect("register should succeed");

        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let _sub = store.subscribe(move |state| {
            sink.lock()
                .expect("observed lock")
                .push(state.get("G").map(|s| s.state.name.clone()));
        });

        settle().await;

        assert_eq!(
            w_first_fetch(&server),
            None,
            "initial fetch should start from the null cursor"
        );
        let snapshot = store.get("G").expect("remote aggregate should exist");
        assert_eq!(snapshot.state.name, "s2");
        assert_eq!(snapshot.version, 2);
        assert_eq!(events.events().len(), 2);
        assert_eq!(
            observed.lock().expect("observed lock").last().cloned(),
            Some(Some("s2".to_string()))
        );
    }

    fn w_first_fetch(server: &ScriptedServer) -> Option<String> {
        server
            .fetch_calls
            .lock()
            .expect("fetch lock")
            .first()
            .cloned()
            .flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn offline_burst_records_after_reconnect() {
        let w = world(StaticAuth::logged_in("device-1", "acct-A"), Some(false));
        w.server.set_fail_records(true);

        let id = w
            .store
            .create("profile.create", json!({"name": "x"}))
            .await
            .expect("create should succeed");
        w.store
            .update("profile.update", &id, json!({"name": "y"}))
            .await
            .expect("update should succeed");
        settle().await;

        assert!(w.server.recorded_ids().is_empty(), "offline: nothing recorded");
        assert_eq!(w.events.events().iter().filter(|e| e.recorded_at.is_none()).count(), 2);

        // Connectivity returns; the next retry window flushes both events.
        w.server.set_fail_records(false);
        w.connection.set(Some(true));
        tokio::time::sleep(w.broker.inner.retry_sync_interval + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(w.server.recorded_ids().len(), 2);
        assert!(w.events.events().iter().all(|e| e.recorded_at.is_some()));
        let snapshot = w.store.get(&id).expect("snapshot should exist");
        assert!(snapshot.last_recorded_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_authorship_backfills_on_sync() {
        let w = world(StaticAuth::new("device-1"), Some(true));
        w.server.set_resolved_account(Some("A2"));

        let id = w
            .store
            .create("profile.create", json!({"name": "x"}))
            .await
            .expect("create should succeed");
        settle().await;

        // Logged out: stored locally without authorship, never recorded.
        assert_eq!(w.server.record_calls.load(Ordering::SeqCst), 0);
        assert_eq!(w.events.events()[0].created_by, None);

        w.auth.set_account(Some("A2"));
        w.broker.sync().await;
        settle().await;

        assert_eq!(w.server.recorded_ids().len(), 1);
        let log = w.events.events();
        assert_eq!(log[0].created_by.as_deref(), Some("A2"));
        assert!(log[0].recorded_at.is_some());
        let snapshot = w.store.get(&id).expect("snapshot should exist");
        assert_eq!(snapshot.created_by.as_deref(), Some("A2"));
        assert!(snapshot.last_recorded_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_is_single_flight_and_idempotent() {
        let w = world(StaticAuth::logged_in("device-1", "acct-1"), Some(true));
        // Let the startup sync finish to get a clean baseline.
        settle().await;
        let baseline = w.server.fetch_calls.lock().expect("fetch lock").len();

        w.server.set_fetch_delay(Duration::from_millis(100));
        tokio::join!(w.broker.sync(), w.broker.sync());
        assert_eq!(
            w.server.fetch_calls.lock().expect("fetch lock").len(),
            baseline + 1,
            "concurrent callers share one pass"
        );

        // Quiescent: further syncs produce no server writes.
        let recorded_before = w.server.recorded_ids().len();
        w.broker.sync().await;
        w.broker.sync().await;
        assert_eq!(w.server.recorded_ids().len(), recorded_before);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_events_route_into_stores() {
        let w = world(StaticAuth::logged_in("device-1", "acct-1"), Some(true));
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let _sub = w.store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        w.server.push(remote_create("X", "pushed"));
        settle().await;

        let snapshot = w.store.get("X").expect("pushed aggregate should exist");
        assert_eq!(snapshot.state.name, "pushed");
        assert_eq!(w.events.events().len(), 1);
        // One delivery at subscribe time plus one for the pushed event.
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_wipes_data_and_revives_the_pipeline() {
        let w = world(StaticAuth::logged_in("device-1", "acct-1"), Some(true));
        w.store
            .create("profile.create", json!({"name": "a"}))
            .await
            .expect("create should succeed");
        settle().await;

        w.broker.reset().await.expect("reset should succeed");

        assert!(w.events.events().is_empty());
        assert!(w.store.state().is_empty());
        assert!(
            w.snapshots
                .get_all()
                .await
                .expect("get_all should succeed")
                .is_empty()
        );
        // The bus replay buffer is gone: a new subscriber sees nothing.
        let replayed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&replayed);
        let _sub = w.broker.bus().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(replayed.load(Ordering::SeqCst), 0);

        // The pipeline still works after the reset.
        let id = w
            .store
            .create("profile.create", json!({"name": "again"}))
            .await
            .expect("create after reset should succeed");
        settle().await;
        assert!(w.store.get(&id).is_some());
        assert!(
            w.events.events()[0].recorded_at.is_some(),
            "recorder should be re-wired after reset"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop_and_keeps_data() {
        let w = world(StaticAuth::logged_in("device-1", "acct-1"), Some(false));
        let id = w
            .store
            .create("profile.create", json!({"name": "a"}))
            .await
            .expect("create should succeed");
        settle().await;

        w.broker.shutdown().await;
        let fetches = w.server.fetch_calls.lock().expect("fetch lock").len();

        w.connection.set(Some(true));
        tokio::time::sleep(w.broker.inner.retry_sync_interval * 2).await;

        assert_eq!(
            w.server.fetch_calls.lock().expect("fetch lock").len(),
            fetches,
            "no syncs after shutdown"
        );
        assert!(w.store.get(&id).is_some(), "data stays intact");
        assert!(!w.events.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fluent_builder_registers_a_working_store() {
        use crate::aggregate::EventConfig;
        use serde_json::Value;

        let broker =
            Broker::builder(StaticAuth::logged_in("device-1", "acct-1") as Arc<dyn AuthAdapter>)
                .build();
        let store = broker
            .aggregate::<Profile>("profile")
            .aggregate_id_generator(|| "fixed-1".to_string())
            .event(EventConfig::create(
                "profile.create",
                |payload: Option<&Value>| Profile {
                    name: payload
                        .and_then(|p| p.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    bio: None,
                },
            ))
            .register()
            .expect("register should succeed");

        let id = store
            .create("profile.create", json!({"name": "b"}))
            .await
            .expect("create should succeed");
        assert_eq!(id, "fixed-1");
        assert_eq!(store.get(&id).expect("snapshot").state.name, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_aggregate_type_rejected() {
        let w = world(StaticAuth::logged_in("device-1", "acct-1"), Some(true));
        let result = w.broker.register(profile_config());
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateAggregateType(t)) if t == "profile"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn termination_hook_receives_storage_failures() {
        let auth = StaticAuth::logged_in("device-1", "acct-1");
        let flaky = FlakyEventsRepository::new();
        let terminated = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&terminated);

        let broker = Broker::builder(auth as Arc<dyn AuthAdapter>)
            .events_repository(Arc::clone(&flaky) as Arc<dyn EventsRepository>)
            .on_termination(move |error| {
                *sink.lock().expect("terminated lock") = error.map(|e| e.to_string());
            })
            .build();
        let store = broker
            .register(profile_config())
            .expect("register should succeed");

        flaky.fail_next_create();
        store
            .create("profile.create", json!({"name": "doomed"}))
            .await
            .expect("dispatcher resolves; failure funnels through the hook");

        assert!(broker.bus().is_terminated());
        assert!(
            terminated
                .lock()
                .expect("terminated lock")
                .as_deref()
                .is_some_and(|e| e.contains("injected write failure"))
        );

        let after = store.create("profile.create", json!({"name": "late"})).await;
        assert!(matches!(after, Err(DispatchError::Terminated)));
    }
}
