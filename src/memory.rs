//! In-memory implementations of the repository contracts.
//!
//! The default local store for applications that keep everything in memory,
//! and the test double used throughout this crate's test suite. Both types
//! guard plain collections with a mutex held only for the duration of each
//! synchronous operation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::event::Event;
use crate::repository::{AggregateRepository, EventsRepository};
use crate::snapshot::{AggregateState, Snapshot};

/// Append-ordered in-memory event log.
#[derive(Default)]
pub struct MemoryEventsRepository {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventsRepository {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// A point-in-time copy of the full log, in append order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock poisoned").clone()
    }
}

#[async_trait]
impl EventsRepository for MemoryEventsRepository {
    async fn create(&self, event: &Event) -> Result<(), RepositoryError> {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(event.clone());
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), RepositoryError> {
        self.events.lock().expect("events lock poisoned").clear();
        Ok(())
    }

    async fn mark_recorded(
        &self,
        event_id: &str,
        recorded_at: DateTime<Utc>,
        created_by: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut events = self.events.lock().expect("events lock poisoned");
        let event = events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| RepositoryError::NotFound(event_id.to_string()))?;
        event.recorded_at = Some(recorded_at);
        // Authorship is stamped once: never rewrite an existing author.
        if event.created_by.is_none() {
            event.created_by = created_by.map(str::to_string);
        }
        Ok(())
    }

    async fn get_unrecorded(&self) -> Result<Vec<Event>, RepositoryError> {
        Ok(self
            .events
            .lock()
            .expect("events lock poisoned")
            .iter()
            .filter(|e| e.recorded_at.is_none())
            .cloned()
            .collect())
    }

    async fn get_last_received(
        &self,
        device_id: &str,
    ) -> Result<Option<Event>, RepositoryError> {
        let events = self.events.lock().expect("events lock poisoned");
        let mut latest: Option<&Event> = None;
        for event in events.iter() {
            let Some(recorded_at) = event.recorded_at else {
                continue;
            };
            if event.created_on == device_id {
                continue;
            }
            // `>=` prefers the later append on recorded-at ties.
            if latest
                .and_then(|l| l.recorded_at)
                .is_none_or(|at| recorded_at >= at)
            {
                latest = Some(event);
            }
        }
        Ok(latest.cloned())
    }
}

/// In-memory snapshot collection for one aggregate type.
pub struct MemoryAggregateRepository<S> {
    snapshots: Mutex<HashMap<String, Snapshot<S>>>,
}

impl<S> MemoryAggregateRepository<S> {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> Default for MemoryAggregateRepository<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: AggregateState> AggregateRepository<S> for MemoryAggregateRepository<S> {
    async fn get_one(&self, id: &str) -> Result<Option<Snapshot<S>>, RepositoryError> {
        Ok(self
            .snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .get(id)
            .cloned())
    }

    async fn get_all(&self) -> Result<HashMap<String, Snapshot<S>>, RepositoryError> {
        Ok(self.snapshots.lock().expect("snapshots lock poisoned").clone())
    }

    async fn create(&self, snapshot: &Snapshot<S>) -> Result<(), RepositoryError> {
        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn update(&self, id: &str, snapshot: &Snapshot<S>) -> Result<(), RepositoryError> {
        let mut snapshots = self.snapshots.lock().expect("snapshots lock poisoned");
        if !snapshots.contains_key(id) {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        snapshots.insert(id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .remove(id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), RepositoryError> {
        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .clear();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Event log that fails its next `create` call once, then recovers.
    /// Exercises the rollback + bus-termination path.
    #[derive(Default)]
    pub(crate) struct FlakyEventsRepository {
        pub(crate) inner: MemoryEventsRepository,
        fail_next_create: AtomicBool,
    }

    impl FlakyEventsRepository {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn fail_next_create(&self) {
            self.fail_next_create.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EventsRepository for FlakyEventsRepository {
        async fn create(&self, event: &Event) -> Result<(), RepositoryError> {
            if self.fail_next_create.swap(false, Ordering::SeqCst) {
                return Err(RepositoryError::Storage("injected write failure".into()));
            }
            self.inner.create(event).await
        }

        async fn delete_all(&self) -> Result<(), RepositoryError> {
            self.inner.delete_all().await
        }

        async fn mark_recorded(
            &self,
            event_id: &str,
            recorded_at: DateTime<Utc>,
            created_by: Option<&str>,
        ) -> Result<(), RepositoryError> {
            self.inner
                .mark_recorded(event_id, recorded_at, created_by)
                .await
        }

        async fn get_unrecorded(&self) -> Result<Vec<Event>, RepositoryError> {
            self.inner.get_unrecorded().await
        }

        async fn get_last_received(
            &self,
            device_id: &str,
        ) -> Result<Option<Event>, RepositoryError> {
            self.inner.get_last_received(device_id).await
        }
    }
}
