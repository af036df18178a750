//! Persistence contracts consumed by the core.
//!
//! The runtime owns no storage engine. The embedding application injects an
//! event-log repository (shared by the broker and all stores) and, per
//! aggregate type, a snapshot repository. Both are written only from inside
//! a store's apply/mark/reset paths; everything else reads through the
//! store's in-memory collection.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::event::Event;
use crate::snapshot::{AggregateState, Snapshot};

/// The append-only local event log.
#[async_trait]
pub trait EventsRepository: Send + Sync {
    /// Append one event.
    async fn create(&self, event: &Event) -> Result<(), RepositoryError>;

    /// Remove every event. Used by broker reset.
    async fn delete_all(&self) -> Result<(), RepositoryError>;

    /// Stamp `recorded_at` onto the event with the given id, backfilling
    /// `created_by` only when it was previously absent.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] if no event has that id.
    async fn mark_recorded(
        &self,
        event_id: &str,
        recorded_at: DateTime<Utc>,
        created_by: Option<&str>,
    ) -> Result<(), RepositoryError>;

    /// Every event not yet recorded on the server, in append order.
    async fn get_unrecorded(&self) -> Result<Vec<Event>, RepositoryError>;

    /// The most recently recorded event that originated on a *different*
    /// device, or `None`. Sync uses its id as the fetch cursor.
    async fn get_last_received(
        &self,
        device_id: &str,
    ) -> Result<Option<Event>, RepositoryError>;
}

/// Snapshot persistence for one aggregate type.
///
/// Keyed by aggregate id; written only through the owning store.
#[async_trait]
pub trait AggregateRepository<S: AggregateState>: Send + Sync {
    /// Load one snapshot.
    async fn get_one(&self, id: &str) -> Result<Option<Snapshot<S>>, RepositoryError>;

    /// Load the full collection. Used by store initialization.
    async fn get_all(&self) -> Result<HashMap<String, Snapshot<S>>, RepositoryError>;

    /// Persist a newly created snapshot.
    async fn create(&self, snapshot: &Snapshot<S>) -> Result<(), RepositoryError>;

    /// Persist an updated snapshot.
    async fn update(&self, id: &str, snapshot: &Snapshot<S>) -> Result<(), RepositoryError>;

    /// Remove one snapshot.
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;

    /// Remove every snapshot. Used by store reset.
    async fn delete_all(&self) -> Result<(), RepositoryError>;
}
