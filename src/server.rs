//! Remote collaborator contracts: the event server and connection status.
//!
//! The core owns no transport. Whatever speaks to the central server --
//! HTTP, gRPC, a relay socket -- sits behind [`EventServerAdapter`], and the
//! core only ever sees events going out (`record`) and coming back
//! (`fetch`, the optional push feed). The adapter is also the layer
//! expected to deduplicate echoes of this device's own events by id.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::ServerError;
use crate::event::Event;

/// Client for the central event server.
#[async_trait]
pub trait EventServerAdapter: Send + Sync {
    /// Durably record one event on the server.
    ///
    /// Echoes the input with `recorded_at` set and `created_by` resolved
    /// from the server-side auth context when the event was dispatched
    /// logged-out.
    ///
    /// # Errors
    ///
    /// [`ServerError`] on transport failure or rejection; the caller leaves
    /// the event unrecorded and retries on the next sync cycle.
    async fn record(&self, event: &Event) -> Result<Event, ServerError>;

    /// Fetch every event recorded after the event with id
    /// `last_received_id`, oldest first. `None` fetches from the beginning.
    async fn fetch(&self, last_received_id: Option<&str>) -> Result<Vec<Event>, ServerError>;

    /// Optional push feed of newly recorded remote events.
    ///
    /// Adapters without push support keep the default `None`; the broker
    /// then relies on the sync loop alone.
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        None
    }
}

/// Observer of device connectivity.
///
/// `None` means unknown and is ignored by the sync loop; `Some(true)`
/// transitions trigger an immediate sync.
#[async_trait]
pub trait ConnectionStatusAdapter: Send + Sync {
    /// The current status, if known.
    async fn get(&self) -> Option<bool>;

    /// A watch feed of status changes.
    fn subscribe(&self) -> watch::Receiver<Option<bool>>;
}
