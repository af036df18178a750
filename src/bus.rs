//! The event bus: a replaying, terminable, resettable pub/sub conduit.
//!
//! Every dispatched event reaches every current subscriber and, through the
//! replay buffer, every future subscriber, in one total dispatch order. A
//! failed write anywhere in the apply pipeline terminates the bus, which
//! seals it against further dispatch until [`EventBus::reset`].
//!
//! Implemented as a replay vector plus a subscriber list behind a mutex,
//! with a one-shot `(terminated, error)` flag. No stream library involved.

use std::sync::{Arc, Mutex, Weak};

use crate::error::{BoxError, BusError};
use crate::event::Event;

/// The error a terminated bus carries, shared with every termination
/// handler.
pub type TerminalError = Arc<dyn std::error::Error + Send + Sync + 'static>;

type SubscriberFn = Arc<dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync>;
type TerminationFn = Box<dyn FnOnce(Option<TerminalError>) + Send>;

/// Detaches a callback registered with [`EventBus::subscribe`] or
/// [`AggregateStore::subscribe`](crate::AggregateStore::subscribe).
///
/// Dropping the handle does *not* detach; call
/// [`unsubscribe`](Subscription::unsubscribe) explicitly. This lets
/// fire-and-forget subscribers ignore the handle safely.
#[must_use = "call unsubscribe() to detach, or bind the handle"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Stop delivering to the registered callback.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

struct BusState {
    /// Every event dispatched since the last reset, in dispatch order.
    replay: Vec<Event>,
    subscribers: Vec<(u64, SubscriberFn)>,
    termination_handlers: Vec<TerminationFn>,
    terminated: bool,
    terminal_error: Option<TerminalError>,
    next_id: u64,
}

/// The pub/sub conduit shared by the broker, its stores, and any external
/// subscribers.
///
/// Only stores and the broker dispatch and terminate; external code
/// subscribes and observes. All callbacks are invoked outside the internal
/// lock, so a subscriber may inspect the bus but must not assume it still
/// holds the state it was called with.
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    /// Create a fresh, non-terminated bus with an empty replay buffer.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                replay: Vec::new(),
                subscribers: Vec::new(),
                termination_handlers: Vec::new(),
                terminated: false,
                terminal_error: None,
                next_id: 0,
            })),
        }
    }

    /// Deliver `event` to every current subscriber and append it to the
    /// replay buffer.
    ///
    /// # Errors
    ///
    /// - [`BusError::Terminated`] if the bus is sealed; the event is not
    ///   buffered.
    /// - [`BusError::Subscriber`] if a subscriber fails. Delivery stops at
    ///   the first failure; the event stays in the replay buffer. Callers in
    ///   the apply pipeline treat this like any other persistence failure
    ///   and terminate the bus.
    pub fn dispatch(&self, event: &Event) -> Result<(), BusError> {
        let subscribers = {
            let mut state = self.state.lock().expect("bus state lock poisoned");
            if state.terminated {
                return Err(BusError::Terminated);
            }
            state.replay.push(event.clone());
            state
                .subscribers
                .iter()
                .map(|(_, f)| Arc::clone(f))
                .collect::<Vec<_>>()
        };

        for subscriber in subscribers {
            subscriber(event).map_err(BusError::Subscriber)?;
        }
        Ok(())
    }

    /// Attach a subscriber.
    ///
    /// The callback is first invoked once per previously dispatched event in
    /// original order (the replay), then for every subsequent dispatch until
    /// the returned [`Subscription`] is unsubscribed or the bus terminates.
    /// Termination is not delivered here; register with
    /// [`on_termination`](EventBus::on_termination) for that.
    ///
    /// A replay failure is logged and stops the replay, but leaves the
    /// subscriber attached; only failures during live dispatch feed the
    /// termination path.
    pub fn subscribe(
        &self,
        subscriber: impl Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Subscription {
        let subscriber: SubscriberFn = Arc::new(subscriber);
        let (id, replay) = {
            let mut state = self.state.lock().expect("bus state lock poisoned");
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push((id, Arc::clone(&subscriber)));
            (id, state.replay.clone())
        };

        for event in &replay {
            if let Err(e) = subscriber(event) {
                tracing::warn!(event_id = %event.id, error = %e, "subscriber failed during replay");
                break;
            }
        }

        let weak: Weak<Mutex<BusState>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().expect("bus state lock poisoned");
                state.subscribers.retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }

    /// Register a handler invoked exactly once when the bus terminates,
    /// receiving the terminal error if one was provided.
    ///
    /// Registering on an already-terminated bus invokes the handler
    /// immediately with the stored error.
    pub fn on_termination(&self, handler: impl FnOnce(Option<TerminalError>) + Send + 'static) {
        let handler: TerminationFn = Box::new(handler);
        let mut state = self.state.lock().expect("bus state lock poisoned");
        if state.terminated {
            let error = state.terminal_error.clone();
            drop(state);
            handler(error);
        } else {
            state.termination_handlers.push(handler);
        }
    }

    /// Transition into the terminal state.
    ///
    /// Idempotent: only the first call has any effect. Stops all delivery,
    /// preserves the replay buffer for inspection until [`reset`], and
    /// fires every registered termination handler with `error`.
    pub fn terminate(&self, error: Option<TerminalError>) {
        let handlers = {
            let mut state = self.state.lock().expect("bus state lock poisoned");
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.terminal_error = error.clone();
            std::mem::take(&mut state.termination_handlers)
        };

        if let Some(err) = &error {
            tracing::error!(error = %err, "event bus terminated");
        } else {
            tracing::info!("event bus terminated");
        }

        for handler in handlers {
            handler(error.clone());
        }
    }

    /// Clear the replay buffer and revive the bus after termination.
    ///
    /// Existing subscribers stay attached and eligible for future events;
    /// the terminal error is discarded.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("bus state lock poisoned");
        state.replay.clear();
        state.terminated = false;
        state.terminal_error = None;
        tracing::debug!("event bus reset");
    }

    /// Whether the bus is in its terminal state.
    pub fn is_terminated(&self) -> bool {
        self.state
            .lock()
            .expect("bus state lock poisoned")
            .terminated
    }

    /// The error the bus terminated with, if any.
    pub fn terminal_error(&self) -> Option<TerminalError> {
        self.state
            .lock()
            .expect("bus state lock poisoned")
            .terminal_error
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("bus state lock poisoned");
        f.debug_struct("EventBus")
            .field("replayed", &state.replay.len())
            .field("subscribers", &state.subscribers.len())
            .field("terminated", &state.terminated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, random_id};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(n: u32) -> Event {
        Event {
            id: format!("e-{n}"),
            operation: Operation::Create,
            aggregate_type: "profile".to_string(),
            aggregate_id: random_id(),
            event_type: "profile.create".to_string(),
            payload: None,
            dispatched_at: Utc::now(),
            created_by: None,
            created_on: "device-1".to_string(),
            prev_id: None,
            recorded_at: None,
        }
    }

    fn collect_ids(seen: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        seen.lock().expect("seen lock").clone()
    }

    #[test]
    fn subscribers_observe_dispatch_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| {
            sink.lock().expect("seen lock").push(e.id.clone());
            Ok(())
        });

        bus.dispatch(&event(1)).expect("dispatch should succeed");
        bus.dispatch(&event(2)).expect("dispatch should succeed");
        bus.dispatch(&event(3)).expect("dispatch should succeed");

        assert_eq!(collect_ids(&seen), vec!["e-1", "e-2", "e-3"]);
    }

    #[test]
    fn late_subscriber_gets_full_replay_then_live_events() {
        let bus = EventBus::new();
        bus.dispatch(&event(1)).expect("dispatch should succeed");
        bus.dispatch(&event(2)).expect("dispatch should succeed");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| {
            sink.lock().expect("seen lock").push(e.id.clone());
            Ok(())
        });
        assert_eq!(collect_ids(&seen), vec!["e-1", "e-2"]);

        bus.dispatch(&event(3)).expect("dispatch should succeed");
        assert_eq!(collect_ids(&seen), vec!["e-1", "e-2", "e-3"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&event(1)).expect("dispatch should succeed");
        sub.unsubscribe();
        bus.dispatch(&event(2)).expect("dispatch should succeed");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_after_terminate_fails() {
        let bus = EventBus::new();
        bus.terminate(None);
        let result = bus.dispatch(&event(1));
        assert!(matches!(result, Err(BusError::Terminated)));
        assert!(bus.is_terminated());
    }

    #[test]
    fn terminate_fires_handlers_once_with_error() {
        let bus = EventBus::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let seen_error = Arc::new(Mutex::new(None));
        let error_sink = Arc::clone(&seen_error);
        bus.on_termination(move |err| {
            counter.fetch_add(1, Ordering::SeqCst);
            *error_sink.lock().expect("error lock") = err.map(|e| e.to_string());
        });

        let cause: TerminalError =
            Arc::new(std::io::Error::other("disk full")) as TerminalError;
        bus.terminate(Some(cause));
        // Idempotent: the second call must not re-fire.
        bus.terminate(None);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            seen_error.lock().expect("error lock").as_deref(),
            Some("disk full")
        );
    }

    #[test]
    fn subscribers_are_not_invoked_on_termination() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.terminate(Some(Arc::new(std::io::Error::other("boom")) as TerminalError));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_clears_replay_and_revives() {
        let bus = EventBus::new();
        bus.dispatch(&event(1)).expect("dispatch should succeed");
        bus.terminate(None);
        bus.reset();

        assert!(!bus.is_terminated());
        assert!(bus.terminal_error().is_none());

        // A post-reset subscriber sees no replay of pre-reset events.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| {
            sink.lock().expect("seen lock").push(e.id.clone());
            Ok(())
        });
        assert!(collect_ids(&seen).is_empty());

        bus.dispatch(&event(2)).expect("dispatch should succeed");
        assert_eq!(collect_ids(&seen), vec!["e-2"]);
    }

    #[test]
    fn reset_keeps_existing_subscribers_attached() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&event(1)).expect("dispatch should succeed");
        bus.reset();
        bus.dispatch(&event(2)).expect("dispatch should succeed");

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscriber_failure_surfaces_from_dispatch() {
        let bus = EventBus::new();
        let _sub = bus.subscribe(|_| Err("subscriber exploded".into()));

        let result = bus.dispatch(&event(1));
        match result {
            Err(BusError::Subscriber(cause)) => {
                assert_eq!(cause.to_string(), "subscriber exploded");
            }
            other => panic!("expected subscriber failure, got {other:?}"),
        }
        // The bus itself is still live; termination is the caller's call.
        assert!(!bus.is_terminated());
    }

    #[test]
    fn on_termination_after_the_fact_fires_immediately() {
        let bus = EventBus::new();
        bus.terminate(Some(Arc::new(std::io::Error::other("late")) as TerminalError));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        bus.on_termination(move |err| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(err.is_some());
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
