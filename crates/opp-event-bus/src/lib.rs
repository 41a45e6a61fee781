//! Event bus for Open Peer Power
//!
//! This crate provides the EventBus, the central message broker of the
//! kernel. Listeners are [`Job`]s registered per event type (or for every
//! event via MATCH_ALL). Firing never runs listeners directly: each matching
//! listener is queued on the [`EventLoop`] in registration order, so `fire`
//! returns before any listener runs and events fired from inside a listener
//! are delivered after the current one.

use dashmap::DashMap;
use opp_clock::Clock;
use opp_core::events::OPENPEERPOWER_CLOSE;
use opp_core::{Context, Event, EventData, EventOrigin, EventType, Job, Unsub};
use opp_loop::EventLoop;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A unique identifier for an event listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Predicate evaluated at fire time, before the listener is queued
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    event_type: EventType,
    job: Job<Event>,
    filter: Option<EventFilter>,
    /// Set for one-shot listeners; flips to true on first match
    once: Option<Arc<AtomicBool>>,
}

type ListenerTable = Arc<DashMap<EventType, Vec<Listener>>>;

/// The event bus for publishing and subscribing to events
pub struct EventBus {
    listeners: ListenerTable,
    next_listener_id: AtomicU64,
    event_loop: EventLoop,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(event_loop: EventLoop, clock: Arc<dyn Clock>) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_listener_id: AtomicU64::new(1),
            event_loop,
            clock,
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribe to events of a specific type, or MATCH_ALL for every event
    pub fn listen(&self, event_type: impl Into<EventType>, job: Job<Event>) -> Unsub {
        self.add_listener(event_type.into(), job, None, None)
    }

    /// Subscribe, but only queue the job for events accepted by `filter`
    pub fn listen_filtered<F>(
        &self,
        event_type: impl Into<EventType>,
        job: Job<Event>,
        filter: F,
    ) -> Unsub
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.add_listener(event_type.into(), job, Some(Arc::new(filter)), None)
    }

    /// Subscribe for a single event
    ///
    /// The listener is removed when the first matching event is fired,
    /// before its job is queued, so it runs at most once even if several
    /// events are fired before the loop gets to it.
    pub fn listen_once(&self, event_type: impl Into<EventType>, job: Job<Event>) -> Unsub {
        self.add_listener(
            event_type.into(),
            job,
            None,
            Some(Arc::new(AtomicBool::new(false))),
        )
    }

    fn add_listener(
        &self,
        event_type: EventType,
        job: Job<Event>,
        filter: Option<EventFilter>,
        once: Option<Arc<AtomicBool>>,
    ) -> Unsub {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        trace!(event_type = %event_type, ?id, "Adding listener");

        self.listeners
            .entry(event_type.clone())
            .or_default()
            .push(Listener {
                id,
                event_type: event_type.clone(),
                job,
                filter,
                once: once.clone(),
            });

        let table = Arc::clone(&self.listeners);
        Unsub::new(move || {
            if let Some(flag) = &once {
                flag.store(true, Ordering::Release);
            }
            remove_listener(&table, &event_type, id);
        })
    }

    /// Fire a local event under a fresh root context
    pub fn fire(&self, event_type: impl Into<EventType>, data: serde_json::Value) {
        self.fire_with(event_type, data, EventOrigin::Local, Context::new());
    }

    /// Fire an event with an explicit origin and context
    pub fn fire_with(
        &self,
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        origin: EventOrigin,
        context: Context,
    ) {
        let event =
            Event::new(event_type, data, context, self.clock.utcnow()).with_origin(origin);
        self.fire_event(event);
    }

    /// Fire a typed payload under its own event type
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: &T, context: Context) {
        match serde_json::to_value(data) {
            Ok(value) => self.fire_with(T::event_type(), value, EventOrigin::Local, context),
            Err(e) => warn!(event_type = T::event_type(), "Could not serialize event data: {}", e),
        }
    }

    /// Deliver an already built event to every matching listener
    ///
    /// MATCH_ALL listeners are queued first, then listeners of the event's
    /// own type, each group in registration order. MATCH_ALL listeners do
    /// not see `openpeerpower_close`.
    pub fn fire_event(&self, event: Event) {
        let mut matched: Vec<Listener> = Vec::new();

        if event.event_type.as_str() != OPENPEERPOWER_CLOSE {
            if let Some(all) = self.listeners.get(&EventType::match_all()) {
                matched.extend(all.iter().cloned());
            }
        }
        if !event.event_type.is_match_all() {
            if let Some(typed) = self.listeners.get(&event.event_type) {
                matched.extend(typed.iter().cloned());
            }
        }

        debug!(event_type = %event.event_type, listeners = matched.len(), "Firing event");

        for listener in matched {
            if let Some(filter) = &listener.filter {
                if !filter(&event) {
                    continue;
                }
            }
            if let Some(once) = &listener.once {
                if once.swap(true, Ordering::AcqRel) {
                    continue;
                }
                remove_listener(&self.listeners, &listener.event_type, listener.id);
            }
            self.event_loop.add_job(&listener.job, event.clone());
        }
    }

    /// Number of listeners per event type
    pub fn listeners(&self) -> HashMap<String, usize> {
        self.listeners
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().len()))
            .collect()
    }

    /// Total number of listeners across all event types
    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }
}

fn remove_listener(table: &ListenerTable, event_type: &EventType, id: ListenerId) {
    let now_empty = match table.get_mut(event_type) {
        Some(mut list) => {
            list.retain(|l| l.id != id);
            list.is_empty()
        }
        None => false,
    };
    if now_empty {
        table.remove_if(event_type, |_, list| list.is_empty());
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
