//! State machine with domain indexing for Open Peer Power
//!
//! This crate provides the StateMachine, the authoritative mapping from
//! entity id to its current [`State`]. Every write that changes something
//! (or is forced) fires exactly one STATE_CHANGED event carrying both the
//! old and new state.

use dashmap::DashMap;
use opp_clock::Clock;
use opp_core::events::{StateChangedData, STATE_CHANGED};
use opp_core::{
    Attributes, Context, EntityId, EntityIdError, Event, InvalidStateError, Job, State,
};
use opp_event_bus::EventBus;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid entity id `{entity_id}`: {source}")]
    InvalidEntityId {
        entity_id: String,
        #[source]
        source: EntityIdError,
    },

    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    #[error("timed out waiting for {entity_id} to become `{state}`")]
    Timeout { entity_id: String, state: String },
}

/// The state machine tracks all entity states
///
/// Writes are serialized so that, for any entity, STATE_CHANGED events are
/// queued in the same order as the `set` calls that caused them. Reads never
/// take the write lock and always see a consistent snapshot per entity.
pub struct StateMachine {
    /// All entity states keyed by entity_id string
    states: DashMap<String, State>,
    /// Index of entity_ids by domain
    domain_index: DashMap<String, Vec<String>>,
    write_lock: Mutex<()>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl StateMachine {
    /// Create a state machine that fires on `event_bus` and shares its clock
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        let clock = Arc::clone(event_bus.clock());
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            write_lock: Mutex::new(()),
            event_bus,
            clock,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn parse_entity_id(raw: &str) -> Result<EntityId, StateError> {
        EntityId::normalize(raw).map_err(|source| StateError::InvalidEntityId {
            entity_id: raw.to_string(),
            source,
        })
    }

    /// Set the state of an entity
    ///
    /// A write with the same state string and attributes as the current
    /// state is a no-op unless `force_update` is set. `last_changed` is
    /// kept whenever the state string is unchanged, forced or not.
    #[instrument(skip(self, state, attributes, context))]
    pub fn set(
        &self,
        entity_id: &str,
        state: impl Into<String>,
        attributes: Option<Attributes>,
        force_update: bool,
        context: Option<Context>,
    ) -> Result<State, StateError> {
        let entity_id = Self::parse_entity_id(entity_id)?;
        let key = entity_id.to_string();
        let state = state.into();
        let attributes = attributes.unwrap_or_default();
        let context = context.unwrap_or_default();

        let _write = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let old_state = self.states.get(&key).map(|s| s.clone());
        if let Some(old) = &old_state {
            if !force_update && old.state == state && old.attributes == attributes {
                trace!("State unchanged, not firing");
                return Ok(old.clone());
            }
        }

        let now = self.clock.utcnow();
        let new_state = match &old_state {
            Some(old) => old.successor(state, attributes, context.clone(), now)?,
            None => State::new(entity_id.clone(), state, attributes, context.clone(), now)?,
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map_or(true, |s| s.state != new_state.state),
            "Setting entity state"
        );

        self.states.insert(key.clone(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .push(key);
        }

        self.event_bus.fire_typed(
            &StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        Ok(new_state)
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states
            .get(&entity_id.to_ascii_lowercase())
            .map(|s| s.clone())
    }

    /// Get the state value as a string, or None if entity doesn't exist
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.get(entity_id).map(|s| s.state)
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    /// Sorted entity ids, optionally limited to one domain
    pub fn entity_ids(&self, domain: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = match domain {
            Some(domain) => self
                .domain_index
                .get(&domain.to_ascii_lowercase())
                .map(|v| v.clone())
                .unwrap_or_default(),
            None => self.states.iter().map(|r| r.key().clone()).collect(),
        };
        ids.sort();
        ids
    }

    /// Get all states for a domain
    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.entity_ids(Some(domain))
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Snapshot of all states
    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    /// Get all domains with at least one entity
    pub fn domains(&self) -> BTreeSet<String> {
        self.domain_index.iter().map(|r| r.key().clone()).collect()
    }

    /// Remove an entity's state
    ///
    /// Fires STATE_CHANGED with `new_state` None. Returns false, without
    /// firing, if the entity is unknown.
    #[instrument(skip(self, context))]
    pub fn remove(&self, entity_id: &str, context: Option<Context>) -> bool {
        let key = entity_id.to_ascii_lowercase();
        let _write = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let Some((_, old_state)) = self.states.remove(&key) else {
            return false;
        };
        trace!("Removing entity state");

        let domain = old_state.domain().to_string();
        let now_empty = match self.domain_index.get_mut(&domain) {
            Some(mut ids) => {
                ids.retain(|id| id != &key);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.domain_index.remove_if(&domain, |_, ids| ids.is_empty());
        }

        self.event_bus.fire_typed(
            &StateChangedData {
                entity_id: old_state.entity_id.clone(),
                old_state: Some(old_state),
                new_state: None,
            },
            context.unwrap_or_default(),
        );
        true
    }

    /// Wait until an entity's state string equals `state`
    ///
    /// Resolves immediately if it already does. On timeout the caller is
    /// released with [`StateError::Timeout`]; nothing else is cancelled.
    pub async fn async_wait(
        &self,
        entity_id: &str,
        state: &str,
        timeout: Option<Duration>,
    ) -> Result<State, StateError> {
        let key = Self::parse_entity_id(entity_id)?.to_string();
        let timed_out = || StateError::Timeout {
            entity_id: key.clone(),
            state: state.to_string(),
        };

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let want_entity = key.clone();
        let want_state = state.to_string();
        let unsub = self.event_bus.listen_filtered(
            STATE_CHANGED,
            Job::callback(move |event: Event| {
                let Some(new_state) = event
                    .parse_data::<StateChangedData>()
                    .and_then(|data| data.new_state)
                else {
                    return;
                };
                if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(new_state);
                }
            }),
            move |event| {
                event.data["entity_id"].as_str() == Some(want_entity.as_str())
                    && event.data["new_state"]["state"].as_str() == Some(want_state.as_str())
            },
        );

        if let Some(current) = self.get(&key) {
            if current.state == state {
                unsub.cancel();
                return Ok(current);
            }
        }

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received.map_err(|_| timed_out()),
                Err(_) => Err(timed_out()),
            },
            None => rx.await.map_err(|_| timed_out()),
        };
        unsub.cancel();
        result
    }

    /// Get the total number of entities
    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

/// Thread-safe wrapper for StateMachine
pub type SharedStateMachine = Arc<StateMachine>;
