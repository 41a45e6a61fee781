//! Immutable entity state records

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Context, EntityId, MAX_STATE_LENGTH, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// Attribute mapping attached to a state
pub type Attributes = HashMap<String, serde_json::Value>;

/// A state value or attribute set that cannot be stored
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidStateError {
    #[error("state value for {entity_id} is {length} characters, the limit is {MAX_STATE_LENGTH}")]
    TooLong { entity_id: String, length: usize },

    #[error("attributes must serialize to a JSON object: {0}")]
    Attributes(String),
}

/// The state of one entity at one point in time
///
/// States are never mutated in place: every write produces a new State.
/// `last_changed` only moves when the state string changes, while
/// `last_updated` moves on every write, so `last_changed <= last_updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    /// Short string value, e.g. `on`, `home`, `21.5`
    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    pub last_changed: DateTime<Utc>,

    pub last_updated: DateTime<Utc>,

    /// Context of the write that produced this state
    pub context: Context,
}

impl State {
    /// Create the first state of an entity
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidStateError> {
        let state = state.into();
        Self::validate(&entity_id, &state)?;

        Ok(Self {
            entity_id,
            state,
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        })
    }

    /// Create the state that replaces this one
    ///
    /// `last_changed` carries over when the state string is unchanged.
    /// Timestamps never move backwards, even when `now` does.
    pub fn successor(
        &self,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidStateError> {
        let state = state.into();
        Self::validate(&self.entity_id, &state)?;
        let now = now.max(self.last_updated);

        let last_changed = if state == self.state {
            self.last_changed
        } else {
            now
        };

        Ok(Self {
            entity_id: self.entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated: now,
            context,
        })
    }

    fn validate(entity_id: &EntityId, state: &str) -> Result<(), InvalidStateError> {
        let length = state.chars().count();
        if length > MAX_STATE_LENGTH {
            return Err(InvalidStateError::TooLong {
                entity_id: entity_id.to_string(),
                length,
            });
        }
        Ok(())
    }

    /// Domain of the owning entity
    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Typed attribute lookup
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Equality ignores timestamps and context
impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

/// Convert any serializable value into an attribute mapping
///
/// Fails when the value does not serialize, or serializes to something other
/// than a JSON object.
pub fn attributes_from<T: Serialize>(value: &T) -> Result<Attributes, InvalidStateError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(InvalidStateError::Attributes(format!(
            "expected an object, got {other}"
        ))),
        Err(e) => Err(InvalidStateError::Attributes(e.to_string())),
    }
}
