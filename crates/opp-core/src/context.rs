//! Causal context carried by events, state writes and service calls

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Causal identity of an action
///
/// Every state mutation, event and service call carries a Context. Follow-up
/// work started because of an action gets a child context: a fresh `id`
/// with `parent_id` pointing at the originating context. Ids are never
/// reused between originations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier (ULID)
    pub id: String,

    /// User that initiated the action, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Id of the context that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a root context with a fresh id
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Create a root context attributed to a user
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::new()
        }
    }

    /// Derive a context for work caused by this one
    ///
    /// The child keeps the user and records this context as its parent.
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: self.user_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }

    /// Whether this context was derived from another one
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
