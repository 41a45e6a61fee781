//! Entity identifiers: `domain.object_id`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a string is not a valid entity id
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity id must be `domain.object_id` with exactly one '.'")]
    InvalidFormat,

    #[error("entity id has an empty domain")]
    EmptyDomain,

    #[error("entity id has an empty object id")]
    EmptyObjectId,

    #[error("domain `{0}` is not a lowercase slug")]
    InvalidDomain(String),

    #[error("object id `{0}` is not a lowercase slug")]
    InvalidObjectId(String),
}

/// Identifier of an entity, rendered as `domain.object_id`
///
/// The domain names the integration kind (`light`, `sensor`) and the
/// object id is unique within its domain. Both halves are lowercase slugs:
/// ASCII lowercase letters, digits and underscores, not starting or ending
/// with an underscore. Domains additionally may not contain `__`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    object_id: String,
}

impl EntityId {
    /// Build an entity id from its two halves
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let domain = domain.into();
        let object_id = object_id.into();

        if domain.is_empty() {
            return Err(EntityIdError::EmptyDomain);
        }
        if object_id.is_empty() {
            return Err(EntityIdError::EmptyObjectId);
        }
        if domain.contains("__") || !is_slug(&domain) {
            return Err(EntityIdError::InvalidDomain(domain));
        }
        if !is_slug(&object_id) {
            return Err(EntityIdError::InvalidObjectId(object_id));
        }

        Ok(Self { domain, object_id })
    }

    /// Parse an entity id after lowercasing it
    ///
    /// Writers are allowed to pass `Light.Kitchen`; the stored id is always
    /// lowercase.
    pub fn normalize(raw: &str) -> Result<Self, EntityIdError> {
        raw.to_ascii_lowercase().parse()
    }

    /// Domain half, e.g. `light`
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Object id half, e.g. `kitchen`
    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

/// Whether `raw` is a well-formed entity id
pub fn is_valid_entity_id(raw: &str) -> bool {
    raw.parse::<EntityId>().is_ok()
}

fn is_slug(s: &str) -> bool {
    !s.starts_with('_')
        && !s.ends_with('_')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((domain, object_id)) if !object_id.contains('.') => Self::new(domain, object_id),
            _ => Err(EntityIdError::InvalidFormat),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}
