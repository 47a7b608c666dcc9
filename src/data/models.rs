//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Local actor (single actor per deployment)
// =============================================================================

/// The single local actor identity for this instance.
///
/// Holds the RSA keypair used to sign outbound requests; only one
/// row exists in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalActor {
    pub id: String,
    pub account: String,
    /// RSA private key (PEM format)
    pub private_key_pem: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Follower
// =============================================================================

/// A remote actor that completed the Follow/Accept handshake.
///
/// `name` and `avatar_url` are display metadata refreshed when the remote
/// actor sends an Update; `iri` and `inbox` identify the follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follower {
    /// Canonical actor IRI, unique per follower
    pub iri: Url,
    /// Inbox URL activities are delivered to
    pub inbox: Url,
    /// Last known display name
    pub name: Option<String>,
    /// Last known avatar image URL
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Outbox
// =============================================================================

/// Type tag of a stored outbox item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApObjectType {
    Create,
    Update,
    Note,
}

impl ApObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Note => "Note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Note" => Some(Self::Note),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally authored activity or object, recorded append-only.
///
/// Owned exclusively by the outbox store; never updated after insert.
#[derive(Debug, Clone)]
pub struct OutboxItem {
    /// Local short identifier (ULID)
    pub id: String,
    /// Canonical local IRI of the activity/object
    pub iri: String,
    pub object_type: ApObjectType,
    /// Serialized activity/object bytes (JSON)
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Remote actor (transient)
// =============================================================================

/// A dereferenced remote actor document.
///
/// Produced by the resolver per request; not persisted beyond the
/// follower table's display metadata.
#[derive(Debug, Clone)]
pub struct RemoteActor {
    pub iri: Url,
    pub inbox: Url,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// RSA public key (PEM format) advertised by the actor document
    pub public_key_pem: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_is_26_char_ulid() {
        let id = EntityId::new();
        assert_eq!(id.0.len(), 26);
    }

    #[test]
    fn object_type_round_trips_through_str() {
        for object_type in [ApObjectType::Create, ApObjectType::Update, ApObjectType::Note] {
            assert_eq!(ApObjectType::parse(object_type.as_str()), Some(object_type));
        }
        assert_eq!(ApObjectType::parse("Tombstone"), None);
    }
}
