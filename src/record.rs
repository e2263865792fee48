// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data model.
//!
//! A [`Record`] is the unit of cached data: an opaque payload addressed by a
//! [`RecordKey`] that always carries its owner. Payload bytes are never
//! interpreted by this crate.
//!
//! # Example
//!
//! ```
//! use offline_sync::{OwnerId, Record, RecordKey};
//!
//! let key = RecordKey::new(OwnerId::new("user-1"), "conversation", "c-42");
//! let record = Record::local(key.clone(), b"hello".to_vec(), 3);
//!
//! assert_eq!(record.key.owner().as_str(), "user-1");
//! assert!(record.local_dirty);
//! assert_eq!(record.version, 3);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Current wall-clock time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Authenticated user whose data a record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digest used in the on-disk owner index.
    #[must_use]
    pub fn storage_id(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite record key: `(owner, entity_type, entity_id)`.
///
/// Keys for two different owners never compare equal and never share a
/// storage id, even when entity type and id match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    owner: OwnerId,
    entity_type: String,
    entity_id: String,
}

impl RecordKey {
    pub fn new(owner: OwnerId, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            owner,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Stable blob name: hex SHA-256 over the length-prefixed components.
    ///
    /// Length prefixes keep `("ab", "c")` and `("a", "bc")` apart.
    #[must_use]
    pub fn storage_id(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [self.owner.as_str(), &self.entity_type, &self.entity_id] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.entity_type, self.entity_id)
    }
}

/// The atomic unit of cached data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    /// Opaque serialized domain object
    pub payload: Vec<u8>,
    /// Version assigned by the server (0 = never acknowledged)
    pub version: u64,
    /// True while a local mutation awaits flush
    pub local_dirty: bool,
    /// Local wall-clock time of last mutation (epoch millis)
    pub updated_at: i64,
}

impl Record {
    /// A clean record as returned by the server.
    pub fn from_server(key: RecordKey, payload: Vec<u8>, version: u64) -> Self {
        Self {
            key,
            payload,
            version,
            local_dirty: false,
            updated_at: now_millis(),
        }
    }

    /// A dirty record produced by a local write on top of `base_version`.
    pub fn local(key: RecordKey, payload: Vec<u8>, base_version: u64) -> Self {
        Self {
            key,
            payload,
            version: base_version,
            local_dirty: true,
            updated_at: now_millis(),
        }
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Age relative to `now` in millis, never negative.
    #[must_use]
    pub fn age_millis(&self, now: i64) -> u64 {
        now.saturating_sub(self.updated_at).max(0) as u64
    }
}

/// An offline mutation not yet acknowledged by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub key: RecordKey,
    pub payload: Vec<u8>,
    /// Version the client believed current when it made the edit
    pub base_version: u64,
    pub created_at: i64,
}

impl PendingWrite {
    pub fn new(key: RecordKey, payload: Vec<u8>, base_version: u64) -> Self {
        Self {
            key,
            payload,
            base_version,
            created_at: now_millis(),
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Server value replaced the local edit
    ServerWins,
    /// Server no longer has the record; the local edit was dropped
    LocalDiscarded,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerWins => write!(f, "server_wins"),
            Self::LocalDiscarded => write!(f, "local_discarded"),
        }
    }
}

/// Produced when a pending write's base version did not match the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub key: RecordKey,
    pub local_payload: Vec<u8>,
    /// `None` when the server has deleted the record
    pub remote_payload: Option<Vec<u8>>,
    pub remote_version: u64,
    pub resolution: Resolution,
    pub resolved_at: i64,
}

/// Server-assigned identifier of a push event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A change pushed by the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: EventId,
    pub topic: String,
    pub key: RecordKey,
    pub version: u64,
    /// `None` means the record was deleted
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(owner: &str, id: &str) -> RecordKey {
        RecordKey::new(OwnerId::new(owner), "message", id)
    }

    #[test]
    fn test_storage_id_differs_per_owner() {
        assert_ne!(key("alice", "m1").storage_id(), key("bob", "m1").storage_id());
        assert_eq!(key("alice", "m1").storage_id(), key("alice", "m1").storage_id());
    }

    #[test]
    fn test_storage_id_is_length_prefixed() {
        let a = RecordKey::new(OwnerId::new("ab"), "c", "d");
        let b = RecordKey::new(OwnerId::new("a"), "bc", "d");
        assert_ne!(a.storage_id(), b.storage_id());
    }

    #[test]
    fn test_storage_id_is_hex_sha256() {
        let id = key("alice", "m1").storage_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_local_record_is_dirty() {
        let r = Record::local(key("alice", "m1"), b"x".to_vec(), 7);
        assert!(r.local_dirty);
        assert_eq!(r.version, 7);

        let s = Record::from_server(key("alice", "m1"), b"x".to_vec(), 8);
        assert!(!s.local_dirty);
    }

    #[test]
    fn test_age_never_negative() {
        let mut r = Record::from_server(key("alice", "m1"), vec![], 1);
        r.updated_at = 1_000;
        assert_eq!(r.age_millis(500), 0);
        assert_eq!(r.age_millis(1_500), 500);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key("alice", "m1").to_string(), "alice/message/m1");
    }

    #[test]
    fn test_change_event_json_roundtrip_without_payload() {
        let json = serde_json::json!({
            "event_id": "e-1",
            "topic": "conv-1",
            "key": {"owner": "alice", "entity_type": "message", "entity_id": "m1"},
            "version": 4
        });
        let event: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.event_id.as_str(), "e-1");
        assert!(event.payload.is_none());
    }
}
