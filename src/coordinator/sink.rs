// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applies realtime events to the offline store and cache.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::LocalState;
use crate::realtime::{ApplyOutcome, EventSink};
use crate::record::{ChangeEvent, OwnerId, Record};

pub(super) struct CoordinatorSink {
    local: Arc<LocalState>,
}

impl CoordinatorSink {
    pub(super) fn new(local: Arc<LocalState>) -> Self {
        Self { local }
    }

    fn owner_is_active(&self, owner: &OwnerId) -> bool {
        self.local
            .sessions
            .current()
            .is_some_and(|s| s.owner() == owner)
    }
}

#[async_trait]
impl EventSink for CoordinatorSink {
    async fn apply(&self, owner: &OwnerId, event: &ChangeEvent) -> ApplyOutcome {
        let key = &event.key;
        if key.owner() != owner {
            error!(
                topic = %event.topic,
                topic_owner = %owner,
                key_owner = %key.owner(),
                "Tenant isolation violation: event for another owner dropped"
            );
            crate::metrics::record_isolation_violation();
            return ApplyOutcome::Rejected;
        }
        if !self.owner_is_active(owner) {
            debug!(topic = %event.topic, owner = %owner, "No session for owner, event dropped");
            return ApplyOutcome::Rejected;
        }

        let _guard = self.local.locks.lock(owner).await;
        // Logout may have won the lock
        if !self.owner_is_active(owner) {
            return ApplyOutcome::Rejected;
        }

        let local = match self.local.store.get(key).await {
            Ok(local) => local,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not read local record for event");
                return ApplyOutcome::Failed;
            }
        };
        if let Some(local) = &local {
            if local.local_dirty {
                debug!(key = %key, version = event.version, "Local edit pending, flush will reconcile");
                return ApplyOutcome::Applied;
            }
            if local.version >= event.version {
                return ApplyOutcome::AlreadyReflected;
            }
        }

        let applied = match &event.payload {
            Some(payload) => {
                let record = Record::from_server(key.clone(), payload.clone(), event.version);
                let res = self.local.store.put(&record).await;
                if res.is_ok() {
                    self.local.cache.put(key.clone(), record, self.local.cache_ttl);
                }
                res
            }
            None => {
                self.local.cache.invalidate(key);
                if local.is_some() {
                    self.local.store.delete(key).await
                } else {
                    Ok(())
                }
            }
        };
        match applied {
            Ok(()) => ApplyOutcome::Applied,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to apply realtime event locally");
                self.local.cache.invalidate(key);
                ApplyOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::crypto::DeviceKey;
    use crate::record::{EventId, RecordKey};
    use crate::storage::memory::InMemoryBlobStore;
    use crate::storage::encrypted::EncryptedStore;
    use std::time::Duration;

    use super::super::session::{OwnerLocks, SessionRegistry};

    fn local_state(blobs: &InMemoryBlobStore) -> Arc<LocalState> {
        Arc::new(LocalState {
            store: EncryptedStore::new(Arc::new(blobs.clone())),
            cache: MemoryCache::new(64, 1 << 20, 0.1),
            sessions: SessionRegistry::default(),
            locks: OwnerLocks::default(),
            cache_ttl: Duration::from_secs(60),
        })
    }

    fn logged_in(blobs: &InMemoryBlobStore, owner: &OwnerId) -> CoordinatorSink {
        let local = local_state(blobs);
        local.store.activate(owner, &DeviceKey::from_bytes([3u8; 32]));
        let _session = local.sessions.begin(owner);
        CoordinatorSink::new(local)
    }

    fn event(key: RecordKey, version: u64, payload: Option<&[u8]>) -> ChangeEvent {
        ChangeEvent {
            event_id: EventId::new(format!("e{}", version)),
            topic: "t".to_string(),
            key,
            version,
            payload: payload.map(<[u8]>::to_vec),
        }
    }

    #[tokio::test]
    async fn test_newer_event_applied_to_store_and_cache() {
        let blobs = InMemoryBlobStore::new();
        let alice = OwnerId::new("alice");
        let sink = logged_in(&blobs, &alice);
        let key = RecordKey::new(alice.clone(), "doc", "d1");

        let outcome = sink.apply(&alice, &event(key.clone(), 2, Some(b"v2"))).await;
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(sink.local.store.get(&key).await.unwrap().unwrap().version, 2);
        assert!(sink.local.cache.contains(&key));
    }

    #[tokio::test]
    async fn test_older_version_already_reflected() {
        let blobs = InMemoryBlobStore::new();
        let alice = OwnerId::new("alice");
        let sink = logged_in(&blobs, &alice);
        let key = RecordKey::new(alice.clone(), "doc", "d1");
        sink.local.store.put(&Record::from_server(key.clone(), b"v3".to_vec(), 3)).await.unwrap();

        let outcome = sink.apply(&alice, &event(key.clone(), 3, Some(b"stale"))).await;
        assert_eq!(outcome, ApplyOutcome::AlreadyReflected);
        assert_eq!(sink.local.store.get(&key).await.unwrap().unwrap().payload, b"v3".to_vec());
    }

    #[tokio::test]
    async fn test_foreign_or_inactive_owner_rejected() {
        let blobs = InMemoryBlobStore::new();
        let alice = OwnerId::new("alice");
        let sink = logged_in(&blobs, &alice);

        let bobs = RecordKey::new(OwnerId::new("bob"), "doc", "d1");
        assert_eq!(sink.apply(&alice, &event(bobs.clone(), 1, Some(b"x"))).await, ApplyOutcome::Rejected);
        assert_eq!(sink.apply(&OwnerId::new("bob"), &event(bobs, 1, Some(b"x"))).await, ApplyOutcome::Rejected);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_store_write_failure_reported() {
        let blobs = InMemoryBlobStore::new();
        let alice = OwnerId::new("alice");
        let sink = logged_in(&blobs, &alice);
        let key = RecordKey::new(alice.clone(), "doc", "d1");

        blobs.set_fail_writes(true);
        let outcome = sink.apply(&alice, &event(key.clone(), 1, Some(b"v1"))).await;
        assert_eq!(outcome, ApplyOutcome::Failed);
        assert!(!sink.local.cache.contains(&key));

        // Same event applies once the disk recovers
        blobs.set_fail_writes(false);
        assert_eq!(sink.apply(&alice, &event(key, 1, Some(b"v1"))).await, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_delete_failure_reported() {
        let blobs = InMemoryBlobStore::new();
        let alice = OwnerId::new("alice");
        let sink = logged_in(&blobs, &alice);
        let key = RecordKey::new(alice.clone(), "doc", "d1");
        sink.local.store.put(&Record::from_server(key.clone(), b"v1".to_vec(), 1)).await.unwrap();

        blobs.set_fail_writes(true);
        assert_eq!(sink.apply(&alice, &event(key.clone(), 2, None)).await, ApplyOutcome::Failed);
        assert!(sink.local.store.get(&key).await.unwrap().is_some());
    }
}
