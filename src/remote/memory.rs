// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned in-process server.
//!
//! Behaves like the real backend for conditional writes: every accepted write
//! bumps the record version and mints an event id. Optionally mirrors every
//! change onto a [`ChannelTransport`] topic so realtime echoes can be tested.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{NetworkError, PushOutcome, RemoteBackend};
use crate::realtime::ChannelTransport;
use crate::record::{ChangeEvent, EventId, Record, RecordKey};

#[derive(Default)]
struct ServerState {
    records: HashMap<RecordKey, Record>,
    /// Highest version ever issued per key; survives deletes
    versions: HashMap<RecordKey, u64>,
}

struct Mirror {
    hub: ChannelTransport,
    topic: String,
}

struct Shared {
    state: Mutex<ServerState>,
    online: AtomicBool,
    fail_next: AtomicU32,
    next_event: AtomicU64,
    fetches: AtomicU64,
    pushes: AtomicU64,
    mirror: Mutex<Option<Mirror>>,
}

/// Clones share one server.
#[derive(Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState::default()),
                online: AtomicBool::new(true),
                fail_next: AtomicU32::new(0),
                next_event: AtomicU64::new(1),
                fetches: AtomicU64::new(0),
                pushes: AtomicU64::new(0),
                mirror: Mutex::new(None),
            }),
        }
    }

    /// Publish every change to `topic` on `hub`.
    pub fn mirror_to(&self, hub: ChannelTransport, topic: impl Into<String>) {
        *self.shared.mirror.lock() = Some(Mirror { hub, topic: topic.into() });
    }

    /// While offline every call fails with [`NetworkError::Offline`].
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Release);
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::Release);
    }

    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.shared.fetches.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn push_count(&self) -> u64 {
        self.shared.pushes.load(Ordering::Relaxed)
    }

    /// Server-side view of a record (test inspection).
    #[must_use]
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.shared.state.lock().records.get(key).cloned()
    }

    /// Unconditional write by another client. Returns the emitted event.
    pub fn server_write(&self, key: &RecordKey, payload: Vec<u8>) -> ChangeEvent {
        let event = {
            let mut state = self.shared.state.lock();
            let version = Self::bump(&mut state, key);
            state.records.insert(key.clone(), Record::from_server(key.clone(), payload.clone(), version));
            self.event(key, version, Some(payload))
        };
        self.publish(&event);
        event
    }

    /// Deletion by another client. Returns the emitted event.
    pub fn server_delete(&self, key: &RecordKey) -> ChangeEvent {
        let event = {
            let mut state = self.shared.state.lock();
            let version = Self::bump(&mut state, key);
            state.records.remove(key);
            self.event(key, version, None)
        };
        self.publish(&event);
        event
    }

    fn bump(state: &mut ServerState, key: &RecordKey) -> u64 {
        let version = state.versions.entry(key.clone()).or_insert(0);
        *version += 1;
        *version
    }

    fn event(&self, key: &RecordKey, version: u64, payload: Option<Vec<u8>>) -> ChangeEvent {
        let n = self.shared.next_event.fetch_add(1, Ordering::Relaxed);
        let topic = self
            .shared
            .mirror
            .lock()
            .as_ref()
            .map(|m| m.topic.clone())
            .unwrap_or_default();
        ChangeEvent {
            event_id: EventId::new(format!("evt-{}", n)),
            topic,
            key: key.clone(),
            version,
            payload,
        }
    }

    fn publish(&self, event: &ChangeEvent) {
        if let Some(mirror) = self.shared.mirror.lock().as_ref() {
            mirror.hub.publish(event.clone());
        }
    }

    fn check_reachable(&self) -> Result<(), NetworkError> {
        if !self.shared.online.load(Ordering::Acquire) {
            return Err(NetworkError::Offline);
        }
        let injected = self
            .shared
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NetworkError::Transient("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>, NetworkError> {
        self.shared.fetches.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;
        Ok(self.shared.state.lock().records.get(key).cloned())
    }

    async fn push(&self, key: &RecordKey, payload: &[u8], base_version: u64) -> Result<PushOutcome, NetworkError> {
        self.shared.pushes.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;

        let event = {
            let mut state = self.shared.state.lock();
            let current = state.records.get(key).map_or(0, |r| r.version);
            if current != base_version {
                debug!(key = %key, current, base_version, "Push rejected: stale base");
                return Ok(PushOutcome::Conflict { current: state.records.get(key).cloned() });
            }
            let version = Self::bump(&mut state, key);
            state
                .records
                .insert(key.clone(), Record::from_server(key.clone(), payload.to_vec(), version));
            self.event(key, version, Some(payload.to_vec()))
        };
        self.publish(&event);
        Ok(PushOutcome::Accepted { version: event.version, event_id: event.event_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::Transport;
    use crate::record::OwnerId;

    fn key(id: &str) -> RecordKey {
        RecordKey::new(OwnerId::new("alice"), "doc", id)
    }

    #[tokio::test]
    async fn test_conditional_push() {
        let server = InMemoryBackend::new();
        let k = key("d1");

        let first = server.push(&k, b"a", 0).await.unwrap();
        assert!(matches!(first, PushOutcome::Accepted { version: 1, .. }));

        let stale = server.push(&k, b"b", 0).await.unwrap();
        match stale {
            PushOutcome::Conflict { current: Some(r) } => assert_eq!(r.version, 1),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(server.push(&k, b"c", 1).await.unwrap(), PushOutcome::Accepted { version: 2, .. }));
        assert_eq!(server.fetch(&k).await.unwrap().unwrap().payload, b"c".to_vec());
    }

    #[tokio::test]
    async fn test_delete_keeps_version_monotonic() {
        let server = InMemoryBackend::new();
        let k = key("d1");
        server.server_write(&k, b"x".to_vec());
        let deleted = server.server_delete(&k);
        assert_eq!(deleted.version, 2);
        assert!(server.fetch(&k).await.unwrap().is_none());
        assert!(matches!(server.push(&k, b"y", 0).await.unwrap(), PushOutcome::Accepted { version: 3, .. }));
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let server = InMemoryBackend::new();
        server.set_online(false);
        assert_eq!(server.fetch(&key("d")).await, Err(NetworkError::Offline));
        server.set_online(true);

        server.fail_next(2);
        assert!(matches!(server.fetch(&key("d")).await, Err(NetworkError::Transient(_))));
        assert!(matches!(server.fetch(&key("d")).await, Err(NetworkError::Transient(_))));
        assert!(server.fetch(&key("d")).await.is_ok());
        assert_eq!(server.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_mirror_publishes_events() {
        let hub = ChannelTransport::new();
        let server = InMemoryBackend::new();
        server.mirror_to(hub.clone(), "docs");
        let mut stream = hub.connect("docs", None).await.unwrap();

        let outcome = server.push(&key("d1"), b"a", 0).await.unwrap();
        let event = stream.next_event().await.unwrap().unwrap();
        match outcome {
            PushOutcome::Accepted { event_id, .. } => assert_eq!(event.event_id, event_id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(event.topic, "docs");
    }
}
