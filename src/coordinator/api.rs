// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read, write and subscription operations.
//!
//! # Read path
//!
//! ```text
//! cache ──hit──► return
//!   │ miss
//!   ▼
//! store ──hit, fresh / dirty / offline──► cache + return
//!   │ miss            │ stale
//!   ▼                 ▼
//! network (breaker) ──► adopt under owner lock (never over a dirty record)
//!                       refresh failure ⇒ local copy returned
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::{Session, SyncCoordinator, SyncError};
use crate::realtime::{RealtimeError, SubscriptionHandle};
use crate::record::{now_millis, ChangeEvent, ConflictRecord, PendingWrite, Record, RecordKey};

impl SyncCoordinator {
    /// Read a record: cache, then offline store, then network.
    ///
    /// Returns `Ok(None)` when no copy exists anywhere reachable.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn read(&self, session: &Session, key: &RecordKey) -> Result<Option<Record>, SyncError> {
        let start = Instant::now();
        self.local.sessions.check_key(session, key)?;

        if let Some(record) = self.local.cache.get(key) {
            crate::metrics::record_read("cache", start.elapsed());
            return Ok(Some(record));
        }

        let stored = match self.local.store.get(key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Offline store read failed, treating as miss");
                None
            }
        };

        if let Some(record) = stored {
            if record.local_dirty || !self.is_stale(&record) || !self.connectivity.is_online() {
                let served = self.serve_local(session, record).await;
                crate::metrics::record_read("store", start.elapsed());
                return served;
            }

            debug!(age_ms = record.age_millis(now_millis()), "Refreshing stale record");
            return match self.fetch_remote(key).await {
                Ok(remote) => {
                    crate::metrics::record_read("network", start.elapsed());
                    self.adopt_remote(session, key, remote).await
                }
                Err(e) => {
                    warn!(error = %e, "Refresh failed, serving local copy");
                    let served = self.serve_local(session, record).await;
                    crate::metrics::record_read("store", start.elapsed());
                    served
                }
            };
        }

        if !self.connectivity.is_online() {
            crate::metrics::record_read("miss", start.elapsed());
            return Ok(None);
        }

        let remote = self.fetch_remote(key).await?;
        crate::metrics::record_read("network", start.elapsed());
        self.adopt_remote(session, key, remote).await
    }

    /// Optimistic local write, queued for flush.
    ///
    /// Durable in the offline store when this returns; the network is not
    /// touched.
    #[tracing::instrument(skip_all, fields(key = %key, bytes = payload.len()))]
    pub async fn write(&self, session: &Session, key: &RecordKey, payload: Vec<u8>) -> Result<(), SyncError> {
        self.local.sessions.check_key(session, key)?;

        let _guard = self.local.locks.lock(key.owner()).await;
        // Logout may have revoked the session while we waited
        self.local.sessions.check(session)?;

        let base_version = self.local.store.get(key).await?.map_or(0, |r| r.version);
        let record = Record::local(key.clone(), payload.clone(), base_version);
        let pending = PendingWrite::new(key.clone(), payload, base_version);

        if let Err(e) = self.local.store.put(&record).await {
            crate::metrics::record_write("error");
            return Err(e.into());
        }
        self.local.store.enqueue_pending_write(&pending).await?;
        self.local.cache.put(key.clone(), record, self.local.cache_ttl);

        debug!(base_version, "Write queued");
        crate::metrics::record_write("queued");
        Ok(())
    }

    /// Subscribe `handler` to `topic` for the session's owner.
    ///
    /// Idempotent per topic: a second subscribe shares the connection.
    pub fn subscribe<F>(&self, session: &Session, topic: &str, handler: F) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.local.sessions.check(session)?;
        self.realtime
            .subscribe(session.owner(), topic, Arc::new(handler))
            .map_err(|e| match e {
                RealtimeError::OwnerMismatch { topic, expected, found } => {
                    error!(topic = %topic, expected = %expected, found = %found, "Tenant isolation violation on subscribe");
                    crate::metrics::record_isolation_violation();
                    SyncError::TenantIsolationViolation { expected, found }
                }
            })
    }

    /// Remove one handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.realtime.unsubscribe_handler(handle)
    }

    /// Bounded history of resolved conflicts, oldest first.
    #[must_use]
    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.recent()
    }

    /// Writes still queued for the session's owner, oldest first.
    pub async fn pending_writes(&self, session: &Session) -> Result<Vec<PendingWrite>, SyncError> {
        self.local.sessions.check(session)?;
        Ok(self.local.store.drain_pending_writes(session.owner()).await?)
    }

    fn is_stale(&self, record: &Record) -> bool {
        Duration::from_millis(record.age_millis(now_millis())) >= self.config.stale_after()
    }

    /// Cache and return a record read from the store, unless a logout erased
    /// it while the read was in flight.
    async fn serve_local(&self, session: &Session, record: Record) -> Result<Option<Record>, SyncError> {
        let _guard = self.local.locks.lock(record.key.owner()).await;
        self.local.sessions.check(session)?;
        self.local.cache.put(record.key.clone(), record.clone(), self.local.cache_ttl);
        Ok(Some(record))
    }

    pub(super) async fn fetch_remote(&self, key: &RecordKey) -> Result<Option<Record>, SyncError> {
        let backend = &self.backend;
        self.breaker
            .execute(|| backend.fetch(key))
            .await
            .map_err(SyncError::from)
    }

    /// Store what the server returned, unless a local edit or a newer
    /// realtime event got there first.
    async fn adopt_remote(
        &self,
        session: &Session,
        key: &RecordKey,
        remote: Option<Record>,
    ) -> Result<Option<Record>, SyncError> {
        let _guard = self.local.locks.lock(key.owner()).await;
        self.local.sessions.check(session)?;

        let local = self.local.store.get(key).await?;
        if let Some(local) = &local {
            let newer_than_remote = remote.as_ref().map_or(false, |r| local.version > r.version);
            if local.local_dirty || newer_than_remote {
                self.local.cache.put(key.clone(), local.clone(), self.local.cache_ttl);
                return Ok(Some(local.clone()));
            }
        }

        match remote {
            Some(remote) => {
                let record = Record::from_server(key.clone(), remote.payload, remote.version);
                self.local.store.put(&record).await?;
                self.local.cache.put(key.clone(), record.clone(), self.local.cache_ttl);
                Ok(Some(record))
            }
            None => {
                if local.is_some() {
                    self.local.store.delete(key).await?;
                }
                self.local.cache.invalidate(key);
                Ok(None)
            }
        }
    }
}
