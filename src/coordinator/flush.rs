// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pending-write flushing.
//!
//! One pass per owner at a time; a trigger that arrives while a pass runs
//! returns immediately with nothing. Each write is resolved under the owner
//! lock and re-read from the queue first, so a write superseded since the
//! scan is flushed with its latest payload.

use std::time::Instant;
use tracing::{debug, info, warn};

use super::types::FlushTrigger;
use super::{Session, SyncCoordinator, SyncError};
use crate::record::ConflictRecord;

impl SyncCoordinator {
    /// Reconcile every queued write of the session's owner with the server.
    ///
    /// Returns the conflicts produced by this pass (empty when another pass
    /// was already running). A network failure stops the pass: writes
    /// resolved before it stay resolved, the rest stay queued.
    #[tracing::instrument(skip_all, fields(owner = %session.owner()))]
    pub async fn flush_pending(&self, session: &Session) -> Result<Vec<ConflictRecord>, SyncError> {
        self.flush(session, FlushTrigger::Explicit).await
    }

    /// App came to the foreground: wake stalled subscriptions and flush.
    #[tracing::instrument(skip_all, fields(owner = %session.owner()))]
    pub async fn on_foreground(&self, session: &Session) -> Result<Vec<ConflictRecord>, SyncError> {
        self.local.sessions.check(session)?;
        self.realtime.resubscribe_stalled();
        if !self.connectivity.is_online() {
            debug!("Foregrounded while offline, flush deferred");
            return Ok(Vec::new());
        }
        self.flush(session, FlushTrigger::Foreground).await
    }

    pub(super) async fn flush(&self, session: &Session, trigger: FlushTrigger) -> Result<Vec<ConflictRecord>, SyncError> {
        self.local.sessions.check(session)?;
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        let Some(_flushing) = self.flushing.try_claim(session.owner()) else {
            debug!(trigger = trigger.as_str(), "Flush already in progress, coalesced");
            crate::metrics::record_flush(trigger.as_str(), "coalesced");
            return Ok(Vec::new());
        };

        let start = Instant::now();
        let queued = self.local.store.drain_pending_writes(session.owner()).await?;
        if queued.is_empty() {
            return Ok(Vec::new());
        }
        info!(trigger = trigger.as_str(), pending = queued.len(), "Flushing pending writes");

        let mut conflicts = Vec::new();
        let mut pushed = 0usize;
        for scanned in queued {
            let key = scanned.key;
            let _guard = self.local.locks.lock(session.owner()).await;
            self.local.sessions.check(session)?;

            let Some(write) = self.local.store.pending_write(&key).await? else {
                continue;
            };

            match self.resolver.resolve(&self.local.store, &write).await {
                Ok(resolution) => {
                    match resolution.record() {
                        Some(record) => self.local.cache.put(key.clone(), record.clone(), self.local.cache_ttl),
                        None => self.local.cache.invalidate(&key),
                    }
                    match resolution.conflict() {
                        Some(conflict) => conflicts.push(conflict.clone()),
                        None => pushed += 1,
                    }
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %e,
                        pushed,
                        conflicts = conflicts.len(),
                        "Flush stopped, remaining writes stay queued"
                    );
                    crate::metrics::record_flush(trigger.as_str(), "failed");
                    return Err(e);
                }
            }
        }

        info!(
            trigger = trigger.as_str(),
            pushed,
            conflicts = conflicts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Flush complete"
        );
        crate::metrics::record_flush(trigger.as_str(), "complete");
        crate::metrics::record_flush_latency(start.elapsed());
        Ok(conflicts)
    }

    /// Flush for whoever is logged in, if anyone and if online.
    pub(super) async fn flush_current(&self, trigger: FlushTrigger) {
        let Some(session) = self.local.sessions.current() else {
            return;
        };
        if !self.connectivity.is_online() {
            return;
        }
        match self.flush(&session, trigger).await {
            Ok(conflicts) if !conflicts.is_empty() => {
                info!(trigger = trigger.as_str(), conflicts = conflicts.len(), "Background flush resolved conflicts");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(trigger = trigger.as_str(), error = %e, "Background flush failed, will retry");
            }
        }
    }
}
