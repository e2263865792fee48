// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session lifecycle and the background run loop.

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::types::FlushTrigger;
use super::{CoordinatorState, Session, SyncCoordinator, SyncError};
use crate::record::{OwnerId, PendingWrite};
use crate::util::Debouncer;

impl SyncCoordinator {
    /// Log `owner` in and return their session.
    ///
    /// Login flow:
    /// 1. End the current session if it belongs to someone else (their data is erased)
    /// 2. Load the device key
    /// 3. Erase anything another owner left on disk (crash without logout)
    /// 4. Activate the offline store for `owner`
    /// 5. Re-queue dirty records whose pending write was lost
    #[tracing::instrument(skip_all, fields(owner = %owner))]
    pub async fn login(&self, owner: OwnerId) -> Result<Session, SyncError> {
        if let Some(current) = self.local.sessions.current() {
            if current.owner() != &owner {
                info!(previous = %current.owner(), "Ending previous owner's session");
                self.logout(&current).await?;
            }
        }

        let key = self.keys.load_key().await?;
        let _guard = self.local.locks.lock(&owner).await;

        let purged = self.local.store.purge_other_owners(&owner).await?;
        self.local.store.activate(&owner, &key);
        let recovered = self.recover_dirty(&owner).await?;

        let session = self.local.sessions.begin(&owner);
        info!(generation = session.generation(), purged, recovered, "Logged in");
        crate::metrics::record_session("login");
        Ok(session)
    }

    /// Log the session's owner out, erasing every trace of their data.
    ///
    /// Waits for in-flight writes of the owner; any write that acquires the
    /// owner lock afterwards fails with [`SyncError::SessionExpired`].
    #[tracing::instrument(skip_all, fields(owner = %session.owner()))]
    pub async fn logout(&self, session: &Session) -> Result<(), SyncError> {
        let owner = session.owner().clone();
        let _guard = self.local.locks.lock(&owner).await;
        if !self.local.sessions.revoke(session) {
            return Err(SyncError::SessionExpired);
        }

        let topics = self.realtime.unsubscribe_owner(&owner);
        let cached = self.local.cache.invalidate_owner(&owner);
        let erased = self.local.store.delete_all_for_owner(&owner).await;
        self.local.store.deactivate();
        self.applied.clear();

        match erased {
            Ok(removed) => {
                info!(topics, cached, removed, "Logged out");
                crate::metrics::record_session("logout");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Logout could not erase offline data, next login will retry");
                Err(e.into())
            }
        }
    }

    /// Enqueue a pending write for every dirty record that lacks one.
    async fn recover_dirty(&self, owner: &OwnerId) -> Result<usize, SyncError> {
        let dirty = self
            .local
            .store
            .dirty_records(owner, self.config.recovery_page_size)
            .await?;
        let mut requeued = 0;
        for record in dirty {
            if self.local.store.has_pending_write(&record.key).await? {
                continue;
            }
            warn!(key = %record.key, "Dirty record had no pending write, re-queued");
            let write = PendingWrite::new(record.key.clone(), record.payload, record.version);
            self.local.store.enqueue_pending_write(&write).await?;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Background loop. Returns after [`shutdown`](Self::shutdown).
    ///
    /// Reacts to:
    /// - debounced connectivity: back online wakes stalled topics and flushes
    /// - the pending-write retry cadence
    pub async fn run(&self) {
        let mut state_rx = self.state.subscribe();
        let started = self.state.send_if_modified(|state| {
            if *state == CoordinatorState::Created {
                *state = CoordinatorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(state = %self.state(), "Run loop not started");
            return;
        }
        info!("Sync coordinator running");

        let mut connectivity = Debouncer::new(self.connectivity.subscribe(), self.config.connectivity_debounce());
        let period = self.config.pending_retry_interval();
        let mut retry = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == CoordinatorState::ShuttingDown {
                        break;
                    }
                }

                Some(online) = connectivity.next() => {
                    if online {
                        self.on_back_online().await;
                    } else {
                        info!("Offline, writes will queue");
                    }
                }

                _ = retry.tick() => {
                    debug!("Pending-write retry tick");
                    self.flush_current(FlushTrigger::Retry).await;
                }
            }
        }
        info!("Sync coordinator run loop stopped");
    }

    async fn on_back_online(&self) {
        let woken = self.realtime.resubscribe_stalled();
        info!(woken, "Back online");
        self.flush_current(FlushTrigger::Reconnect).await;
    }

    /// Stop the run loop and close every subscription.
    pub fn shutdown(&self) {
        let previous = self.state.send_replace(CoordinatorState::ShuttingDown);
        self.realtime.unsubscribe_all();
        info!(from = %previous, "Sync coordinator shut down");
    }
}
