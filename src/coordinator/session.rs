// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session context and per-owner write exclusion.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::types::SyncError;
use crate::record::{OwnerId, RecordKey};

/// Proof of login. Every coordinator call takes one.
///
/// A session stops working the moment its owner logs out (or another owner
/// logs in); calls then fail with [`SyncError::SessionExpired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    owner: OwnerId,
    generation: u64,
}

impl Session {
    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// The single current session.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    current: RwLock<Option<Session>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    /// Start a new session for `owner`, replacing any current one.
    pub(crate) fn begin(&self, owner: &OwnerId) -> Session {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Session { owner: owner.clone(), generation };
        *self.current.write() = Some(session.clone());
        session
    }

    /// End `session` if it is still the current one.
    pub(crate) fn revoke(&self, session: &Session) -> bool {
        let mut current = self.current.write();
        if current.as_ref() == Some(session) {
            *current = None;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub(crate) fn current(&self) -> Option<Session> {
        self.current.read().clone()
    }

    pub(crate) fn check(&self, session: &Session) -> Result<(), SyncError> {
        if self.current.read().as_ref() == Some(session) {
            Ok(())
        } else {
            Err(SyncError::SessionExpired)
        }
    }

    /// Valid session whose owner also owns `key`.
    pub(crate) fn check_key(&self, session: &Session, key: &RecordKey) -> Result<(), SyncError> {
        self.check(session)?;
        if key.owner() != session.owner() {
            tracing::error!(
                session_owner = %session.owner(),
                key_owner = %key.owner(),
                key = %key,
                "Tenant isolation violation"
            );
            crate::metrics::record_isolation_violation();
            return Err(SyncError::TenantIsolationViolation {
                expected: session.owner().clone(),
                found: key.owner().clone(),
            });
        }
        Ok(())
    }
}

/// One async mutex per owner. Never a global lock.
#[derive(Default)]
pub(crate) struct OwnerLocks {
    locks: DashMap<OwnerId, Arc<Mutex<()>>>,
}

impl OwnerLocks {
    pub(crate) async fn lock(&self, owner: &OwnerId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }
}

/// Per-owner "flush in progress" flags.
#[derive(Default)]
pub(crate) struct FlushFlags {
    flags: DashMap<OwnerId, Arc<AtomicBool>>,
}

impl FlushFlags {
    /// Claim the flush for `owner`; `None` if one is already running.
    pub(crate) fn try_claim(&self, owner: &OwnerId) -> Option<FlushGuard> {
        let flag = self
            .flags
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .value()
            .clone();
        if flag.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(FlushGuard(flag))
    }
}

/// RAII guard to reset the in-progress flag.
pub(crate) struct FlushGuard(Arc<AtomicBool>);

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
