// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The [`SyncCoordinator`] is the only entry point domain code uses. It ties
//! together:
//! - the in-memory cache ([`MemoryCache`])
//! - the encrypted offline store ([`EncryptedStore`])
//! - the remote backend behind a [`CircuitBreaker`]
//! - the [`ConflictResolver`] for queued writes
//! - the realtime [`SubscriptionManager`]
//!
//! # Lifecycle
//!
//! ```text
//! new/open ──► login(owner) ──► Session ──► read / write / subscribe / flush_pending
//!                                  │
//!                               logout ──► owner data erased, session revoked
//!
//! run() ──► reacts to connectivity, retry cadence ──► shutdown()
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::{OwnerId, RecordKey, SyncConfig, SyncCoordinator};
//! use offline_sync::crypto::StaticKeyProvider;
//! use offline_sync::realtime::ChannelTransport;
//! use offline_sync::remote::memory::InMemoryBackend;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), offline_sync::SyncError> {
//! let sync = SyncCoordinator::open(
//!     SyncConfig::default(),
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(ChannelTransport::new()),
//!     Arc::new(StaticKeyProvider::random()),
//! )
//! .await?;
//!
//! let session = sync.login(OwnerId::new("user-1")).await?;
//! let key = RecordKey::new(session.owner().clone(), "note", "n-1");
//! sync.write(&session, &key, b"draft".to_vec()).await?;
//! let conflicts = sync.flush_pending(&session).await?;
//! assert!(conflicts.is_empty());
//! # Ok(())
//! # }
//! ```

mod api;
mod flush;
mod lifecycle;
mod session;
mod sink;
mod types;

pub use session::Session;
pub use types::{CoordinatorState, SyncError};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::cache::{CacheStats, MemoryCache};
use crate::config::SyncConfig;
use crate::conflict::{ConflictLog, ConflictResolver};
use crate::crypto::KeyProvider;
use crate::network::ConnectivityMonitor;
use crate::realtime::{AppliedEvents, SubscriptionManager, SubscriptionState, Transport};
use crate::remote::RemoteBackend;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::storage::encrypted::EncryptedStore;
use crate::storage::memory::InMemoryBlobStore;
use crate::storage::sqlite::SqliteBlobStore;
use crate::storage::traits::BlobStore;

use session::{FlushFlags, OwnerLocks, SessionRegistry};
use sink::CoordinatorSink;

/// State shared between the coordinator and its realtime sink.
pub(crate) struct LocalState {
    pub(crate) store: EncryptedStore,
    pub(crate) cache: MemoryCache,
    pub(crate) sessions: SessionRegistry,
    pub(crate) locks: OwnerLocks,
    pub(crate) cache_ttl: Duration,
}

/// Offline-first sync façade.
///
/// `Send + Sync`; share it behind an `Arc` and drive [`run`](Self::run)
/// from a spawned task.
pub struct SyncCoordinator {
    pub(super) config: SyncConfig,

    /// Store, cache, sessions and owner locks
    pub(super) local: Arc<LocalState>,

    /// Every network call goes through the breaker
    pub(super) backend: Arc<dyn RemoteBackend>,
    pub(super) breaker: Arc<CircuitBreaker>,

    pub(super) resolver: ConflictResolver,
    pub(super) conflicts: Arc<ConflictLog>,

    pub(super) realtime: SubscriptionManager,
    pub(super) applied: Arc<AppliedEvents>,

    pub(super) connectivity: ConnectivityMonitor,
    pub(super) keys: Arc<dyn KeyProvider>,

    /// Per-owner flush coalescing
    pub(super) flushing: FlushFlags,

    pub(super) state: watch::Sender<CoordinatorState>,
}

impl SyncCoordinator {
    /// Build over an explicit blob store.
    pub fn new(
        config: SyncConfig,
        blobs: Arc<dyn BlobStore>,
        backend: Arc<dyn RemoteBackend>,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let local = Arc::new(LocalState {
            store: EncryptedStore::new(blobs),
            cache: MemoryCache::new(
                config.cache_max_entries,
                config.cache_max_bytes,
                config.cache_eviction_fraction,
            ),
            sessions: SessionRegistry::default(),
            locks: OwnerLocks::default(),
            cache_ttl: config.cache_ttl(),
        });

        let breaker = Arc::new(CircuitBreaker::new(
            "backend",
            config.circuit_config(),
            config.retry_config(),
        ));
        let applied = Arc::new(AppliedEvents::new(config.applied_event_capacity));
        let conflicts = Arc::new(ConflictLog::new(config.conflict_history_capacity));
        let resolver = ConflictResolver::new(backend.clone(), breaker.clone(), conflicts.clone(), applied.clone());
        let realtime = SubscriptionManager::new(
            transport,
            applied.clone(),
            Some(Arc::new(CoordinatorSink::new(local.clone()))),
            config.realtime_config(),
        );
        let (state, _) = watch::channel(CoordinatorState::Created);

        info!(
            cache_entries = config.cache_max_entries,
            circuit_threshold = config.circuit_failure_threshold,
            "Sync coordinator created"
        );

        Ok(Self {
            config,
            local,
            backend,
            breaker,
            resolver,
            conflicts,
            realtime,
            applied,
            connectivity: ConnectivityMonitor::new(true),
            keys,
            flushing: FlushFlags::default(),
            state,
        })
    }

    /// Build with the store selected by `config.store_path` (SQLite file, or
    /// in-memory when unset).
    pub async fn open(
        config: SyncConfig,
        backend: Arc<dyn RemoteBackend>,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
    ) -> Result<Self, SyncError> {
        let blobs: Arc<dyn BlobStore> = match &config.store_path {
            Some(path) => Arc::new(SqliteBlobStore::open(path).await?),
            None => Arc::new(InMemoryBlobStore::new()),
        };
        Self::new(config, blobs, backend, transport, keys)
    }

    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The session currently logged in.
    pub fn current_session(&self) -> Result<Session, SyncError> {
        self.local.sessions.current().ok_or(SyncError::NoSession)
    }

    /// Raw reachability input from the platform; the run loop debounces it.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitBreakerState {
        self.breaker.snapshot()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.local.cache.stats()
    }

    #[must_use]
    pub fn subscription_state(&self, topic: &str) -> Option<SubscriptionState> {
        self.realtime.state(topic)
    }
}
