// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Offline Sync
//!
//! Client-side offline-first synchronization layer: keeps a device's local
//! view of remote, multi-tenant data consistent under unreliable networks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SyncCoordinator                        │
//! │  • read / write / subscribe / flush_pending per Session     │
//! │  • per-owner single-writer locks                            │
//! └─────────────────────────────────────────────────────────────┘
//!        │ read/write            │ flush               ▲ events
//!        ▼                       ▼                     │
//! ┌──────────────┐      ┌──────────────────┐   ┌──────────────────────┐
//! │ MemoryCache  │      │ ConflictResolver │   │ SubscriptionManager  │
//! │ LRU, 2 caps  │      │ server-wins      │   │ reconnect + resume   │
//! └──────────────┘      └──────────────────┘   └──────────────────────┘
//!        │                       │                     │
//!        ▼                       ▼                     ▼
//! ┌──────────────┐      ┌──────────────────┐   ┌──────────────────────┐
//! │EncryptedStore│      │ CircuitBreaker   │   │ Transport (ws/chan)  │
//! │ AEAD blobs   │      │ + retry          │   └──────────────────────┘
//! └──────────────┘      └──────────────────┘
//!        │                       │
//!        ▼                       ▼
//!   BlobStore (SQLite/memory)  RemoteBackend (HTTP/memory)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{OwnerId, RecordKey, SyncConfig, SyncCoordinator};
//! use offline_sync::crypto::StaticKeyProvider;
//! use offline_sync::realtime::WsTransport;
//! use offline_sync::remote::http::HttpBackend;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig {
//!         store_path: Some("/data/offline.db".into()),
//!         ..Default::default()
//!     };
//!     let backend = HttpBackend::new("https://api.example.com/v1", Duration::from_secs(10))?;
//!     let transport = WsTransport::new("wss://api.example.com/v1", None);
//!
//!     let sync = Arc::new(
//!         SyncCoordinator::open(config, Arc::new(backend), Arc::new(transport), Arc::new(StaticKeyProvider::random()))
//!             .await?,
//!     );
//!     let runner = sync.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     let session = sync.login(OwnerId::new("user-1")).await?;
//!     let key = RecordKey::new(session.owner().clone(), "conversation", "c-42");
//!     sync.write(&session, &key, b"hello".to_vec()).await?;
//!     if let Some(record) = sync.read(&session, &key).await? {
//!         println!("v{} dirty={}", record.version, record.local_dirty);
//!     }
//!
//!     sync.logout(&session).await?;
//!     sync.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncCoordinator`] façade and [`Session`]
//! - [`storage`]: encrypted offline store over SQLite or memory
//! - [`cache`]: bounded LRU in-memory cache
//! - [`conflict`]: server-wins resolution and the conflict log
//! - [`realtime`]: push subscriptions with reconnection
//! - [`remote`]: backend seam (HTTP, in-memory)
//! - [`resilience`]: circuit breaker and retry
//! - [`crypto`]: device key and record sealing

pub mod cache;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod crypto;
pub mod metrics;
pub mod network;
pub mod realtime;
pub mod record;
pub mod remote;
pub mod resilience;
pub mod storage;
pub mod util;

pub use cache::{CacheStats, MemoryCache};
pub use config::{ConfigError, SyncConfig};
pub use conflict::{ConflictLog, ConflictResolver, WriteResolution};
pub use coordinator::{CoordinatorState, Session, SyncCoordinator, SyncError};
pub use realtime::{ApplyOutcome, SubscriptionHandle, SubscriptionState, SubscriptionStatus};
pub use record::{ChangeEvent, ConflictRecord, EventId, OwnerId, PendingWrite, Record, RecordKey, Resolution};
pub use remote::{NetworkError, PushOutcome, RemoteBackend};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitConfig, CircuitError, CircuitState};
pub use resilience::retry::RetryConfig;
pub use storage::traits::StorageError;
pub use metrics::LatencyTimer;
