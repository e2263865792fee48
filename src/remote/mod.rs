// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream backend seam.
//!
//! The coordinator only talks to the server through [`RemoteBackend`], and
//! only ever through the circuit breaker. Two implementations:
//! - [`http::HttpBackend`]: reqwest client against the sync REST API
//! - [`memory::InMemoryBackend`]: versioned in-process server for tests

pub mod http;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{EventId, Record, RecordKey};
use crate::resilience::retry::Retryable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("request timed out")]
    Timeout,
    #[error("device is offline")]
    Offline,
    #[error("authentication expired")]
    AuthExpired,
    #[error("request rejected with status {status}")]
    Rejected { status: u16 },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("client misconfigured: {0}")]
    Config(String),
}

impl Retryable for NetworkError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout | Self::Offline)
    }
}

/// Server answer to a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Write applied; `version` is the post-write version
    Accepted { version: u64, event_id: EventId },
    /// Base version was stale; `current` is what the server holds (`None` = deleted)
    Conflict { current: Option<Record> },
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Current server record, `None` if the server has none.
    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>, NetworkError>;

    /// Conditional write: applied only if the server version equals `base_version`.
    async fn push(&self, key: &RecordKey, payload: &[u8], base_version: u64) -> Result<PushOutcome, NetworkError>;
}
