// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync coordinator.

use thiserror::Error;

use crate::config::ConfigError;
use crate::record::OwnerId;
use crate::remote::NetworkError;
use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::traits::StorageError;

/// Everything a coordinator operation can fail with.
///
/// Conflicts are not errors; they come back as
/// [`ConflictRecord`](crate::record::ConflictRecord)s.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Non-transient network failure (auth expired, rejected request, bad response)
    #[error("network error: {0}")]
    Network(NetworkError),

    #[error("backend circuit open, request not attempted")]
    CircuitOpen,

    #[error("gave up after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: usize, last: NetworkError },

    #[error("device is offline")]
    Offline,

    #[error("no active session")]
    NoSession,

    #[error("session expired")]
    SessionExpired,

    #[error("tenant isolation violation: session owner '{expected}', record owner '{found}'")]
    TenantIsolationViolation { expected: OwnerId, found: OwnerId },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen | Self::MaxRetriesExceeded { .. } | Self::Offline | Self::Storage(StorageError::Backend(_))
        )
    }
}

impl From<CircuitError<NetworkError>> for SyncError {
    fn from(err: CircuitError<NetworkError>) -> Self {
        match err {
            CircuitError::Open => Self::CircuitOpen,
            CircuitError::MaxRetriesExceeded { last: NetworkError::Offline, .. } => Self::Offline,
            CircuitError::MaxRetriesExceeded { attempts, last } => Self::MaxRetriesExceeded { attempts, last },
            CircuitError::Inner(e) => Self::Network(e),
        }
    }
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Constructed, run loop not started
    Created,
    /// Run loop active
    Running,
    /// Shutdown requested
    ShuttingDown,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Why a flush pass started (log and metric label).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FlushTrigger {
    Explicit,
    Reconnect,
    Foreground,
    Retry,
}

impl FlushTrigger {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Reconnect => "reconnect",
            Self::Foreground => "foreground",
            Self::Retry => "retry",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_error_mapping() {
        assert!(matches!(SyncError::from(CircuitError::Open), SyncError::CircuitOpen));
        assert!(matches!(
            SyncError::from(CircuitError::MaxRetriesExceeded { attempts: 3, last: NetworkError::Offline }),
            SyncError::Offline
        ));
        assert!(matches!(
            SyncError::from(CircuitError::MaxRetriesExceeded { attempts: 3, last: NetworkError::Timeout }),
            SyncError::MaxRetriesExceeded { attempts: 3, last: NetworkError::Timeout }
        ));
        assert!(matches!(
            SyncError::from(CircuitError::Inner(NetworkError::AuthExpired)),
            SyncError::Network(NetworkError::AuthExpired)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(SyncError::CircuitOpen.is_retryable());
        assert!(SyncError::Offline.is_retryable());
        assert!(!SyncError::SessionExpired.is_retryable());
        assert!(!SyncError::Network(NetworkError::AuthExpired).is_retryable());
    }

    #[test]
    fn test_isolation_message_names_both_owners() {
        let err = SyncError::TenantIsolationViolation {
            expected: OwnerId::new("alice"),
            found: OwnerId::new("bob"),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice") && msg.contains("bob"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CoordinatorState::Created.to_string(), "Created");
        assert_eq!(CoordinatorState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(FlushTrigger::Reconnect.as_str(), "reconnect");
    }
}
