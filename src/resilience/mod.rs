// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure containment for calls to the backend.
//!
//! - [`retry`]: jittered exponential backoff and the [`retry::Retryable`] seam
//! - [`circuit_breaker`]: consecutive-failure breaker wrapping the retry loop

pub mod circuit_breaker;
pub mod retry;
