// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `component`: store, network, cache
//! - `operation`: get, put, delete, drain
//! - `status` / `outcome`: success, error, rejected, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record operation latency for a component
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLINE STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Record an offline store operation
pub fn record_store_op(operation: &str, status: &str) {
    counter!(
        "offline_sync_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record offline store latency
pub fn record_store_latency(operation: &str, duration: Duration) {
    record_latency("store", operation, duration);
}

/// A blob failed authentication or decoding and was treated as missing
pub fn record_decryption_failure() {
    counter!("offline_sync_decryption_failures_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record eviction event
pub fn record_eviction(count: usize, bytes: usize) {
    counter!("offline_sync_cache_evictions_total").increment(count as u64);
    counter!("offline_sync_cache_evicted_bytes_total").increment(bytes as u64);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("offline_sync_cache_entries").set(count as f64);
}

/// Set current cache payload size in bytes
pub fn set_cache_bytes(bytes: usize) {
    gauge!("offline_sync_cache_bytes").set(bytes as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "offline_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "offline_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTIVITY & REALTIME
// ═══════════════════════════════════════════════════════════════════════════

/// Set reachability (1 = online, 0 = offline)
pub fn set_online(online: bool) {
    gauge!("offline_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Record a realtime connection attempt
pub fn record_realtime_connect(topic: &str, outcome: &str) {
    counter!(
        "offline_sync_realtime_connects_total",
        "topic" => topic.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a realtime event by disposition (delivered, duplicate, echo, rejected, apply_failed, decode_error)
pub fn record_realtime_event(kind: &str) {
    counter!(
        "offline_sync_realtime_events_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Set number of subscribed topics
pub fn set_active_subscriptions(count: usize) {
    gauge!("offline_sync_active_subscriptions").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Record a read by the layer that answered it (cache, store, network, miss)
pub fn record_read(source: &str, duration: Duration) {
    counter!(
        "offline_sync_reads_total",
        "source" => source.to_string()
    )
    .increment(1);
    record_latency("coordinator", "read", duration);
}

/// Record a local write
pub fn record_write(status: &str) {
    counter!(
        "offline_sync_writes_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a flush pass outcome
pub fn record_flush(trigger: &str, outcome: &str) {
    counter!(
        "offline_sync_flushes_total",
        "trigger" => trigger.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record flush pass duration
pub fn record_flush_latency(duration: Duration) {
    histogram!("offline_sync_flush_seconds").record(duration.as_secs_f64());
}

/// Record how a pending write was resolved
pub fn record_resolution(resolution: &str) {
    counter!(
        "offline_sync_resolutions_total",
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

/// Record a refused cross-owner access
pub fn record_isolation_violation() {
    counter!("offline_sync_isolation_violations_total").increment(1);
}

/// Record a login or logout
pub fn record_session(event: &str) {
    counter!(
        "offline_sync_sessions_total",
        "event" => event.to_string()
    )
    .increment(1);
}

/// RAII latency timer; records on drop.
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed, so these only verify the calls don't panic.

    #[test]
    fn test_store_metrics() {
        record_store_op("put", "success");
        record_store_latency("get", Duration::from_micros(80));
        record_decryption_failure();
    }

    #[test]
    fn test_cache_metrics() {
        record_eviction(10, 4096);
        set_cache_entries(90);
        set_cache_bytes(1 << 20);
    }

    #[test]
    fn test_resilience_and_realtime_metrics() {
        set_circuit_state("backend", 2);
        record_circuit_call("backend", "rejected");
        set_online(false);
        record_realtime_connect("conv-1", "connected");
        record_realtime_event("duplicate");
        set_active_subscriptions(3);
    }

    #[test]
    fn test_coordinator_metrics() {
        record_read("cache", Duration::from_micros(5));
        record_write("queued");
        record_flush("explicit", "complete");
        record_flush_latency(Duration::from_millis(40));
        record_resolution("server_wins");
        record_isolation_violation();
        record_session("login");
    }

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new("store", "drain");
        std::thread::sleep(Duration::from_millis(1));
        drop(timer);
    }
}
