// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime subscription manager.
//!
//! Each subscribed topic runs its own tokio task driving an explicit state
//! machine:
//!
//! ```text
//!                 connect ok
//!  Disconnected ──► Connecting ──────────► Connected
//!                     ▲   │ connect err        │ stream err / close
//!                     │   ▼                    ▼
//!                     └── BackingOff ◄─────────┘
//!                  (sleep or resubscribe_stalled)
//! ```
//!
//! Backoff is exponential with jitter up to a ceiling and resets after a
//! connection that stayed up for `reset_after`. Every topic remembers the
//! last delivered event id and resumes from it on reconnect.
//!
//! Events pass through the [`AppliedEvents`] window first (duplicates are
//! dropped), then through the optional [`EventSink`] (the coordinator's
//! store/cache apply), then to the topic's handlers. An event id is recorded
//! and the resume cursor advanced only once the sink has dealt with it; a
//! failed apply drops the connection and the event comes back on resume.

pub mod dedup;
pub mod transport;
pub mod ws;

pub use dedup::AppliedEvents;
pub use transport::{ChannelTransport, EventStream, Transport, TransportError};
pub use ws::WsTransport;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::record::{now_millis, ChangeEvent, EventId, OwnerId};
use crate::resilience::retry::Backoff;

/// Callback invoked for each new event on a topic.
///
/// Runs under the topic's delivery lock; it must not call back into the
/// manager for the same topic.
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// What an [`EventSink`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Local state now reflects the event; handlers run.
    Applied,
    /// Local state was already at or past this version (the echo of our own push).
    AlreadyReflected,
    /// The event must never be applied here (foreign owner, no session).
    Rejected,
    /// Local apply failed. The event is not marked delivered and is
    /// redelivered after reconnect.
    Failed,
}

/// Applies a delivered event to local state before handlers run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn apply(&self, owner: &OwnerId, event: &ChangeEvent) -> ApplyOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Disconnected,
    Connecting,
    Connected,
    BackingOff,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::BackingOff => write!(f, "backing_off"),
        }
    }
}

/// Snapshot of one topic's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub topic_id: String,
    pub status: SubscriptionStatus,
    /// Epoch millis of the last delivered event
    pub last_event_at: Option<i64>,
    pub retry_count: u32,
    /// Epoch millis of the next reconnect attempt while backing off
    pub next_retry_at: Option<i64>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("topic '{topic}' belongs to another owner")]
    OwnerMismatch { topic: String, expected: OwnerId, found: OwnerId },
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_ceiling: Duration,
    pub reset_after: Duration,
    pub jitter: f64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_ceiling: Duration::from_secs(30),
            reset_after: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// Returned by subscribe; identifies one handler on one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub owner: OwnerId,
    handler_id: u64,
}

struct Handlers {
    list: Vec<(u64, EventHandler)>,
    closed: bool,
}

struct TopicEntry {
    topic: String,
    owner: OwnerId,
    handlers: Mutex<Handlers>,
    state: Mutex<SubscriptionState>,
    cursor: Mutex<Option<EventId>>,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TopicEntry {
    fn set_status(&self, status: SubscriptionStatus) {
        let mut state = self.state.lock();
        if state.status != status {
            debug!(topic = %self.topic, from = %state.status, to = %status, "Subscription state");
        }
        state.status = status;
        if status != SubscriptionStatus::BackingOff {
            state.next_retry_at = None;
        }
    }

    fn set_backing_off(&self, delay: Duration, attempts: u32) {
        let mut state = self.state.lock();
        state.status = SubscriptionStatus::BackingOff;
        state.retry_count = attempts;
        state.next_retry_at = Some(now_millis() + delay.as_millis() as i64);
    }

    fn close(&self) {
        let mut handlers = self.handlers.lock();
        handlers.closed = true;
        handlers.list.clear();
        drop(handlers);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.set_status(SubscriptionStatus::Disconnected);
    }
}

/// Shared pieces a topic task needs.
#[derive(Clone)]
struct Delivery {
    transport: Arc<dyn Transport>,
    sink: Option<Arc<dyn EventSink>>,
    applied: Arc<AppliedEvents>,
    config: RealtimeConfig,
}

pub struct SubscriptionManager {
    delivery: Delivery,
    topics: DashMap<String, Arc<TopicEntry>>,
    next_handler_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        applied: Arc<AppliedEvents>,
        sink: Option<Arc<dyn EventSink>>,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            delivery: Delivery { transport, sink, applied, config },
            topics: DashMap::new(),
            next_handler_id: AtomicU64::new(1),
        }
    }

    /// Add `handler` to `topic`, connecting it if this is the first handler.
    pub fn subscribe(
        &self,
        owner: &OwnerId,
        topic: &str,
        handler: EventHandler,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(existing) => {
                let entry = existing.get();
                if &entry.owner != owner {
                    return Err(RealtimeError::OwnerMismatch {
                        topic: topic.to_string(),
                        expected: owner.clone(),
                        found: entry.owner.clone(),
                    });
                }
                entry.handlers.lock().list.push((handler_id, handler));
                debug!(topic, handler_id, "Handler added to existing subscription");
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(TopicEntry {
                    topic: topic.to_string(),
                    owner: owner.clone(),
                    handlers: Mutex::new(Handlers { list: vec![(handler_id, handler)], closed: false }),
                    state: Mutex::new(SubscriptionState {
                        topic_id: topic.to_string(),
                        status: SubscriptionStatus::Disconnected,
                        last_event_at: None,
                        retry_count: 0,
                        next_retry_at: None,
                    }),
                    cursor: Mutex::new(None),
                    wake: Notify::new(),
                    task: Mutex::new(None),
                });
                let task = tokio::spawn(run_topic(entry.clone(), self.delivery.clone()));
                *entry.task.lock() = Some(task);
                vacant.insert(entry);
                info!(topic, owner = %owner, "Subscribed");
            }
        }
        crate::metrics::set_active_subscriptions(self.topics.len());
        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            owner: owner.clone(),
            handler_id,
        })
    }

    /// Close `topic`. No handler runs after this returns.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let Some((_, entry)) = self.topics.remove(topic) else {
            return false;
        };
        entry.close();
        info!(topic, "Unsubscribed");
        crate::metrics::set_active_subscriptions(self.topics.len());
        true
    }

    /// Remove one handler; closes the topic when it was the last.
    pub fn unsubscribe_handler(&self, handle: &SubscriptionHandle) -> bool {
        let Some(entry) = self.topics.get(&handle.topic).map(|e| e.value().clone()) else {
            return false;
        };
        let now_empty = {
            let mut handlers = entry.handlers.lock();
            let before = handlers.list.len();
            handlers.list.retain(|(id, _)| *id != handle.handler_id);
            if handlers.list.len() == before {
                return false;
            }
            handlers.list.is_empty()
        };
        if !now_empty {
            return true;
        }
        // Emptiness is rechecked under the shard lock: a subscribe that got in
        // after the retain keeps the topic alive.
        let removed = self.topics.remove_if(&handle.topic, |_, current| {
            Arc::ptr_eq(current, &entry) && current.handlers.lock().list.is_empty()
        });
        if let Some((_, entry)) = removed {
            entry.close();
            info!(topic = %handle.topic, "Unsubscribed");
            crate::metrics::set_active_subscriptions(self.topics.len());
        }
        true
    }

    /// Close every topic of `owner`. Returns how many were closed.
    pub fn unsubscribe_owner(&self, owner: &OwnerId) -> usize {
        let topics: Vec<String> = self
            .topics
            .iter()
            .filter(|e| &e.value().owner == owner)
            .map(|e| e.key().clone())
            .collect();
        topics.iter().filter(|t| self.unsubscribe(t)).count()
    }

    /// Close everything.
    pub fn unsubscribe_all(&self) {
        let topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            self.unsubscribe(&topic);
        }
    }

    /// Wake topics that are waiting to reconnect. Returns how many were woken.
    pub fn resubscribe_stalled(&self) -> usize {
        let mut woken = 0;
        for entry in self.topics.iter() {
            let status = entry.value().state.lock().status;
            if matches!(status, SubscriptionStatus::BackingOff | SubscriptionStatus::Disconnected) {
                entry.value().wake.notify_one();
                woken += 1;
            }
        }
        if woken > 0 {
            info!(woken, "Resubscribing stalled topics");
        }
        woken
    }

    #[must_use]
    pub fn state(&self, topic: &str) -> Option<SubscriptionState> {
        self.topics.get(topic).map(|e| e.value().state.lock().clone())
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn applied_events(&self) -> &Arc<AppliedEvents> {
        &self.delivery.applied
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for entry in self.topics.iter() {
            if let Some(task) = entry.value().task.lock().take() {
                task.abort();
            }
        }
    }
}

async fn run_topic(entry: Arc<TopicEntry>, delivery: Delivery) {
    let config = &delivery.config;
    let mut backoff = Backoff::new(
        config.backoff_base,
        config.backoff_multiplier,
        config.backoff_ceiling,
        config.jitter,
    );

    loop {
        entry.set_status(SubscriptionStatus::Connecting);
        let resume = entry.cursor.lock().clone();

        match delivery.transport.connect(&entry.topic, resume.as_ref()).await {
            Ok(mut stream) => {
                let connected_at = Instant::now();
                entry.set_status(SubscriptionStatus::Connected);
                crate::metrics::record_realtime_connect(&entry.topic, "connected");
                info!(topic = %entry.topic, resume = ?resume, "Realtime connected");

                let reason = loop {
                    match stream.next_event().await {
                        Ok(Some(event)) => {
                            if !deliver(&entry, &delivery, event).await {
                                break "local apply failed".to_string();
                            }
                        }
                        Ok(None) => break "closed by server".to_string(),
                        Err(e) => break e.to_string(),
                    }
                };
                warn!(topic = %entry.topic, reason = %reason, "Realtime connection lost");

                if connected_at.elapsed() >= config.reset_after {
                    backoff.reset();
                }
            }
            Err(e) => {
                warn!(topic = %entry.topic, error = %e, "Realtime connect failed");
                crate::metrics::record_realtime_connect(&entry.topic, "failed");
            }
        }

        let delay = backoff.next_delay();
        entry.set_backing_off(delay, backoff.attempts());
        debug!(topic = %entry.topic, ?delay, attempt = backoff.attempts(), "Backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = entry.wake.notified() => {
                debug!(topic = %entry.topic, "Woken early");
            }
        }
    }
}

/// Returns false when the sink failed; the caller reconnects so the event is
/// replayed from the cursor.
async fn deliver(entry: &TopicEntry, delivery: &Delivery, event: ChangeEvent) -> bool {
    if delivery.applied.contains(&event.event_id) {
        debug!(topic = %entry.topic, event_id = %event.event_id, "Duplicate event skipped");
        crate::metrics::record_realtime_event("duplicate");
        // Cursor moves for duplicates too so a resume never replays them again
        *entry.cursor.lock() = Some(event.event_id);
        return true;
    }

    if let Some(sink) = &delivery.sink {
        match sink.apply(&entry.owner, &event).await {
            ApplyOutcome::Applied => {}
            ApplyOutcome::AlreadyReflected => {
                debug!(topic = %entry.topic, event_id = %event.event_id, "Event already reflected locally");
                crate::metrics::record_realtime_event("echo");
                mark_delivered(entry, delivery, &event);
                return true;
            }
            ApplyOutcome::Rejected => {
                crate::metrics::record_realtime_event("rejected");
                mark_delivered(entry, delivery, &event);
                return true;
            }
            ApplyOutcome::Failed => {
                warn!(topic = %entry.topic, event_id = %event.event_id, "Local apply failed, event will be redelivered");
                crate::metrics::record_realtime_event("apply_failed");
                return false;
            }
        }
    }

    mark_delivered(entry, delivery, &event);
    {
        let handlers = entry.handlers.lock();
        if handlers.closed {
            return true;
        }
        for (_, handler) in handlers.list.iter() {
            handler(&event);
        }
    }
    entry.state.lock().last_event_at = Some(now_millis());
    crate::metrics::record_realtime_event("delivered");
    true
}

fn mark_delivered(entry: &TopicEntry, delivery: &Delivery, event: &ChangeEvent) {
    delivery.applied.insert(event.event_id.clone());
    *entry.cursor.lock() = Some(event.event_id.clone());
}
