// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push transport seam and the in-process channel hub.
//!
//! A [`Transport`] opens one [`EventStream`] per topic. `connect` takes the
//! id of the last event the client saw so the server can replay what was
//! missed while disconnected.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::record::{ChangeEvent, EventId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("undecodable frame: {0}")]
    Decode(String),
}

/// One live topic connection.
#[async_trait]
pub trait EventStream: Send {
    /// Next event in transport order. `Ok(None)` means the server closed cleanly.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        topic: &str,
        resume_after: Option<&EventId>,
    ) -> Result<Box<dyn EventStream>, TransportError>;
}

const TOPIC_BUFFER: usize = 256;

struct TopicLog {
    events: Vec<ChangeEvent>,
    tx: broadcast::Sender<ChangeEvent>,
}

impl TopicLog {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(TOPIC_BUFFER);
        Self { events: Vec::new(), tx }
    }
}

struct Hub {
    topics: Mutex<HashMap<String, TopicLog>>,
    available: AtomicBool,
    drops: watch::Sender<u64>,
    connects: AtomicU64,
}

/// In-process push server.
///
/// Keeps every published event per topic so reconnecting clients can resume.
/// Clones share the hub.
#[derive(Clone)]
pub struct ChannelTransport {
    hub: Arc<Hub>,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    pub fn new() -> Self {
        let (drops, _) = watch::channel(0);
        Self {
            hub: Arc::new(Hub {
                topics: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                drops,
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Append to the topic log and fan out to live connections.
    pub fn publish(&self, event: ChangeEvent) {
        let mut topics = self.hub.topics.lock();
        let log = topics.entry(event.topic.clone()).or_insert_with(TopicLog::new);
        log.events.push(event.clone());
        let _ = log.tx.send(event);
    }

    /// Sever every live connection (network flap).
    pub fn drop_connections(&self) {
        self.hub.drops.send_modify(|n| *n += 1);
        debug!("Channel hub dropped all connections");
    }

    /// While unavailable, `connect` fails.
    pub fn set_available(&self, available: bool) {
        self.hub.available.store(available, Ordering::Release);
        if !available {
            self.drop_connections();
        }
    }

    /// Successful connects so far
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.hub.connects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn published(&self, topic: &str) -> usize {
        self.hub.topics.lock().get(topic).map_or(0, |l| l.events.len())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(
        &self,
        topic: &str,
        resume_after: Option<&EventId>,
    ) -> Result<Box<dyn EventStream>, TransportError> {
        if !self.hub.available.load(Ordering::Acquire) {
            return Err(TransportError::Connect("hub unavailable".to_string()));
        }
        let mut drops = self.hub.drops.subscribe();
        drops.borrow_and_update();

        let mut topics = self.hub.topics.lock();
        let log = topics.entry(topic.to_string()).or_insert_with(TopicLog::new);
        // Backlog and live receiver taken under one lock: no gap, no overlap
        let backlog: VecDeque<ChangeEvent> = match resume_after {
            Some(id) => match log.events.iter().position(|e| &e.event_id == id) {
                Some(pos) => log.events[pos + 1..].iter().cloned().collect(),
                None => log.events.iter().cloned().collect(),
            },
            None => VecDeque::new(),
        };
        let rx = log.tx.subscribe();
        drop(topics);

        self.hub.connects.fetch_add(1, Ordering::Relaxed);
        debug!(topic, backlog = backlog.len(), "Channel connection opened");
        Ok(Box::new(ChannelStream { backlog, rx, drops }))
    }
}

struct ChannelStream {
    backlog: VecDeque<ChangeEvent>,
    rx: broadcast::Receiver<ChangeEvent>,
    drops: watch::Receiver<u64>,
}

#[async_trait]
impl EventStream for ChannelStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, TransportError> {
        if self.drops.has_changed().unwrap_or(true) {
            return Err(TransportError::Disconnected("dropped by hub".to_string()));
        }
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        tokio::select! {
            biased;
            _ = self.drops.changed() => Err(TransportError::Disconnected("dropped by hub".to_string())),
            received = self.rx.recv() => match received {
                Ok(event) => Ok(Some(event)),
                Err(broadcast::error::RecvError::Closed) => Ok(None),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    Err(TransportError::Disconnected(format!("lagged by {} events", n)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OwnerId, RecordKey};

    fn event(topic: &str, n: u32) -> ChangeEvent {
        ChangeEvent {
            event_id: EventId::new(format!("e{}", n)),
            topic: topic.to_string(),
            key: RecordKey::new(OwnerId::new("o"), "doc", format!("d{}", n)),
            version: n as u64,
            payload: Some(vec![n as u8]),
        }
    }

    #[tokio::test]
    async fn test_live_delivery() {
        let hub = ChannelTransport::new();
        let mut stream = hub.connect("t", None).await.unwrap();
        hub.publish(event("t", 1));
        assert_eq!(stream.next_event().await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_resume_replays_missed() {
        let hub = ChannelTransport::new();
        for n in 1..=4 {
            hub.publish(event("t", n));
        }
        let mut stream = hub.connect("t", Some(&EventId::new("e2"))).await.unwrap();
        assert_eq!(stream.next_event().await.unwrap().unwrap().version, 3);
        assert_eq!(stream.next_event().await.unwrap().unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_drop_and_unavailable() {
        let hub = ChannelTransport::new();
        let mut stream = hub.connect("t", None).await.unwrap();
        hub.drop_connections();
        assert!(matches!(stream.next_event().await, Err(TransportError::Disconnected(_))));

        hub.set_available(false);
        assert!(hub.connect("t", None).await.is_err());
        hub.set_available(true);
        assert!(hub.connect("t", None).await.is_ok());
        assert_eq!(hub.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_topics_are_separate() {
        let hub = ChannelTransport::new();
        hub.publish(event("a", 1));
        hub.publish(event("b", 2));
        assert_eq!(hub.published("a"), 1);
        assert_eq!(hub.published("b"), 1);
        assert_eq!(hub.published("c"), 0);
    }
}
