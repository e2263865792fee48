// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded set of server event ids already reflected locally.
//!
//! Filled from two sides: push acknowledgements (so the realtime echo of our
//! own write is skipped) and delivered events (so a replay after reconnect is
//! skipped). Oldest ids fall out first once capacity is reached.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

use crate::record::EventId;

#[derive(Default)]
struct Window {
    set: HashSet<EventId>,
    order: VecDeque<EventId>,
}

pub struct AppliedEvents {
    window: Mutex<Window>,
    capacity: usize,
}

impl AppliedEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(Window::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&self, id: EventId) -> bool {
        let mut w = self.window.lock();
        if w.set.contains(&id) {
            return false;
        }
        if w.order.len() >= self.capacity {
            if let Some(oldest) = w.order.pop_front() {
                w.set.remove(&oldest);
            }
        }
        w.set.insert(id.clone());
        w.order.push_back(id);
        true
    }

    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.window.lock().set.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.window.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut w = self.window.lock();
        w.set.clear();
        w.order.clear();
    }
}
