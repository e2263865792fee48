// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Slab-backed intrusive LRU list.
//!
//! Nodes live in a `Vec` and link to each other by index; a `HashMap` maps
//! keys to slots. Every operation is O(1): no scans, no per-node allocation
//! once the slab has grown. Freed slots are recycled through a free list.

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruList<K, V> {
    slab: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
}

impl<K, V> Default for LruList<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LruList<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            slab: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    fn node(&self, slot: usize) -> Option<&Node<K, V>> {
        self.slab.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<K, V>> {
        self.slab.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.node_mut(h) {
                n.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Peek without changing recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.node(slot).map(|n| &n.value)
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
        self.node(slot).map(|n| &n.value)
    }

    /// Insert or replace, making the entry most recently used.
    /// Returns the replaced value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&slot) = self.index.get(&key) {
            self.unlink(slot);
            self.push_front(slot);
            return self.node_mut(slot).map(|n| std::mem::replace(&mut n.value, value));
        }

        let node = Node { key: key.clone(), value, prev: None, next: None };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slab[slot] = Some(node);
                slot
            }
            None => {
                self.slab.push(Some(node));
                self.slab.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        let node = self.slab.get_mut(slot).and_then(Option::take)?;
        self.free.push(slot);
        Some(node.value)
    }

    /// Remove and return the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let slot = self.tail?;
        self.unlink(slot);
        let node = self.slab.get_mut(slot).and_then(Option::take)?;
        self.index.remove(&node.key);
        self.free.push(slot);
        Some((node.key, node.value))
    }

    /// Keys from least to most recently used.
    pub fn keys_lru_first(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.tail;
        while let Some(slot) = cursor {
            match self.node(slot) {
                Some(n) => {
                    keys.push(n.key.clone());
                    cursor = n.prev;
                }
                None => break,
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_order() {
        let mut lru = LruList::new();
        lru.insert("a", 1);
        lru.insert("b", 2);
        lru.insert("c", 3);
        assert_eq!(lru.keys_lru_first(), vec!["a", "b", "c"]);

        lru.get(&"a");
        assert_eq!(lru.keys_lru_first(), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut lru = LruList::new();
        lru.insert("a", 1);
        lru.insert("b", 2);
        assert_eq!(lru.peek(&"a"), Some(&1));
        assert_eq!(lru.keys_lru_first(), vec!["a", "b"]);
    }

    #[test]
    fn test_replace_returns_old_and_promotes() {
        let mut lru = LruList::new();
        lru.insert("a", 1);
        lru.insert("b", 2);
        assert_eq!(lru.insert("a", 10), Some(1));
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.keys_lru_first(), vec!["b", "a"]);
    }

    #[test]
    fn test_pop_lru_and_slot_reuse() {
        let mut lru = LruList::new();
        lru.insert("a", 1);
        lru.insert("b", 2);
        assert_eq!(lru.pop_lru(), Some(("a", 1)));
        lru.insert("c", 3);
        assert_eq!(lru.slab.len(), 2);
        assert_eq!(lru.keys_lru_first(), vec!["b", "c"]);
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut lru = LruList::new();
        for (k, v) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            lru.insert(k, v);
        }
        assert_eq!(lru.remove(&"b"), Some(2));
        assert_eq!(lru.remove(&"d"), Some(4));
        assert_eq!(lru.remove(&"a"), Some(1));
        assert_eq!(lru.keys_lru_first(), vec!["c"]);
        assert_eq!(lru.remove(&"c"), Some(3));
        assert!(lru.is_empty());
        assert!(lru.pop_lru().is_none());
        assert!(lru.remove(&"zz").is_none());
    }
}
