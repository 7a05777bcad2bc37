//! Messages ordered by visibility timestamp.
//!
//! A [`VisibilitySet`] backs both halves of a queue: the pending set, where the
//! timestamp means "deliverable from", and the in-flight set, where it means
//! "lease expires at". Lookups by handle are O(1); ordered removal is
//! O(log n). Entries with equal timestamps leave in insertion order.

use crate::message::Message;
use std::collections::{BTreeMap, HashMap};

/// (visibility_timestamp, insertion sequence)
type SlotKey = (i64, u64);

#[derive(Debug, Default)]
pub struct VisibilitySet {
    ordered: BTreeMap<SlotKey, Message>,
    by_handle: HashMap<String, SlotKey>,
    next_seq: u64,
}

impl VisibilitySet {
    /// Insert a message, replacing any entry with the same handle.
    ///
    /// Returns the replaced entry.
    pub fn insert(&mut self, message: Message) -> Option<Message> {
        let replaced = self.remove(&message.handle);

        let key = (message.visibility_timestamp, self.next_seq);
        self.next_seq += 1;
        self.by_handle.insert(message.handle.clone(), key);
        self.ordered.insert(key, message);

        replaced
    }

    pub fn remove(&mut self, handle: &str) -> Option<Message> {
        let key = self.by_handle.remove(handle)?;
        self.ordered.remove(&key)
    }

    pub fn get(&self, handle: &str) -> Option<&Message> {
        self.by_handle
            .get(handle)
            .and_then(|key| self.ordered.get(key))
    }

    /// Message with the smallest visibility timestamp
    pub fn peek_min(&self) -> Option<&Message> {
        self.ordered.values().next()
    }

    pub fn pop_min(&mut self) -> Option<Message> {
        let (_, message) = self.ordered.pop_first()?;
        self.by_handle.remove(&message.handle);
        Some(message)
    }

    /// Pop the minimum entry only if it is visible at `now_ms`
    pub fn pop_due(&mut self, now_ms: i64) -> Option<Message> {
        match self.peek_min() {
            Some(message) if message.visibility_timestamp <= now_ms => self.pop_min(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Iterate in visibility order
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.ordered.values()
    }
}

#[cfg(test)]
#[path = "visibility_tests.rs"]
mod tests;
