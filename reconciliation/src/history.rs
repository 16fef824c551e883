//! Fixed-capacity append-only log

use std::collections::VecDeque;

/// Ring of the most recent entries; the oldest is evicted past capacity
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> BoundedHistory<T> {
    /// Create an empty history holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append, returning the evicted entry if full
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Newest entry
    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Up to `limit` entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<T> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Find the newest entry matching `predicate`
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<&T> {
        self.entries.iter().rev().find(|e| predicate(e))
    }

    /// Replace the newest entry matching `predicate`
    pub fn update(&mut self, predicate: impl Fn(&T) -> bool, apply: impl FnOnce(&mut T)) -> bool {
        match self.entries.iter_mut().rev().find(|e| predicate(e)) {
            Some(entry) => {
                apply(entry);
                true
            }
            None => false,
        }
    }

    /// Entries held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum entries held
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
