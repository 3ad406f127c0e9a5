//! Cache correlating outbound ping keys with capture timestamps.
//!
//! Each `strm(time)` ping stores a monotonic instant under a wrapping `u32`
//! key; the client echoes the key back in its STAT `server_timestamp` field,
//! which unlocks a one-way-delay sample. The cache is bounded: once full,
//! the oldest entry is evicted.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

const DEFAULT_CAPACITY: usize = 64;

pub struct TimestampCache {
    entries: HashMap<u32, Instant>,
    order: VecDeque<u32>,
    counter: u32,
    capacity: usize,
}

impl TimestampCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            counter: 0,
            capacity: capacity.max(1),
        }
    }

    /// Store a timestamp under the next key. Keys wrap on overflow.
    pub fn create(&mut self, timestamp: Instant) -> u32 {
        self.counter = self.counter.wrapping_add(1);
        let key = self.counter;

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(key, timestamp);
        self.order.push_back(key);
        key
    }

    pub fn find(&self, key: u32) -> Option<Instant> {
        self.entries.get(&key).copied()
    }

    /// Replace an existing entry. Returns false when the key has expired.
    pub fn update(&mut self, key: u32, timestamp: Instant) -> bool {
        match self.entries.get_mut(&key) {
            Some(slot) => {
                *slot = timestamp;
                true
            }
            None => false,
        }
    }

    pub fn erase(&mut self, key: u32) {
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| *k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimestampCache {
    fn default() -> Self {
        Self::new()
    }
}
