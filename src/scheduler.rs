//! Monotonic timer queue
//!
//! All countdowns, debounce windows and auto-dismiss timers go through a
//! `TimerQueue`. The queue does not own a thread: the caller advances time by
//! calling `poll(now_ms)`, and teardown is a single `cancel_all()`.
//!
//! Timers due at the same instant fire in the order they were scheduled.

use std::collections::BTreeMap;

/// Handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone)]
pub struct TimerQueue<K> {
    timers: BTreeMap<(u64, u64), K>,
    next_seq: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `key` to fire once `now_ms >= deadline_ms`
    pub fn schedule(&mut self, deadline_ms: u64, key: K) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert((deadline_ms, seq), key);
        TimerId(seq)
    }

    /// Cancel a timer; returns its key if it had not fired yet
    pub fn cancel(&mut self, id: TimerId) -> Option<K> {
        let slot = self
            .timers
            .keys()
            .find(|(_, seq)| *seq == id.0)
            .copied()?;
        self.timers.remove(&slot)
    }

    /// Cancel every timer whose key matches the predicate
    pub fn cancel_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let before = self.timers.len();
        self.timers.retain(|_, key| !predicate(key));
        before - self.timers.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.timers.len();
        self.timers.clear();
        count
    }

    /// Remove and return every timer due at `now_ms`, earliest first
    pub fn poll(&mut self, now_ms: u64) -> Vec<K> {
        let pending = self.timers.split_off(&(now_ms.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.timers, pending);
        due.into_values().collect()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Deadline of the first timer whose key matches the predicate
    pub fn deadline_where<F>(&self, mut predicate: F) -> Option<u64>
    where
        F: FnMut(&K) -> bool,
    {
        self.timers
            .iter()
            .find(|(_, key)| predicate(key))
            .map(|((deadline, _), _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
