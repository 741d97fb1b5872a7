use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use duet_shared::protocol::SignalMessage;

/// A signal waiting to be replayed after a transient transport failure.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSignal {
    pub message: SignalMessage,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl QueuedSignal {
    pub fn new(message: SignalMessage) -> Self {
        Self {
            message,
            queued_at: Utc::now(),
            attempts: 1,
        }
    }
}

/// Bounded FIFO of signals pending replay. On overflow the oldest entry
/// is dropped.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    items: VecDeque<QueuedSignal>,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a signal; returns the entry evicted to make room, if any.
    pub fn push_back(&mut self, item: QueuedSignal) -> Option<QueuedSignal> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Put a signal back at the head after a failed replay. The re-queued
    /// entry is the oldest, so it is the one returned if the queue is full.
    pub fn push_front(&mut self, item: QueuedSignal) -> Option<QueuedSignal> {
        if self.items.len() >= self.capacity {
            return Some(item);
        }
        self.items.push_front(item);
        None
    }

    pub fn pop_front(&mut self) -> Option<QueuedSignal> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedSignal> {
        self.items.iter()
    }
}
