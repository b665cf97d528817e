//! Bounded buffer of accepted entries awaiting persistence.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 WriteBuffer                   │
//! │                                              │
//! │  pending: [ e(n) | e(n+1) | ... ]  ≤ max     │
//! │                                              │
//! │  push         after every accepted op       │
//! │  entries      handed to append_operations   │
//! │  mark_flushed once the store confirmed      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! While the store is healthy the buffer holds at most one entry between
//! push and flush. While it is down, entries accumulate here until the
//! bound is reached and the session has to drain.

use std::time::{Duration, Instant};
use thiserror::Error;

use crate::oplog::LogEntry;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PendingError {
    #[error("Write buffer full ({capacity} entries pending)")]
    Overflow { capacity: usize },
}

pub struct WriteBuffer {
    capacity: usize,
    pending: Vec<LogEntry>,
    last_flush: Instant,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Queue an entry; fails without queuing when the buffer is full.
    pub fn push(&mut self, entry: LogEntry) -> Result<(), PendingError> {
        if self.is_full() {
            return Err(PendingError::Overflow { capacity: self.capacity });
        }
        self.pending.push(entry);
        Ok(())
    }

    /// Pending entries in sequence order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.pending
    }

    /// Drop everything pending after the store accepted it.
    pub fn mark_flushed(&mut self) {
        self.pending.clear();
        self.last_flush = Instant::now();
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Time since the store last confirmed a write.
    pub fn time_since_flush(&self) -> Duration {
        self.last_flush.elapsed()
    }
}
