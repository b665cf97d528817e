//! Ordered fan-out of accepted operations to session members.
//!
//! Every member owns one bounded outbox (`mpsc`), written only by the
//! session actor, so frames reach each member in global sequence order.
//! Frames are pre-encoded once and shared as `Arc<Vec<u8>>`.
//!
//! A member whose outbox is full is evicted instead of having a frame
//! skipped: dropping its sender closes the connection, and the client
//! catches up from the log when it rejoins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// A pre-encoded server frame.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    pub frames_sent: u64,
    pub members_evicted: u64,
    pub active_members: usize,
}

/// Counters shared with session handles; updated without locks.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    frames_sent: AtomicU64,
    members_evicted: AtomicU64,
    active_members: AtomicU64,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            members_evicted: self.members_evicted.load(Ordering::Relaxed),
            active_members: self.active_members.load(Ordering::Relaxed) as usize,
        }
    }
}

/// Per-session outbox table.
pub struct Dispatcher {
    outboxes: HashMap<Uuid, mpsc::Sender<Frame>>,
    counters: Arc<DispatchCounters>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            outboxes: HashMap::new(),
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        self.counters.clone()
    }

    /// Register a member's outbox, replacing any previous one for the
    /// same user (a reconnect closes the stale connection).
    pub fn add(&mut self, user_id: Uuid, outbox: mpsc::Sender<Frame>) {
        self.outboxes.insert(user_id, outbox);
        self.sync_member_count();
    }

    /// Drop a member's outbox; its connection sees the channel close.
    pub fn remove(&mut self, user_id: &Uuid) -> bool {
        let removed = self.outboxes.remove(user_id).is_some();
        self.sync_member_count();
        removed
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.outboxes.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }

    /// Queue a frame for every member except `exclude`.
    ///
    /// Returns the members evicted because their outbox was full.
    pub fn broadcast(&mut self, frame: &Frame, exclude: Option<&Uuid>) -> Vec<Uuid> {
        let mut evicted = Vec::new();
        let mut closed = Vec::new();
        let mut sent = 0u64;

        for (user_id, outbox) in &self.outboxes {
            if Some(user_id) == exclude {
                continue;
            }
            match outbox.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => evicted.push(*user_id),
                Err(TrySendError::Closed(_)) => closed.push(*user_id),
            }
        }

        self.counters.frames_sent.fetch_add(sent, Ordering::Relaxed);
        for user_id in &evicted {
            log::warn!("Evicting {user_id}: outbox full");
            self.evict(user_id);
        }
        for user_id in &closed {
            self.remove(user_id);
        }
        evicted
    }

    /// Encode once, then [`broadcast`](Self::broadcast).
    pub fn broadcast_message(
        &mut self,
        msg: &ServerMessage,
        exclude: Option<&Uuid>,
    ) -> Result<Vec<Uuid>, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast(&frame, exclude))
    }

    /// Drop every outbox, closing all member connections.
    pub fn close_all(&mut self) -> Vec<Uuid> {
        let users: Vec<Uuid> = self.outboxes.drain().map(|(id, _)| id).collect();
        self.sync_member_count();
        users
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    fn evict(&mut self, user_id: &Uuid) {
        if self.outboxes.remove(user_id).is_some() {
            self.counters.members_evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.sync_member_count();
    }

    fn sync_member_count(&self) {
        self.counters
            .active_members
            .store(self.outboxes.len() as u64, Ordering::Relaxed);
    }
}
