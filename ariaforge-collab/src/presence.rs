//! Ephemeral cursor presence for one session.
//!
//! ## Architecture
//!
//! ```text
//! PresenceUpdate (connection task)
//!       │
//!       ▼
//! PresenceTracker::update()
//!       │  rate-limited per user (presence_interval, 33ms)
//!       ├── inside interval ──► stored, marked dirty
//!       ▼                            │
//! broadcast::Sender<PresenceFrame>   │ tick: flush_dirty()
//!       │  ◄─────────────────────────┘
//!       ▼
//! every connection task (skips its own frames)
//! ```
//!
//! Presence bypasses the sequencer and is never persisted. Only the newest
//! cursor per user matters, so a lagging receiver simply loses old frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::protocol::{Cursor, ServerMessage};

/// An encoded presence frame plus the user it describes.
#[derive(Debug, Clone)]
pub struct PresenceFrame {
    pub origin: Uuid,
    pub frame: Frame,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    cursor: Cursor,
    last_seen: Instant,
    last_published: Option<Instant>,
    dirty: bool,
}

impl PresenceEntry {
    fn new() -> Self {
        Self {
            cursor: Cursor::default(),
            last_seen: Instant::now(),
            last_published: None,
            dirty: false,
        }
    }
}

/// Latest cursor per connected user.
pub struct PresenceTracker {
    entries: Mutex<HashMap<Uuid, PresenceEntry>>,
    sender: broadcast::Sender<PresenceFrame>,
    interval: Duration,
}

impl PresenceTracker {
    /// `capacity` frames are buffered per receiver before the oldest are
    /// dropped; `interval` is the minimum spacing of one user's updates.
    pub fn new(capacity: usize, interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: Mutex::new(HashMap::new()),
            sender,
            interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceFrame> {
        self.sender.subscribe()
    }

    /// Create an entry for a user who just joined.
    pub fn join(&self, user_id: Uuid) {
        self.entries().entry(user_id).or_insert_with(PresenceEntry::new).last_seen = Instant::now();
    }

    /// Record a cursor. Publishes immediately unless the user published
    /// within the interval, in which case the cursor waits for
    /// [`flush_dirty`](Self::flush_dirty). Returns whether it was published.
    pub fn update(&self, user_id: Uuid, cursor: Cursor) -> bool {
        let now = Instant::now();
        let publish = {
            let mut entries = self.entries();
            let entry = entries.entry(user_id).or_insert_with(PresenceEntry::new);
            entry.cursor = cursor.clone();
            entry.last_seen = now;
            let due = entry
                .last_published
                .map_or(true, |at| now.duration_since(at) >= self.interval);
            if due {
                entry.last_published = Some(now);
                entry.dirty = false;
            } else {
                entry.dirty = true;
            }
            due
        };

        if publish {
            self.publish(user_id, cursor);
        } else {
            log::trace!("Presence of {user_id} coalesced");
        }
        publish
    }

    /// Refresh `last_seen` without changing the cursor (heartbeat).
    pub fn touch(&self, user_id: &Uuid) {
        if let Some(entry) = self.entries().get_mut(user_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Forget a user and tell everyone else. Returns whether it was tracked.
    pub fn remove(&self, user_id: &Uuid) -> bool {
        let removed = self.entries().remove(user_id).is_some();
        if removed {
            self.publish_left(*user_id);
        }
        removed
    }

    /// Publish the newest cursor of every user whose update was coalesced
    /// and whose interval has passed. Returns the number published.
    pub fn flush_dirty(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(Uuid, Cursor)> = {
            let mut entries = self.entries();
            entries
                .iter_mut()
                .filter(|(_, e)| {
                    e.dirty && e.last_published.map_or(true, |at| now.duration_since(at) >= self.interval)
                })
                .map(|(id, e)| {
                    e.dirty = false;
                    e.last_published = Some(now);
                    (*id, e.cursor.clone())
                })
                .collect()
        };

        let count = due.len();
        for (user_id, cursor) in due {
            self.publish(user_id, cursor);
        }
        count
    }

    /// Drop entries silent for longer than `timeout`. Returns the removed users.
    pub fn sweep(&self, timeout: Duration) -> Vec<Uuid> {
        let stale: Vec<Uuid> = {
            let mut entries = self.entries();
            let stale: Vec<Uuid> = entries
                .iter()
                .filter(|(_, e)| e.last_seen.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                entries.remove(id);
            }
            stale
        };

        for user_id in &stale {
            log::debug!("Presence of {user_id} timed out");
            self.publish_left(*user_id);
        }
        stale
    }

    /// Current cursor of every tracked user.
    pub fn snapshot(&self) -> Vec<(Uuid, Cursor)> {
        self.entries()
            .iter()
            .map(|(id, e)| (*id, e.cursor.clone()))
            .collect()
    }

    pub fn cursor(&self, user_id: &Uuid) -> Option<Cursor> {
        self.entries().get(user_id).map(|e| e.cursor.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop every entry without announcing anything (session ended).
    pub fn clear(&self) {
        self.entries().clear();
    }

    fn publish(&self, user_id: Uuid, cursor: Cursor) {
        self.send(user_id, &ServerMessage::PresenceBroadcast { user_id, cursor });
    }

    fn publish_left(&self, user_id: Uuid) {
        self.send(user_id, &ServerMessage::PresenceLeft { user_id });
    }

    fn send(&self, origin: Uuid, msg: &ServerMessage) {
        match msg.encode() {
            Ok(bytes) => {
                // No receivers is fine: presence is best-effort.
                let _ = self.sender.send(PresenceFrame { origin, frame: Arc::new(bytes) });
            }
            Err(e) => log::warn!("Failed to encode presence for {origin}: {e}"),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, PresenceEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn decode(frame: &PresenceFrame) -> ServerMessage {
        ServerMessage::decode(&frame.frame).unwrap()
    }

    #[tokio::test]
    async fn test_first_update_publishes() {
        let tracker = PresenceTracker::new(16, Duration::from_millis(33));
        let mut rx = tracker.subscribe();
        let alice = Uuid::new_v4();

        assert!(tracker.update(alice, Cursor::at(4.0)));
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, alice);
        assert_eq!(
            decode(&frame),
            ServerMessage::PresenceBroadcast { user_id: alice, cursor: Cursor::at(4.0) }
        );
    }

    #[tokio::test]
    async fn test_rapid_updates_coalesce() {
        let tracker = PresenceTracker::new(16, Duration::from_secs(60));
        let mut rx = tracker.subscribe();
        let alice = Uuid::new_v4();

        assert!(tracker.update(alice, Cursor::at(1.0)));
        assert!(!tracker.update(alice, Cursor::at(2.0)));
        assert!(!tracker.update(alice, Cursor::at(3.0)));
        rx.recv().await.unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // Still inside the interval: nothing to flush yet.
        assert_eq!(tracker.flush_dirty(), 0);
        assert_eq!(tracker.cursor(&alice), Some(Cursor::at(3.0)));
    }

    #[tokio::test]
    async fn test_flush_publishes_newest() {
        let tracker = PresenceTracker::new(16, Duration::from_millis(10));
        let mut rx = tracker.subscribe();
        let alice = Uuid::new_v4();

        tracker.update(alice, Cursor::at(1.0));
        tracker.update(alice, Cursor::at(2.0));
        tracker.update(alice, Cursor::at(3.0));
        rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.flush_dirty(), 1);
        assert_eq!(
            decode(&rx.recv().await.unwrap()),
            ServerMessage::PresenceBroadcast { user_id: alice, cursor: Cursor::at(3.0) }
        );
        assert_eq!(tracker.flush_dirty(), 0);
    }

    #[tokio::test]
    async fn test_remove_announces_left() {
        let tracker = PresenceTracker::new(16, Duration::ZERO);
        let alice = Uuid::new_v4();
        tracker.join(alice);
        let mut rx = tracker.subscribe();

        assert!(tracker.remove(&alice));
        assert_eq!(decode(&rx.recv().await.unwrap()), ServerMessage::PresenceLeft { user_id: alice });
        assert!(!tracker.remove(&alice));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_silent_users() {
        let tracker = PresenceTracker::new(16, Duration::ZERO);
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        tracker.join(quiet);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.update(chatty, Cursor::at(0.5));

        let swept = tracker.sweep(Duration::from_millis(20));
        assert_eq!(swept, vec![quiet]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.snapshot()[0].0, chatty);
    }

    #[tokio::test]
    async fn test_lagging_receiver_drops_old_frames() {
        let tracker = PresenceTracker::new(2, Duration::ZERO);
        let mut rx = tracker.subscribe();
        for i in 0..5 {
            tracker.update(Uuid::new_v4(), Cursor::at(i as f64));
        }
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        assert!(rx.recv().await.is_ok());
    }
}
