//! In-memory session store with failure injection.
//!
//! Used by tests and by servers started without a storage path. Failures can
//! be switched on per call family to drive degraded-mode and drain paths.

use ariaforge_core::Document;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{SessionStore, StoreError};
use crate::oplog::LogEntry;

#[derive(Default)]
struct State {
    documents: HashMap<Uuid, Document>,
    snapshots: HashMap<Uuid, (u64, Document)>,
    operations: HashMap<Uuid, BTreeMap<u64, LogEntry>>,
    flushes: HashMap<Uuid, u64>,
    /// Sessions whose stored log no longer reads back
    unreadable_logs: HashSet<Uuid>,
    unreadable_snapshots: HashSet<Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_appends: AtomicBool,
    fail_flushes: AtomicBool,
    fail_loads: AtomicBool,
    flush_attempts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `append_operations` and `save_snapshot` fail.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::SeqCst);
    }

    /// Make every load fail.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Successful flushes of a session.
    pub fn flush_count(&self, session_id: Uuid) -> u64 {
        self.lock()
            .map(|state| state.flushes.get(&session_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Flush calls across all sessions, failed ones included.
    pub fn flush_attempts(&self) -> u64 {
        self.flush_attempts.load(Ordering::SeqCst)
    }

    /// Stored entries of a session, in order.
    pub fn stored_operations(&self, session_id: Uuid) -> Vec<LogEntry> {
        self.lock()
            .map(|state| {
                state
                    .operations
                    .get(&session_id)
                    .map(|ops| ops.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Write entries as-is, bypassing any check.
    pub fn inject_operations(&self, session_id: Uuid, entries: Vec<LogEntry>) {
        if let Ok(mut state) = self.lock() {
            let ops = state.operations.entry(session_id).or_default();
            for entry in entries {
                ops.insert(entry.global_seq, entry);
            }
        }
    }

    /// Make the session's stored log unreadable until it is truncated,
    /// as if its bytes were damaged on disk.
    pub fn corrupt_log(&self, session_id: Uuid) {
        if let Ok(mut state) = self.lock() {
            state.unreadable_logs.insert(session_id);
        }
    }

    /// Make the session's snapshot unreadable until it is rewritten.
    pub fn corrupt_snapshot(&self, session_id: Uuid) {
        if let Ok(mut state) = self.lock() {
            state.unreadable_snapshots.insert(session_id);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected {what} failure")));
        }
        Ok(())
    }
}

impl SessionStore for MemoryStore {
    fn load_document(&self, project_id: Uuid) -> Result<Document, StoreError> {
        Self::check(&self.fail_loads, "load")?;
        let state = self.lock()?;
        Ok(state
            .documents
            .get(&project_id)
            .cloned()
            .unwrap_or_else(|| Document::new(project_id)))
    }

    fn append_operations(&self, session_id: Uuid, entries: &[LogEntry]) -> Result<(), StoreError> {
        Self::check(&self.fail_appends, "append")?;
        let mut state = self.lock()?;
        let ops = state.operations.entry(session_id).or_default();
        for entry in entries {
            ops.insert(entry.global_seq, entry.clone());
        }
        Ok(())
    }

    fn load_operations_since(&self, session_id: Uuid, seq: u64) -> Result<Vec<LogEntry>, StoreError> {
        Self::check(&self.fail_loads, "load")?;
        let state = self.lock()?;
        if state.unreadable_logs.contains(&session_id) {
            return Err(StoreError::Corrupted(format!("log of session {session_id}")));
        }
        Ok(state
            .operations
            .get(&session_id)
            .map(|ops| ops.range(seq.saturating_add(1)..).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    fn load_snapshot(&self, session_id: Uuid) -> Result<Option<(u64, Document)>, StoreError> {
        Self::check(&self.fail_loads, "load")?;
        let state = self.lock()?;
        if state.unreadable_snapshots.contains(&session_id) {
            return Err(StoreError::Corrupted(format!("snapshot of session {session_id}")));
        }
        Ok(state.snapshots.get(&session_id).cloned())
    }

    fn save_snapshot(&self, session_id: Uuid, seq: u64, document: &Document) -> Result<(), StoreError> {
        Self::check(&self.fail_appends, "snapshot")?;
        let mut state = self.lock()?;
        state.unreadable_snapshots.remove(&session_id);
        state.snapshots.insert(session_id, (seq, document.clone()));
        if let Some(ops) = state.operations.get_mut(&session_id) {
            ops.retain(|s, _| *s > seq);
        }
        Ok(())
    }

    fn truncate_operations(&self, session_id: Uuid, after_seq: u64) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.unreadable_logs.remove(&session_id);
        if let Some(ops) = state.operations.get_mut(&session_id) {
            ops.retain(|s, _| *s <= after_seq);
        }
        Ok(())
    }

    fn flush(&self, session_id: Uuid, project_id: Uuid, _seq: u64, document: &Document) -> Result<(), StoreError> {
        self.flush_attempts.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_flushes, "flush")?;
        let mut state = self.lock()?;
        state.documents.insert(project_id, document.clone());
        state.snapshots.remove(&session_id);
        state.operations.remove(&session_id);
        state.unreadable_logs.remove(&session_id);
        state.unreadable_snapshots.remove(&session_id);
        *state.flushes.entry(session_id).or_default() += 1;
        Ok(())
    }
}
