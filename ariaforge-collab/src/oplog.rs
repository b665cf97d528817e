//! Append-only operation log with snapshot compaction.
//!
//! Architecture:
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    OperationLog                         │
//! │                                                        │
//! │  base (Document @ base_seq) ◄── e(base+1) ◄── … ◄── e(head) │
//! │                                                        │
//! │  since(s)   : base_seq <= s <= head → entries after s  │
//! │  compact(n) : fold entries <= n into a new base        │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The base is an immutable document version, so compaction is a replay of
//! the folded prefix on top of it. Every entry carries a checksum over its
//! sequence number and encoded operation; [`OperationLog::restore`] uses it
//! to find the last trustworthy prefix of a stored log.

use ariaforge_core::{ApplyError, Document, Operation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{self, SequencedOperation};

/// Retention configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Entries retained before compaction becomes due. Default: 1000.
    pub max_retained_ops: usize,
    /// Entries kept after compaction. Default: 200.
    pub min_retained_ops: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_retained_ops: 1000,
            min_retained_ops: 200,
        }
    }
}

impl LogConfig {
    /// Config for testing (tiny window so compaction is easy to reach).
    pub fn for_testing() -> Self {
        Self {
            max_retained_ops: 8,
            min_retained_ops: 2,
        }
    }
}

/// Log errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("Sequence {requested} was compacted (log starts at {base})")]
    Compacted { requested: u64, base: u64 },
    #[error("Sequence {requested} is ahead of the log head {head}")]
    AheadOfHead { requested: u64, head: u64 },
    #[error("Gap in log: expected sequence {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
    #[error("Checksum mismatch at sequence {seq}")]
    ChecksumMismatch { seq: u64 },
    #[error("Operation at sequence {seq} cannot be replayed: {source}")]
    Replay { seq: u64, source: ApplyError },
    #[error("Log entry encoding failed: {0}")]
    Encoding(String),
}

/// A single accepted operation as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub global_seq: u64,
    pub operation: Operation,
    /// FNV-1a over the sequence number and encoded operation
    pub checksum: u32,
}

impl LogEntry {
    pub fn new(global_seq: u64, operation: Operation) -> Result<Self, LogError> {
        let checksum = Self::compute_checksum(global_seq, &operation)?;
        Ok(Self { global_seq, operation, checksum })
    }

    /// Verify the entry's checksum.
    pub fn verify(&self) -> bool {
        Self::compute_checksum(self.global_seq, &self.operation)
            .map(|expected| expected == self.checksum)
            .unwrap_or(false)
    }

    fn compute_checksum(global_seq: u64, operation: &Operation) -> Result<u32, LogError> {
        let bytes = protocol::encode(operation).map_err(|e| LogError::Encoding(e.to_string()))?;
        let mut hash: u32 = 0x811c_9dc5;
        for byte in global_seq.to_le_bytes().iter().chain(bytes.iter()) {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        Ok(hash)
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        protocol::encode(self).map_err(|e| LogError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        protocol::decode(bytes).map_err(|e| LogError::Encoding(e.to_string()))
    }

    pub fn sequenced(&self) -> SequencedOperation {
        SequencedOperation {
            global_seq: self.global_seq,
            operation: self.operation.clone(),
        }
    }
}

/// Result of rebuilding a log from stored entries.
#[derive(Debug)]
pub struct Restored {
    pub log: OperationLog,
    /// Document at the log head
    pub document: Document,
    /// First problem found; entries from that point on were discarded
    pub error: Option<LogError>,
}

/// Per-session operation log.
#[derive(Debug, Clone)]
pub struct OperationLog {
    config: LogConfig,
    /// Document at `base_seq`
    base: Document,
    entries: VecDeque<LogEntry>,
    /// Operation ID → sequence, for the retained window
    ids: HashMap<Uuid, u64>,
}

impl OperationLog {
    /// An empty log on top of `base`; the first entry gets `base.version() + 1`.
    pub fn new(base: Document, config: LogConfig) -> Self {
        Self {
            config,
            base,
            entries: VecDeque::new(),
            ids: HashMap::new(),
        }
    }

    /// Rebuild a log from stored entries, keeping the longest prefix that is
    /// contiguous, checksummed and replayable.
    pub fn restore(base: Document, stored: Vec<LogEntry>, config: LogConfig) -> Restored {
        let mut log = Self::new(base.clone(), config);
        let mut document = base;
        let mut error = None;

        for entry in stored {
            if entry.global_seq <= log.base_seq() {
                continue; // already folded into the base
            }
            let expected = log.head() + 1;
            if entry.global_seq != expected {
                error = Some(LogError::Gap { expected, found: entry.global_seq });
                break;
            }
            if !entry.verify() {
                error = Some(LogError::ChecksumMismatch { seq: entry.global_seq });
                break;
            }
            match document.apply(&entry.operation.kind) {
                Ok(next) => document = next,
                Err(source) => {
                    error = Some(LogError::Replay { seq: entry.global_seq, source });
                    break;
                }
            }
            log.ids.insert(entry.operation.id, entry.global_seq);
            log.entries.push_back(entry);
        }

        Restored { log, document, error }
    }

    pub fn base(&self) -> &Document {
        &self.base
    }

    /// Sequence of the base snapshot (first sequence still answerable by `since`).
    pub fn base_seq(&self) -> u64 {
        self.base.version()
    }

    /// Sequence of the last accepted operation.
    pub fn head(&self) -> u64 {
        self.entries.back().map_or(self.base_seq(), |e| e.global_seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Append an accepted operation at `head + 1`.
    pub fn append(&mut self, operation: Operation) -> Result<&LogEntry, LogError> {
        let seq = self.head() + 1;
        let entry = LogEntry::new(seq, operation)?;
        self.ids.insert(entry.operation.id, seq);
        self.entries.push_back(entry);
        self.entries.back().ok_or(LogError::Gap { expected: seq, found: 0 })
    }

    /// Operations after `seq`, in order.
    pub fn since(&self, seq: u64) -> Result<Vec<SequencedOperation>, LogError> {
        Ok(self.entries_after(seq)?.map(LogEntry::sequenced).collect())
    }

    /// Entries after `seq`, if `seq` is inside the retained window.
    pub fn entries_after(&self, seq: u64) -> Result<impl Iterator<Item = &LogEntry>, LogError> {
        let base = self.base_seq();
        let head = self.head();
        if seq < base {
            return Err(LogError::Compacted { requested: seq, base });
        }
        if seq > head {
            return Err(LogError::AheadOfHead { requested: seq, head });
        }
        let skip = (seq - base) as usize;
        Ok(self.entries.iter().skip(skip))
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Sequence assigned to an already-accepted operation ID.
    pub fn seq_of(&self, operation_id: &Uuid) -> Option<u64> {
        self.ids.get(operation_id).copied()
    }

    pub fn needs_compaction(&self) -> bool {
        self.entries.len() > self.config.max_retained_ops
    }

    /// Highest sequence compaction may fold while keeping `min_retained_ops`.
    pub fn compaction_target(&self) -> Option<u64> {
        if !self.needs_compaction() {
            return None;
        }
        let keep = self.config.min_retained_ops.min(self.entries.len()) as u64;
        Some(self.head() - keep)
    }

    /// Fold every entry up to and including `upto` into the base snapshot.
    ///
    /// Returns the number of entries removed.
    pub fn compact(&mut self, upto: u64) -> Result<usize, LogError> {
        let folded: Vec<&LogEntry> = self.entries.iter().take_while(|e| e.global_seq <= upto).collect();
        let base = folded.iter().try_fold(self.base.clone(), |doc, entry| {
            doc.apply(&entry.operation.kind)
                .map_err(|source| LogError::Replay { seq: entry.global_seq, source })
        })?;
        let removed = folded.len();

        for entry in self.entries.drain(..removed) {
            self.ids.remove(&entry.operation.id);
        }
        self.base = base;
        Ok(removed)
    }

    /// Check contiguity and checksums of the retained entries.
    pub fn verify(&self) -> Result<(), LogError> {
        let mut expected = self.base_seq() + 1;
        for entry in &self.entries {
            if entry.global_seq != expected {
                return Err(LogError::Gap { expected, found: entry.global_seq });
            }
            if !entry.verify() {
                return Err(LogError::ChecksumMismatch { seq: entry.global_seq });
            }
            expected += 1;
        }
        Ok(())
    }

    /// Rebuild the head document from the base and retained entries.
    pub fn replay(&self) -> Result<Document, LogError> {
        self.entries.iter().try_fold(self.base.clone(), |doc, entry| {
            doc.apply(&entry.operation.kind)
                .map_err(|source| LogError::Replay { seq: entry.global_seq, source })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariaforge_core::{OperationKind, TrackKind};

    fn insert_track(session: Uuid) -> Operation {
        Operation::new(
            session,
            Uuid::new_v4(),
            0,
            OperationKind::InsertTrack {
                track_id: Uuid::new_v4(),
                index: None,
                name: "Bass".into(),
                kind: TrackKind::Audio,
                color: "#112233".into(),
            },
        )
    }

    fn filled(n: usize, config: LogConfig) -> (OperationLog, Document) {
        let session = Uuid::new_v4();
        let mut doc = Document::new(Uuid::new_v4());
        let mut log = OperationLog::new(doc.clone(), config);
        for _ in 0..n {
            let op = insert_track(session);
            doc = doc.apply(&op.kind).unwrap();
            log.append(op).unwrap();
        }
        (log, doc)
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let (log, doc) = filled(5, LogConfig::default());
        let seqs: Vec<u64> = log.entries().map(|e| e.global_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.head(), doc.version());
        log.verify().unwrap();
    }

    #[test]
    fn test_since_window() {
        let (log, _) = filled(5, LogConfig::default());
        assert_eq!(log.since(3).unwrap().len(), 2);
        assert!(log.since(5).unwrap().is_empty());
        assert_eq!(log.since(6), Err(LogError::AheadOfHead { requested: 6, head: 5 }));
    }

    #[test]
    fn test_compaction_moves_base() {
        let (mut log, doc) = filled(10, LogConfig::for_testing());
        assert!(log.needs_compaction());
        let target = log.compaction_target().unwrap();
        assert_eq!(target, 8);

        let removed = log.compact(target).unwrap();
        assert_eq!(removed, 8);
        assert_eq!(log.base_seq(), 8);
        assert_eq!(log.len(), 2);
        assert_eq!(log.since(2), Err(LogError::Compacted { requested: 2, base: 8 }));
        assert_eq!(log.replay().unwrap(), doc);
    }

    #[test]
    fn test_compaction_drops_id_index() {
        let (mut log, _) = filled(3, LogConfig::default());
        let first = log.entries().next().unwrap().operation.id;
        assert_eq!(log.seq_of(&first), Some(1));
        log.compact(1).unwrap();
        assert_eq!(log.seq_of(&first), None);
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let (log, _) = filled(1, LogConfig::default());
        let mut entry = log.entries().next().unwrap().clone();
        assert!(entry.verify());
        entry.operation.base_version = 99;
        assert!(!entry.verify());
    }

    #[test]
    fn test_restore_stops_at_gap() {
        let (log, _) = filled(4, LogConfig::default());
        let mut stored: Vec<LogEntry> = log.entries().cloned().collect();
        stored.remove(2); // drop seq 3

        let restored = OperationLog::restore(log.base().clone(), stored, LogConfig::default());
        assert_eq!(restored.error, Some(LogError::Gap { expected: 3, found: 4 }));
        assert_eq!(restored.log.head(), 2);
        assert_eq!(restored.document.version(), 2);
    }

    #[test]
    fn test_restore_stops_at_unreplayable_entry() {
        let session = Uuid::new_v4();
        let base = Document::new(Uuid::new_v4());
        let ghost = Operation::new(session, Uuid::new_v4(), 0, OperationKind::DeleteClip { clip_id: Uuid::new_v4() });
        let stored = vec![LogEntry::new(1, ghost).unwrap()];

        let restored = OperationLog::restore(base, stored, LogConfig::default());
        assert!(matches!(restored.error, Some(LogError::Replay { seq: 1, .. })));
        assert!(restored.log.is_empty());
    }

    #[test]
    fn test_entry_encode_decode() {
        let (log, _) = filled(1, LogConfig::default());
        let entry = log.entries().next().unwrap();
        let decoded = LogEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(&decoded, entry);
        assert!(decoded.verify());
    }
}
