//! Single-writer sequencing core of a session.
//!
//! Owns the current document version and the operation log. Each call to
//! [`Sequencer::submit`] runs validation, duplicate detection and conflict
//! resolution, then applies the operation and appends it to the log in one
//! step, so the document version always equals the log head.
//!
//! The sequencer is plain synchronous state. The session actor wraps it with
//! membership, persistence and fan-out; nothing else ever touches it.

use ariaforge_core::{Document, EntityState, Operation};
use log::{debug, error};
use uuid::Uuid;

use crate::oplog::{LogConfig, LogEntry, LogError, OperationLog};
use crate::protocol::{RejectReason, SequencedOperation};
use crate::resolver::{self, Resolution};

/// Result of sequencing one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Applied and appended at `entry.global_seq`.
    Applied {
        entry: LogEntry,
        /// The payload differs from the one submitted
        transformed: bool,
    },
    /// Same operation ID was accepted before; nothing re-applied.
    Duplicate { global_seq: u64 },
    Rejected {
        reason: RejectReason,
        corrected_state: Option<EntityState>,
    },
}

impl Decision {
    fn rejected(reason: RejectReason) -> Self {
        Decision::Rejected { reason, corrected_state: None }
    }
}

/// How a joining client gets up to date.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchUp {
    Operations(Vec<SequencedOperation>),
    Snapshot(Document),
}

pub struct Sequencer {
    session_id: Uuid,
    document: Document,
    log: OperationLog,
}

impl Sequencer {
    /// Start sequencing on top of `document`; the next sequence is
    /// `document.version() + 1`.
    pub fn new(session_id: Uuid, document: Document, config: LogConfig) -> Self {
        Self {
            session_id,
            log: OperationLog::new(document.clone(), config),
            document,
        }
    }

    /// Resume from a restored log whose head matches `document`.
    pub fn from_parts(session_id: Uuid, document: Document, log: OperationLog) -> Self {
        Self { session_id, document, log }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn version(&self) -> u64 {
        self.document.version()
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn submit(&mut self, mut op: Operation) -> Decision {
        if op.session_id != self.session_id || op.kind.validate().is_err() {
            return Decision::rejected(RejectReason::ValidationFailed);
        }
        if let Some(global_seq) = self.log.seq_of(&op.id) {
            debug!("Session {}: duplicate submission of {} (seq {global_seq})", self.session_id, op.id);
            return Decision::Duplicate { global_seq };
        }

        let kind = match resolver::resolve(&self.document, &self.log, &op) {
            Resolution::Apply(kind) => kind,
            Resolution::Reject { reason, corrected_state } => {
                return Decision::Rejected { reason, corrected_state };
            }
        };

        let next = match self.document.apply(&kind) {
            Ok(next) => next,
            Err(e) => return Decision::rejected(RejectReason::from(&e)),
        };

        let transformed = kind != op.kind;
        op.kind = kind;
        let entry = match self.log.append(op) {
            Ok(entry) => entry.clone(),
            Err(e) => {
                error!("Session {}: failed to append operation: {e}", self.session_id);
                return Decision::rejected(RejectReason::ValidationFailed);
            }
        };

        self.document = next;
        debug!(
            "Session {}: seq {} {} by {}",
            self.session_id,
            entry.global_seq,
            entry.operation.kind.name(),
            entry.operation.origin_user_id
        );
        Decision::Applied { entry, transformed }
    }

    /// Operations after `last_known`, or the full document when the log can
    /// no longer answer (compacted past, ahead of the head, or fresh client).
    pub fn catch_up(&self, last_known: Option<u64>) -> CatchUp {
        match last_known.map(|seq| self.log.since(seq)) {
            Some(Ok(operations)) => CatchUp::Operations(operations),
            _ => CatchUp::Snapshot(self.document.clone()),
        }
    }

    /// Current version and document.
    pub fn snapshot(&self) -> (u64, Document) {
        (self.version(), self.document.clone())
    }

    pub fn compact(&mut self, upto: u64) -> Result<usize, LogError> {
        self.log.compact(upto)
    }
}
