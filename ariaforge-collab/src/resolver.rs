//! Conflict policy: last-writer-wins with tombstones.
//!
//! Decides, for one incoming operation and the current document, whether it
//! applies as-is, applies after a transform, or is rejected:
//!
//! ```text
//! base == version ──────────────────────────────► apply
//! base <  version ─┬─ insert ── shift track index ► apply
//!                  ├─ delete ─────────────────────► apply (idempotent)
//!                  └─ update/move
//!                       ├─ target tombstoned ─────► target_deleted
//!                       ├─ concurrent same field ─► superseded (+ post-state)
//!                       ├─ window compacted ──────► stale_base_version (+ post-state)
//!                       └─ otherwise ─────────────► apply
//! base >  version ──────────────────────────────► invalid_base_version
//! ```
//!
//! The decision depends only on the document, the operation and the log
//! entries sequenced after its base version, so it is deterministic.

use ariaforge_core::{Document, EntityState, Liveness, OpClass, Operation, OperationKind};

use crate::oplog::OperationLog;
use crate::protocol::RejectReason;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply this payload (possibly transformed from the submitted one).
    Apply(OperationKind),
    Reject {
        reason: RejectReason,
        corrected_state: Option<EntityState>,
    },
}

impl Resolution {
    fn reject(reason: RejectReason) -> Self {
        Resolution::Reject { reason, corrected_state: None }
    }
}

/// Resolve `op` against the current document and log.
pub fn resolve(document: &Document, log: &OperationLog, op: &Operation) -> Resolution {
    let version = document.version();
    if op.base_version > version {
        return Resolution::reject(RejectReason::InvalidBaseVersion);
    }

    match op.kind.class() {
        OpClass::Insert => Resolution::Apply(transform_insert(document, log, op)),
        OpClass::Delete => Resolution::Apply(op.kind.clone()),
        OpClass::Update => resolve_update(document, log, op),
    }
}

fn resolve_update(document: &Document, log: &OperationLog, op: &Operation) -> Resolution {
    let target = op.kind.target();

    // Delete wins over any update or move, concurrent or not.
    match document.liveness(&target) {
        Liveness::Deleted(_) => return Resolution::reject(RejectReason::TargetDeleted),
        Liveness::Missing => return Resolution::reject(RejectReason::NotFound),
        Liveness::Live(_) => {}
    }
    if let Some(dependency) = op.kind.dependency() {
        if let Liveness::Deleted(_) = document.liveness(&dependency) {
            return Resolution::reject(RejectReason::TargetDeleted);
        }
    }

    if op.base_version == document.version() {
        return Resolution::Apply(op.kind.clone());
    }

    match log.entries_after(op.base_version) {
        Ok(mut concurrent) => {
            if concurrent.any(|entry| entry.operation.kind.overlaps(&op.kind)) {
                return Resolution::Reject {
                    reason: RejectReason::Superseded,
                    corrected_state: document.entity_state(&target),
                };
            }
            Resolution::Apply(op.kind.clone())
        }
        // Concurrent writes can no longer be inspected; make the client rebase.
        Err(_) => Resolution::Reject {
            reason: RejectReason::StaleBaseVersion,
            corrected_state: document.entity_state(&target),
        },
    }
}

/// Shift an indexed `InsertTrack` past tracks inserted concurrently at or
/// before its position. Other inserts pass through unchanged.
fn transform_insert(document: &Document, log: &OperationLog, op: &Operation) -> OperationKind {
    let OperationKind::InsertTrack { track_id, index: Some(index), name, kind, color } = &op.kind else {
        return op.kind.clone();
    };

    let mut index = *index;
    if op.base_version < document.version() {
        if let Ok(concurrent) = log.entries_after(op.base_version) {
            for entry in concurrent {
                if let OperationKind::InsertTrack { index: Some(theirs), .. } = entry.operation.kind {
                    if theirs <= index {
                        index += 1;
                    }
                }
            }
        }
    }

    OperationKind::InsertTrack {
        track_id: *track_id,
        index: Some(index.min(document.track_count() as u32)),
        name: name.clone(),
        kind: *kind,
        color: color.clone(),
    }
}
