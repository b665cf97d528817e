//! Binary wire protocol between editors and the sync server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! ```text
//! Client ── ClientMessage ──► Server
//!   Join { session, project, token, last_known_sequence }
//!   SubmitOperation { op }            (op carries its base version)
//!   PresenceUpdate { cursor }         (fire-and-forget)
//!   EndSession | Leave | Ping
//!
//! Server ── ServerMessage ──► Client
//!   Catchup | Snapshot | JoinRejected              (join reply)
//!   OperationApplied | OperationRejected | OperationTimedOut
//!   OperationBroadcast | PresenceBroadcast | PresenceLeft
//!   SessionState | SessionDegraded | Pong
//! ```
//!
//! Rejections carry a [`RejectReason`] whose [`code`](RejectReason::code) is
//! the stable machine-readable string clients switch on.

use ariaforge_core::{Document, EntityState, Operation, OperationKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Ephemeral cursor position of one editor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub track_id: Option<Uuid>,
    pub clip_id: Option<Uuid>,
    /// Playhead / pointer position in beats
    pub position_beats: f64,
    /// Selected entity IDs
    pub selection: Vec<Uuid>,
}

impl Cursor {
    pub fn at(position_beats: f64) -> Self {
        Self { position_beats, ..Self::default() }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Empty,
    Active,
    Draining,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Empty => write!(f, "empty"),
            SessionState::Active => write!(f, "active"),
            SessionState::Draining => write!(f, "draining"),
        }
    }
}

/// Why a session started draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReason {
    OwnerEnded,
    IdleTimeout,
    PersistenceUnavailable,
}

impl StateReason {
    pub fn code(&self) -> &'static str {
        match self {
            StateReason::OwnerEnded => "owner_ended",
            StateReason::IdleTimeout => "idle_timeout",
            StateReason::PersistenceUnavailable => "persistence_unavailable",
        }
    }
}

/// Machine-readable rejection reason for joins and operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Target (or its parent) was deleted
    TargetDeleted,
    /// A concurrent update to the same field won
    Superseded,
    /// Referenced entity never existed
    NotFound,
    /// Inserted ID is already in use or tombstoned
    DuplicateId,
    /// Field does not belong to the target's kind
    InvalidTarget,
    /// Clip start would not precede its end
    InvalidRange,
    /// Base version is ahead of the session
    InvalidBaseVersion,
    /// Base version predates the retained log window
    StaleBaseVersion,
    PermissionDenied,
    ValidationFailed,
    SessionClosing,
    PersistenceUnavailable,
    /// Token was not recognized
    Unauthenticated,
    /// Message requires a prior successful join
    NotJoined,
    /// Session is bound to a different project
    ProjectMismatch,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::TargetDeleted => "target_deleted",
            RejectReason::Superseded => "superseded",
            RejectReason::NotFound => "not_found",
            RejectReason::DuplicateId => "duplicate_id",
            RejectReason::InvalidTarget => "invalid_target",
            RejectReason::InvalidRange => "invalid_range",
            RejectReason::InvalidBaseVersion => "invalid_base_version",
            RejectReason::StaleBaseVersion => "stale_base_version",
            RejectReason::PermissionDenied => "permission_denied",
            RejectReason::ValidationFailed => "validation_failed",
            RejectReason::SessionClosing => "session_closing",
            RejectReason::PersistenceUnavailable => "persistence_unavailable",
            RejectReason::Unauthenticated => "unauthenticated",
            RejectReason::NotJoined => "not_joined",
            RejectReason::ProjectMismatch => "project_mismatch",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl From<&ariaforge_core::ApplyError> for RejectReason {
    fn from(err: &ariaforge_core::ApplyError) -> Self {
        use ariaforge_core::ApplyError;
        match err {
            ApplyError::NotFound(_) => RejectReason::NotFound,
            ApplyError::TargetDeleted(_) => RejectReason::TargetDeleted,
            ApplyError::DuplicateId(_) => RejectReason::DuplicateId,
            ApplyError::InvalidTarget { .. } => RejectReason::InvalidTarget,
            ApplyError::InvalidRange { .. } => RejectReason::InvalidRange,
        }
    }
}

/// An accepted operation with its position in the session order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedOperation {
    pub global_seq: u64,
    /// As applied (an `InsertTrack` index may have been transformed)
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join {
        session_id: Uuid,
        project_id: Uuid,
        token: String,
        /// Last sequence the client applied; `None` for a fresh client
        last_known_sequence: Option<u64>,
    },
    SubmitOperation {
        op: Operation,
    },
    PresenceUpdate {
        cursor: Cursor,
    },
    /// Owner-initiated end of the session
    EndSession,
    Leave,
    Ping {
        nonce: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join reply: operations after the client's last known sequence
    Catchup {
        user_id: Uuid,
        document_version: u64,
        operations: Vec<SequencedOperation>,
    },
    /// Join reply: full document, when incremental catch-up is impossible
    Snapshot {
        user_id: Uuid,
        document_version: u64,
        document: Document,
        /// Set when the server rebuilt the session from a snapshot after
        /// detecting a corrupted log; local state must be discarded.
        resync: bool,
    },
    JoinRejected {
        reason: RejectReason,
    },
    OperationApplied {
        operation_id: Uuid,
        global_seq: u64,
        /// Present when the server transformed the operation before applying
        applied: Option<OperationKind>,
    },
    OperationRejected {
        operation_id: Uuid,
        reason: RejectReason,
        corrected_state: Option<EntityState>,
    },
    /// The sequencer did not answer in time; retry with a fresh base version.
    OperationTimedOut {
        operation_id: Uuid,
    },
    OperationBroadcast {
        global_seq: u64,
        op: Operation,
        origin_user_id: Uuid,
    },
    PresenceBroadcast {
        user_id: Uuid,
        cursor: Cursor,
    },
    PresenceLeft {
        user_id: Uuid,
    },
    SessionState {
        state: SessionState,
        reason: Option<StateReason>,
    },
    SessionDegraded {
        degraded: bool,
    },
    /// Reply to a message that is not valid in the connection's state
    Error {
        reason: RejectReason,
    },
    Pong {
        nonce: u64,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Catchup { .. } => "catchup",
            ServerMessage::Snapshot { .. } => "snapshot",
            ServerMessage::JoinRejected { .. } => "join_rejected",
            ServerMessage::OperationApplied { .. } => "operation_applied",
            ServerMessage::OperationRejected { .. } => "operation_rejected",
            ServerMessage::OperationTimedOut { .. } => "operation_timed_out",
            ServerMessage::OperationBroadcast { .. } => "operation_broadcast",
            ServerMessage::PresenceBroadcast { .. } => "presence_broadcast",
            ServerMessage::PresenceLeft { .. } => "presence_left",
            ServerMessage::SessionState { .. } => "session_state",
            ServerMessage::SessionDegraded { .. } => "session_degraded",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
        }
    }
}

/// Serialize any wire or stored value with the standard bincode config.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Not connected")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariaforge_core::{FieldUpdate, Meter};

    fn update_op() -> Operation {
        let target = Uuid::new_v4();
        Operation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            5,
            OperationKind::UpdateField { target, update: FieldUpdate::Meter(Meter::new(3, 4)) },
        )
    }

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::SubmitOperation { op: update_op() };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);

        let join = ClientMessage::Join {
            session_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            token: "alice".into(),
            last_known_sequence: Some(10),
        };
        assert_eq!(ClientMessage::decode(&join.encode().unwrap()).unwrap(), join);
    }

    #[test]
    fn test_snapshot_carries_document() {
        let doc = Document::new(Uuid::new_v4());
        let msg = ServerMessage::Snapshot {
            user_id: Uuid::new_v4(),
            document_version: doc.version(),
            document: doc.clone(),
            resync: true,
        };
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::Snapshot { document, resync, .. } => {
                assert_eq!(document, doc);
                assert!(resync);
            }
            other => panic!("Expected snapshot, got {}", other.name()),
        }
    }

    #[test]
    fn test_reject_codes() {
        assert_eq!(RejectReason::TargetDeleted.code(), "target_deleted");
        assert_eq!(RejectReason::Superseded.code(), "superseded");
        assert_eq!(RejectReason::InvalidBaseVersion.to_string(), "invalid_base_version");
        assert_eq!(StateReason::IdleTimeout.code(), "idle_timeout");
    }

    #[test]
    fn test_apply_error_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(
            RejectReason::from(&ariaforge_core::ApplyError::TargetDeleted(id)),
            RejectReason::TargetDeleted
        );
        assert_eq!(
            RejectReason::from(&ariaforge_core::ApplyError::InvalidRange { start: 2.0, end: 1.0 }),
            RejectReason::InvalidRange
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(ServerMessage::decode(&garbage), Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_cursor_frame_is_small() {
        let msg = ServerMessage::PresenceBroadcast { user_id: Uuid::new_v4(), cursor: Cursor::at(12.5) };
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 64, "Encoded size {} too large for a cursor", encoded.len());
    }
}
