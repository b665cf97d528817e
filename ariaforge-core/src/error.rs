use thiserror::Error;
use uuid::Uuid;

use crate::model::EntityKind;
use crate::operation::Field;

/// An operation's shape or values are outside the schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Nil entity id")]
    NilId,
    #[error("Field {field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("Operation belongs to session {got}, expected {expected}")]
    SessionMismatch { expected: Uuid, got: Uuid },
}

impl ValidationError {
    pub fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::OutOfRange { field, reason: reason.into() }
    }
}

/// An operation is well-formed but cannot be applied to this document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error("Entity not found: {0}")]
    NotFound(Uuid),
    #[error("Entity was deleted: {0}")]
    TargetDeleted(Uuid),
    #[error("Entity id already used: {0}")]
    DuplicateId(Uuid),
    #[error("Field {field} does not apply to {kind} {id}")]
    InvalidTarget { id: Uuid, kind: EntityKind, field: Field },
    #[error("Invalid clip range: start {start} must be before end {end}")]
    InvalidRange { start: f64, end: f64 },
}
