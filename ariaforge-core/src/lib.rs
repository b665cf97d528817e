//! AriaForge document core.
//!
//! The project hierarchy (project → tracks → clips → notes), the typed
//! operations that mutate it, and the copy-on-write [`Document`] that applies
//! them. Nothing here knows about sessions, sockets or storage; the
//! `ariaforge-collab` crate layers sequencing and fan-out on top.

pub mod document;
pub mod error;
pub mod model;
pub mod operation;

pub use document::{Document, Liveness};
pub use error::{ApplyError, ValidationError};
pub use model::{Clip, EntityKind, EntityState, Meter, Note, Project, Track, TrackKind};
pub use operation::{Field, FieldUpdate, OpClass, Operation, OperationKind};
