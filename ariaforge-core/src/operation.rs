//! Typed document operations.
//!
//! An [`Operation`] is a single proposed mutation plus the envelope the
//! sequencer needs (who sent it, which version it was based on). The
//! payload is a closed enum, one case per mutation, so a malformed shape
//! is unrepresentable once decoded. Value ranges are checked separately by
//! [`OperationKind::validate`] before the operation is sequenced.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::model::{EntityKind, Meter, TrackKind};

/// Maximum length of free-text fields (titles, names).
pub const MAX_NAME_LEN: usize = 200;

/// Maximum length of a key signature label.
pub const MAX_KEY_LEN: usize = 16;

/// Tempo bounds in BPM.
pub const MIN_TEMPO: f64 = 20.0;
pub const MAX_TEMPO: f64 = 999.0;

/// A proposed mutation with its sequencing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-generated ID; doubles as an idempotency key for retries
    pub id: Uuid,
    pub session_id: Uuid,
    pub origin_user_id: Uuid,
    /// Document version the client believed was current
    pub base_version: u64,
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(session_id: Uuid, origin_user_id: Uuid, base_version: u64, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            origin_user_id,
            base_version,
            kind,
        }
    }
}

/// The mutation itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    InsertTrack {
        track_id: Uuid,
        /// Position in the project's track list; `None` appends
        index: Option<u32>,
        name: String,
        kind: TrackKind,
        color: String,
    },
    DeleteTrack {
        track_id: Uuid,
    },
    InsertClip {
        clip_id: Uuid,
        track_id: Uuid,
        start_time: f64,
        end_time: f64,
    },
    DeleteClip {
        clip_id: Uuid,
    },
    /// Move a clip to `track_id` (possibly its current track) at
    /// `start_time`, keeping its length.
    MoveClip {
        clip_id: Uuid,
        track_id: Uuid,
        start_time: f64,
    },
    InsertNote {
        note_id: Uuid,
        clip_id: Uuid,
        pitch: u8,
        velocity: u8,
        start_offset: f64,
        duration: f64,
    },
    DeleteNote {
        note_id: Uuid,
    },
    UpdateField {
        target: Uuid,
        update: FieldUpdate,
    },
}

/// Broad shape of an operation, used by the conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Insert,
    Delete,
    /// Field updates and moves
    Update,
}

/// A single typed field assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldUpdate {
    ProjectTitle(String),
    Tempo(f64),
    Key(String),
    Meter(Meter),
    TrackName(String),
    TrackKind(TrackKind),
    TrackColor(String),
    ClipStart(f64),
    ClipEnd(f64),
    NotePitch(u8),
    NoteVelocity(u8),
    NoteStartOffset(f64),
    NoteDuration(f64),
}

/// Field identity, without a value. Two updates conflict only when they
/// touch the same field of the same entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    ProjectTitle,
    Tempo,
    Key,
    Meter,
    TrackName,
    TrackKind,
    TrackColor,
    ClipTrack,
    ClipStart,
    ClipEnd,
    NotePitch,
    NoteVelocity,
    NoteStartOffset,
    NoteDuration,
}

impl Field {
    /// The entity kind this field belongs to.
    pub fn entity_kind(self) -> EntityKind {
        match self {
            Field::ProjectTitle | Field::Tempo | Field::Key | Field::Meter => EntityKind::Project,
            Field::TrackName | Field::TrackKind | Field::TrackColor => EntityKind::Track,
            Field::ClipTrack | Field::ClipStart | Field::ClipEnd => EntityKind::Clip,
            Field::NotePitch | Field::NoteVelocity | Field::NoteStartOffset | Field::NoteDuration => {
                EntityKind::Note
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::ProjectTitle => "title",
            Field::Tempo => "tempo",
            Field::Key => "key",
            Field::Meter => "meter",
            Field::TrackName => "name",
            Field::TrackKind => "kind",
            Field::TrackColor => "color",
            Field::ClipTrack => "track",
            Field::ClipStart => "start_time",
            Field::ClipEnd => "end_time",
            Field::NotePitch => "pitch",
            Field::NoteVelocity => "velocity",
            Field::NoteStartOffset => "start_offset",
            Field::NoteDuration => "duration",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.entity_kind(), self.name())
    }
}

impl FieldUpdate {
    pub fn field(&self) -> Field {
        match self {
            FieldUpdate::ProjectTitle(_) => Field::ProjectTitle,
            FieldUpdate::Tempo(_) => Field::Tempo,
            FieldUpdate::Key(_) => Field::Key,
            FieldUpdate::Meter(_) => Field::Meter,
            FieldUpdate::TrackName(_) => Field::TrackName,
            FieldUpdate::TrackKind(_) => Field::TrackKind,
            FieldUpdate::TrackColor(_) => Field::TrackColor,
            FieldUpdate::ClipStart(_) => Field::ClipStart,
            FieldUpdate::ClipEnd(_) => Field::ClipEnd,
            FieldUpdate::NotePitch(_) => Field::NotePitch,
            FieldUpdate::NoteVelocity(_) => Field::NoteVelocity,
            FieldUpdate::NoteStartOffset(_) => Field::NoteStartOffset,
            FieldUpdate::NoteDuration(_) => Field::NoteDuration,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            FieldUpdate::ProjectTitle(title) => check_name("title", title, MAX_NAME_LEN),
            FieldUpdate::Tempo(bpm) => check_tempo(*bpm),
            FieldUpdate::Key(key) => check_name("key", key, MAX_KEY_LEN),
            FieldUpdate::Meter(meter) => check_meter(meter),
            FieldUpdate::TrackName(name) => check_name("name", name, MAX_NAME_LEN),
            FieldUpdate::TrackKind(_) => Ok(()),
            FieldUpdate::TrackColor(color) => check_color(color),
            FieldUpdate::ClipStart(t) => check_non_negative("start_time", *t),
            FieldUpdate::ClipEnd(t) => {
                check_finite("end_time", *t)?;
                if *t <= 0.0 {
                    return Err(ValidationError::out_of_range("end_time", "must be positive"));
                }
                Ok(())
            }
            FieldUpdate::NotePitch(p) => check_pitch(*p),
            FieldUpdate::NoteVelocity(v) => check_velocity(*v),
            FieldUpdate::NoteStartOffset(t) => check_non_negative("start_offset", *t),
            FieldUpdate::NoteDuration(d) => check_positive("duration", *d),
        }
    }
}

impl OperationKind {
    /// The entity this operation creates, removes or mutates.
    pub fn target(&self) -> Uuid {
        match self {
            OperationKind::InsertTrack { track_id, .. } => *track_id,
            OperationKind::DeleteTrack { track_id } => *track_id,
            OperationKind::InsertClip { clip_id, .. } => *clip_id,
            OperationKind::DeleteClip { clip_id } => *clip_id,
            OperationKind::MoveClip { clip_id, .. } => *clip_id,
            OperationKind::InsertNote { note_id, .. } => *note_id,
            OperationKind::DeleteNote { note_id } => *note_id,
            OperationKind::UpdateField { target, .. } => *target,
        }
    }

    /// The other entity this operation depends on: the parent for inserts,
    /// the destination track for moves. Track inserts hang off the project
    /// root, which always exists.
    pub fn dependency(&self) -> Option<Uuid> {
        match self {
            OperationKind::InsertClip { track_id, .. } => Some(*track_id),
            OperationKind::InsertNote { clip_id, .. } => Some(*clip_id),
            OperationKind::MoveClip { track_id, .. } => Some(*track_id),
            _ => None,
        }
    }

    pub fn class(&self) -> OpClass {
        match self {
            OperationKind::InsertTrack { .. }
            | OperationKind::InsertClip { .. }
            | OperationKind::InsertNote { .. } => OpClass::Insert,
            OperationKind::DeleteTrack { .. }
            | OperationKind::DeleteClip { .. }
            | OperationKind::DeleteNote { .. } => OpClass::Delete,
            OperationKind::MoveClip { .. } | OperationKind::UpdateField { .. } => OpClass::Update,
        }
    }

    /// Fields written by an update or move. Empty for inserts and deletes.
    pub fn touched_fields(&self) -> &'static [Field] {
        match self {
            OperationKind::MoveClip { .. } => &[Field::ClipTrack, Field::ClipStart, Field::ClipEnd],
            OperationKind::UpdateField { update, .. } => field_slice(update.field()),
            _ => &[],
        }
    }

    /// Whether this operation writes a field `other` also writes, on the
    /// same entity.
    pub fn overlaps(&self, other: &OperationKind) -> bool {
        if self.target() != other.target() {
            return false;
        }
        let theirs = other.touched_fields();
        self.touched_fields().iter().any(|f| theirs.contains(f))
    }

    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::InsertTrack { .. } => "insert_track",
            OperationKind::DeleteTrack { .. } => "delete_track",
            OperationKind::InsertClip { .. } => "insert_clip",
            OperationKind::DeleteClip { .. } => "delete_clip",
            OperationKind::MoveClip { .. } => "move_clip",
            OperationKind::InsertNote { .. } => "insert_note",
            OperationKind::DeleteNote { .. } => "delete_note",
            OperationKind::UpdateField { .. } => "update_field",
        }
    }

    /// Stateless schema check: IDs present, values within their domains.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_id(self.target())?;
        if let Some(dep) = self.dependency() {
            check_id(dep)?;
        }

        match self {
            OperationKind::InsertTrack { name, color, .. } => {
                check_name("name", name, MAX_NAME_LEN)?;
                check_color(color)
            }
            OperationKind::InsertClip { start_time, end_time, .. } => {
                check_non_negative("start_time", *start_time)?;
                check_finite("end_time", *end_time)?;
                if start_time >= end_time {
                    return Err(ValidationError::out_of_range(
                        "end_time",
                        "must be greater than start_time",
                    ));
                }
                Ok(())
            }
            OperationKind::MoveClip { start_time, .. } => check_non_negative("start_time", *start_time),
            OperationKind::InsertNote { pitch, velocity, start_offset, duration, .. } => {
                check_pitch(*pitch)?;
                check_velocity(*velocity)?;
                check_non_negative("start_offset", *start_offset)?;
                check_positive("duration", *duration)
            }
            OperationKind::UpdateField { update, .. } => update.validate(),
            OperationKind::DeleteTrack { .. }
            | OperationKind::DeleteClip { .. }
            | OperationKind::DeleteNote { .. } => Ok(()),
        }
    }
}

fn field_slice(field: Field) -> &'static [Field] {
    match field {
        Field::ProjectTitle => &[Field::ProjectTitle],
        Field::Tempo => &[Field::Tempo],
        Field::Key => &[Field::Key],
        Field::Meter => &[Field::Meter],
        Field::TrackName => &[Field::TrackName],
        Field::TrackKind => &[Field::TrackKind],
        Field::TrackColor => &[Field::TrackColor],
        Field::ClipTrack => &[Field::ClipTrack],
        Field::ClipStart => &[Field::ClipStart],
        Field::ClipEnd => &[Field::ClipEnd],
        Field::NotePitch => &[Field::NotePitch],
        Field::NoteVelocity => &[Field::NoteVelocity],
        Field::NoteStartOffset => &[Field::NoteStartOffset],
        Field::NoteDuration => &[Field::NoteDuration],
    }
}

// ─── Domain checks ───────────────────────────────────────────────────

fn check_id(id: Uuid) -> Result<(), ValidationError> {
    if id.is_nil() {
        return Err(ValidationError::NilId);
    }
    Ok(())
}

fn check_name(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(ValidationError::out_of_range(field, format!("length must be 1..={max}")));
    }
    Ok(())
}

fn check_color(color: &str) -> Result<(), ValidationError> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(ValidationError::out_of_range("color", "expected #RRGGBB"));
    }
    Ok(())
}

fn check_tempo(bpm: f64) -> Result<(), ValidationError> {
    check_finite("tempo", bpm)?;
    if !(MIN_TEMPO..=MAX_TEMPO).contains(&bpm) {
        return Err(ValidationError::out_of_range(
            "tempo",
            format!("must be within {MIN_TEMPO}..={MAX_TEMPO}"),
        ));
    }
    Ok(())
}

fn check_meter(meter: &Meter) -> Result<(), ValidationError> {
    if !(1..=32).contains(&meter.numerator) {
        return Err(ValidationError::out_of_range("meter", "numerator must be 1..=32"));
    }
    if !matches!(meter.denominator, 1 | 2 | 4 | 8 | 16 | 32) {
        return Err(ValidationError::out_of_range("meter", "denominator must be a power of two <= 32"));
    }
    Ok(())
}

fn check_pitch(pitch: u8) -> Result<(), ValidationError> {
    if pitch > 127 {
        return Err(ValidationError::out_of_range("pitch", "must be 0..=127"));
    }
    Ok(())
}

fn check_velocity(velocity: u8) -> Result<(), ValidationError> {
    if !(1..=127).contains(&velocity) {
        return Err(ValidationError::out_of_range("velocity", "must be 1..=127"));
    }
    Ok(())
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::out_of_range(field, "must be finite"));
    }
    Ok(())
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    check_finite(field, value)?;
    if value < 0.0 {
        return Err(ValidationError::out_of_range(field, "must not be negative"));
    }
    Ok(())
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ValidationError> {
    check_finite(field, value)?;
    if value <= 0.0 {
        return Err(ValidationError::out_of_range(field, "must be positive"));
    }
    Ok(())
}
