//! Entity types of the project hierarchy.
//!
//! ```text
//! Project ──< Track ──< Clip ──< Note
//! ```
//!
//! Parents own ordered lists of child IDs; the entities themselves live in
//! the [`Document`](crate::Document) arena keyed by ID.

use im::Vector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub numerator: u8,
    pub denominator: u8,
}

impl Meter {
    pub const COMMON: Meter = Meter { numerator: 4, denominator: 4 };

    pub fn new(numerator: u8, denominator: u8) -> Self {
        Self { numerator, denominator }
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::COMMON
    }
}

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Midi,
    Audio,
    Bus,
}

/// Root entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub title: String,
    /// Beats per minute
    pub tempo: f64,
    pub key: String,
    pub meter: Meter,
    /// Ordered track IDs
    pub tracks: Vector<Uuid>,
}

impl Project {
    /// A fresh project with editor defaults (120 BPM, C, 4/4).
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            title: "Untitled".to_string(),
            tempo: 120.0,
            key: "C".to_string(),
            meter: Meter::COMMON,
            tracks: Vector::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    pub name: String,
    pub kind: TrackKind,
    /// `#RRGGBB`
    pub color: String,
    /// Ordered clip IDs
    pub clips: Vector<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: Uuid,
    pub track_id: Uuid,
    /// Start position in beats. Invariant: `0 <= start_time < end_time`.
    pub start_time: f64,
    pub end_time: f64,
    /// Ordered note IDs
    pub notes: Vector<Uuid>,
}

impl Clip {
    pub fn length(&self) -> f64 {
        self.end_time - self.start_time
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub clip_id: Uuid,
    /// MIDI pitch 0..=127
    pub pitch: u8,
    /// MIDI velocity 1..=127
    pub velocity: u8,
    /// Offset from the clip start, in beats
    pub start_offset: f64,
    /// Length in beats
    pub duration: f64,
}

/// Level of an entity in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Project,
    Track,
    Clip,
    Note,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Project => write!(f, "project"),
            EntityKind::Track => write!(f, "track"),
            EntityKind::Clip => write!(f, "clip"),
            EntityKind::Note => write!(f, "note"),
        }
    }
}

/// Authoritative copy of a single entity.
///
/// Sent back to a client whose update lost a last-writer-wins race so it can
/// reconcile without re-fetching the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityState {
    Project(Project),
    Track(Track),
    Clip(Clip),
    Note(Note),
}

impl EntityState {
    pub fn id(&self) -> Uuid {
        match self {
            EntityState::Project(p) => p.id,
            EntityState::Track(t) => t.id,
            EntityState::Clip(c) => c.id,
            EntityState::Note(n) => n.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityState::Project(_) => EntityKind::Project,
            EntityState::Track(_) => EntityKind::Track,
            EntityState::Clip(_) => EntityKind::Clip,
            EntityState::Note(_) => EntityKind::Note,
        }
    }
}
