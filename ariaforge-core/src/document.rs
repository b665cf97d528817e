//! Versioned project document.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Document (version N)                         │
//! │                                              │
//! │  project ── tracks: [t1, t2]                 │
//! │  tracks  : OrdMap<id, Track>  (clips: [..])  │
//! │  clips   : OrdMap<id, Clip>   (notes: [..])  │
//! │  notes   : OrdMap<id, Note>                  │
//! │  tombstones: OrdMap<id, EntityKind>          │
//! └──────────────────────────────────────────────┘
//!            │ apply(op)            (structural sharing)
//!            ▼
//! ┌──────────────────────────────────────────────┐
//! │ Document (version N+1)                       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Entities live in persistent maps keyed by ID; parents hold ordered child
//! ID lists. `apply` never mutates `self`: it returns the next version,
//! sharing every untouched node with the previous one. Cloning a document
//! is O(1), so a reader can hold version N while the sequencer produces N+1.

use im::{OrdMap, Vector};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::ApplyError;
use crate::model::{Clip, EntityKind, EntityState, Note, Project, Track};
use crate::operation::{FieldUpdate, OperationKind};

/// Whether an ID refers to a live entity, a deleted one, or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live(EntityKind),
    Deleted(EntityKind),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Number of operations applied since the empty project
    version: u64,
    project: Project,
    tracks: OrdMap<Uuid, Track>,
    clips: OrdMap<Uuid, Clip>,
    notes: OrdMap<Uuid, Note>,
    tombstones: OrdMap<Uuid, EntityKind>,
}

impl Document {
    /// An empty project at version 0.
    pub fn new(project_id: Uuid) -> Self {
        Self {
            version: 0,
            project: Project::new(project_id),
            tracks: OrdMap::new(),
            clips: OrdMap::new(),
            notes: OrdMap::new(),
            tombstones: OrdMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn project_id(&self) -> Uuid {
        self.project.id
    }

    pub fn track(&self, id: &Uuid) -> Option<&Track> {
        self.tracks.get(id)
    }

    pub fn clip(&self, id: &Uuid) -> Option<&Clip> {
        self.clips.get(id)
    }

    pub fn note(&self, id: &Uuid) -> Option<&Note> {
        self.notes.get(id)
    }

    /// Tracks in project order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.project.tracks.iter().filter_map(move |id| self.tracks.get(id))
    }

    /// Clips of a track in track order.
    pub fn clips_of(&self, track_id: &Uuid) -> Vec<&Clip> {
        self.tracks
            .get(track_id)
            .map(|t| t.clips.iter().filter_map(|id| self.clips.get(id)).collect())
            .unwrap_or_default()
    }

    /// Notes of a clip in clip order.
    pub fn notes_of(&self, clip_id: &Uuid) -> Vec<&Note> {
        self.clips
            .get(clip_id)
            .map(|c| c.notes.iter().filter_map(|id| self.notes.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_tombstoned(&self, id: &Uuid) -> bool {
        self.tombstones.contains_key(id)
    }

    pub fn liveness(&self, id: &Uuid) -> Liveness {
        if *id == self.project.id {
            Liveness::Live(EntityKind::Project)
        } else if self.tracks.contains_key(id) {
            Liveness::Live(EntityKind::Track)
        } else if self.clips.contains_key(id) {
            Liveness::Live(EntityKind::Clip)
        } else if self.notes.contains_key(id) {
            Liveness::Live(EntityKind::Note)
        } else if let Some(kind) = self.tombstones.get(id) {
            Liveness::Deleted(*kind)
        } else {
            Liveness::Missing
        }
    }

    /// Authoritative copy of a live entity.
    pub fn entity_state(&self, id: &Uuid) -> Option<EntityState> {
        match self.liveness(id) {
            Liveness::Live(EntityKind::Project) => Some(EntityState::Project(self.project.clone())),
            Liveness::Live(EntityKind::Track) => self.tracks.get(id).cloned().map(EntityState::Track),
            Liveness::Live(EntityKind::Clip) => self.clips.get(id).cloned().map(EntityState::Clip),
            Liveness::Live(EntityKind::Note) => self.notes.get(id).cloned().map(EntityState::Note),
            _ => None,
        }
    }

    /// IDs from the project root down to `id`, inclusive.
    pub fn path_of(&self, id: &Uuid) -> Option<Vec<Uuid>> {
        let root = self.project.id;
        match self.liveness(id) {
            Liveness::Live(EntityKind::Project) => Some(vec![root]),
            Liveness::Live(EntityKind::Track) => Some(vec![root, *id]),
            Liveness::Live(EntityKind::Clip) => {
                let clip = self.clips.get(id)?;
                Some(vec![root, clip.track_id, *id])
            }
            Liveness::Live(EntityKind::Note) => {
                let note = self.notes.get(id)?;
                let clip = self.clips.get(&note.clip_id)?;
                Some(vec![root, clip.track_id, note.clip_id, *id])
            }
            _ => None,
        }
    }

    /// Apply one operation, producing the next version.
    ///
    /// Deleting an already-deleted entity succeeds as a no-op (the version
    /// still advances). Any other reference to a deleted entity fails with
    /// [`ApplyError::TargetDeleted`], so a tombstoned ID can never come back.
    pub fn apply(&self, op: &OperationKind) -> Result<Document, ApplyError> {
        let mut next = self.clone();
        next.apply_in_place(op)?;
        next.version += 1;
        Ok(next)
    }

    fn apply_in_place(&mut self, op: &OperationKind) -> Result<(), ApplyError> {
        match op {
            OperationKind::InsertTrack { track_id, index, name, kind, color } => {
                self.ensure_unused(track_id)?;
                let track = Track {
                    id: *track_id,
                    name: name.clone(),
                    kind: *kind,
                    color: color.clone(),
                    clips: Vector::new(),
                };
                let len = self.project.tracks.len();
                match index {
                    Some(i) => self.project.tracks.insert((*i as usize).min(len), *track_id),
                    None => self.project.tracks.push_back(*track_id),
                }
                self.tracks.insert(*track_id, track);
            }

            OperationKind::DeleteTrack { track_id } => {
                if self.deleted_or_missing(track_id, EntityKind::Track)? {
                    return Ok(());
                }
                self.remove_track(track_id);
            }

            OperationKind::InsertClip { clip_id, track_id, start_time, end_time } => {
                self.require_live(track_id, EntityKind::Track)?;
                self.ensure_unused(clip_id)?;
                let clip = Clip {
                    id: *clip_id,
                    track_id: *track_id,
                    start_time: *start_time,
                    end_time: *end_time,
                    notes: Vector::new(),
                };
                if let Some(track) = self.tracks.get_mut(track_id) {
                    track.clips.push_back(*clip_id);
                }
                self.clips.insert(*clip_id, clip);
            }

            OperationKind::DeleteClip { clip_id } => {
                if self.deleted_or_missing(clip_id, EntityKind::Clip)? {
                    return Ok(());
                }
                self.remove_clip(clip_id, true);
            }

            OperationKind::MoveClip { clip_id, track_id, start_time } => {
                self.require_live(clip_id, EntityKind::Clip)?;
                self.require_live(track_id, EntityKind::Track)?;
                let clip = self.clips.get_mut(clip_id).ok_or(ApplyError::NotFound(*clip_id))?;
                let length = clip.length();
                let from = clip.track_id;
                clip.start_time = *start_time;
                clip.end_time = *start_time + length;
                clip.track_id = *track_id;
                if from != *track_id {
                    if let Some(old) = self.tracks.get_mut(&from) {
                        old.clips.retain(|id| id != clip_id);
                    }
                    if let Some(new) = self.tracks.get_mut(track_id) {
                        new.clips.push_back(*clip_id);
                    }
                }
            }

            OperationKind::InsertNote { note_id, clip_id, pitch, velocity, start_offset, duration } => {
                self.require_live(clip_id, EntityKind::Clip)?;
                self.ensure_unused(note_id)?;
                let note = Note {
                    id: *note_id,
                    clip_id: *clip_id,
                    pitch: *pitch,
                    velocity: *velocity,
                    start_offset: *start_offset,
                    duration: *duration,
                };
                if let Some(clip) = self.clips.get_mut(clip_id) {
                    clip.notes.push_back(*note_id);
                }
                self.notes.insert(*note_id, note);
            }

            OperationKind::DeleteNote { note_id } => {
                if self.deleted_or_missing(note_id, EntityKind::Note)? {
                    return Ok(());
                }
                if let Some(note) = self.notes.remove(note_id) {
                    if let Some(clip) = self.clips.get_mut(&note.clip_id) {
                        clip.notes.retain(|id| id != note_id);
                    }
                }
                self.tombstones.insert(*note_id, EntityKind::Note);
            }

            OperationKind::UpdateField { target, update } => self.update_field(target, update)?,
        }
        Ok(())
    }

    fn update_field(&mut self, target: &Uuid, update: &FieldUpdate) -> Result<(), ApplyError> {
        let kind = match self.liveness(target) {
            Liveness::Live(kind) => kind,
            Liveness::Deleted(_) => return Err(ApplyError::TargetDeleted(*target)),
            Liveness::Missing => return Err(ApplyError::NotFound(*target)),
        };
        let field = update.field();
        if field.entity_kind() != kind {
            return Err(ApplyError::InvalidTarget { id: *target, kind, field });
        }

        match update {
            FieldUpdate::ProjectTitle(v) => self.project.title = v.clone(),
            FieldUpdate::Tempo(v) => self.project.tempo = *v,
            FieldUpdate::Key(v) => self.project.key = v.clone(),
            FieldUpdate::Meter(v) => self.project.meter = *v,
            FieldUpdate::TrackName(v) => self.track_mut(target)?.name = v.clone(),
            FieldUpdate::TrackKind(v) => self.track_mut(target)?.kind = *v,
            FieldUpdate::TrackColor(v) => self.track_mut(target)?.color = v.clone(),
            FieldUpdate::ClipStart(v) => {
                let clip = self.clip_mut(target)?;
                if *v >= clip.end_time {
                    return Err(ApplyError::InvalidRange { start: *v, end: clip.end_time });
                }
                clip.start_time = *v;
            }
            FieldUpdate::ClipEnd(v) => {
                let clip = self.clip_mut(target)?;
                if clip.start_time >= *v {
                    return Err(ApplyError::InvalidRange { start: clip.start_time, end: *v });
                }
                clip.end_time = *v;
            }
            FieldUpdate::NotePitch(v) => self.note_mut(target)?.pitch = *v,
            FieldUpdate::NoteVelocity(v) => self.note_mut(target)?.velocity = *v,
            FieldUpdate::NoteStartOffset(v) => self.note_mut(target)?.start_offset = *v,
            FieldUpdate::NoteDuration(v) => self.note_mut(target)?.duration = *v,
        }
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn track_mut(&mut self, id: &Uuid) -> Result<&mut Track, ApplyError> {
        self.tracks.get_mut(id).ok_or(ApplyError::NotFound(*id))
    }

    fn clip_mut(&mut self, id: &Uuid) -> Result<&mut Clip, ApplyError> {
        self.clips.get_mut(id).ok_or(ApplyError::NotFound(*id))
    }

    fn note_mut(&mut self, id: &Uuid) -> Result<&mut Note, ApplyError> {
        self.notes.get_mut(id).ok_or(ApplyError::NotFound(*id))
    }

    /// IDs are never reused, including IDs of deleted entities.
    fn ensure_unused(&self, id: &Uuid) -> Result<(), ApplyError> {
        match self.liveness(id) {
            Liveness::Missing => Ok(()),
            _ => Err(ApplyError::DuplicateId(*id)),
        }
    }

    fn require_live(&self, id: &Uuid, expected: EntityKind) -> Result<(), ApplyError> {
        match self.liveness(id) {
            Liveness::Live(kind) if kind == expected => Ok(()),
            Liveness::Deleted(kind) if kind == expected => Err(ApplyError::TargetDeleted(*id)),
            _ => Err(ApplyError::NotFound(*id)),
        }
    }

    /// `Ok(true)` if the entity is already deleted (delete becomes a no-op).
    fn deleted_or_missing(&self, id: &Uuid, expected: EntityKind) -> Result<bool, ApplyError> {
        match self.liveness(id) {
            Liveness::Live(kind) if kind == expected => Ok(false),
            Liveness::Deleted(kind) if kind == expected => Ok(true),
            _ => Err(ApplyError::NotFound(*id)),
        }
    }

    fn remove_track(&mut self, id: &Uuid) {
        if let Some(track) = self.tracks.remove(id) {
            debug!("Deleting track {} with {} clip(s)", id, track.clips.len());
            for clip_id in track.clips.iter() {
                self.remove_clip(clip_id, false);
            }
            self.project.tracks.retain(|t| t != id);
            self.tombstones.insert(*id, EntityKind::Track);
        }
    }

    fn remove_clip(&mut self, id: &Uuid, detach: bool) {
        if let Some(clip) = self.clips.remove(id) {
            for note_id in clip.notes.iter() {
                self.notes.remove(note_id);
                self.tombstones.insert(*note_id, EntityKind::Note);
            }
            if detach {
                if let Some(track) = self.tracks.get_mut(&clip.track_id) {
                    track.clips.retain(|c| c != id);
                }
            }
            self.tombstones.insert(*id, EntityKind::Clip);
        }
    }

    /// Check the structural invariants of the hierarchy.
    ///
    /// Every child list entry must resolve to a live entity pointing back at
    /// its parent, IDs are unique within each list, clip ranges are valid,
    /// and no live ID is also tombstoned.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for id in self.project.tracks.iter() {
            if !seen.insert(*id) {
                return Err(format!("track {id} listed twice"));
            }
            let track = self.tracks.get(id).ok_or_else(|| format!("dangling track {id}"))?;
            let mut clips_seen = HashSet::new();
            for clip_id in track.clips.iter() {
                if !clips_seen.insert(*clip_id) {
                    return Err(format!("clip {clip_id} listed twice in track {id}"));
                }
                let clip = self.clips.get(clip_id).ok_or_else(|| format!("dangling clip {clip_id}"))?;
                if clip.track_id != *id {
                    return Err(format!("clip {clip_id} parent mismatch"));
                }
                if !(0.0 <= clip.start_time && clip.start_time < clip.end_time) {
                    return Err(format!("clip {clip_id} has invalid range"));
                }
                let mut notes_seen = HashSet::new();
                for note_id in clip.notes.iter() {
                    if !notes_seen.insert(*note_id) {
                        return Err(format!("note {note_id} listed twice in clip {clip_id}"));
                    }
                    let note = self.notes.get(note_id).ok_or_else(|| format!("dangling note {note_id}"))?;
                    if note.clip_id != *clip_id {
                        return Err(format!("note {note_id} parent mismatch"));
                    }
                }
            }
        }
        if seen.len() != self.tracks.len() {
            return Err("unlisted track in arena".to_string());
        }
        let listed_clips: usize = self.tracks.values().map(|t| t.clips.len()).sum();
        let listed_notes: usize = self.clips.values().map(|c| c.notes.len()).sum();
        if listed_clips != self.clips.len() || listed_notes != self.notes.len() {
            return Err("unlisted entity in arena".to_string());
        }
        let live = self.tracks.keys().chain(self.clips.keys()).chain(self.notes.keys());
        for id in live {
            if self.tombstones.contains_key(id) {
                return Err(format!("live entity {id} is tombstoned"));
            }
        }
        Ok(())
    }
}
