//! Property tests over random concurrent operation streams.
//!
//! Operations draw their targets from a small fixed pool of IDs so that
//! inserts, deletes and updates collide often, and each one is based on a
//! randomly stale version to simulate concurrent clients.

use ariaforge_collab::client::Mirror;
use ariaforge_collab::oplog::LogConfig;
use ariaforge_collab::sequencer::{Decision, Sequencer};
use ariaforge_core::{Document, FieldUpdate, Operation, OperationKind, TrackKind};
use proptest::prelude::*;
use uuid::Uuid;

struct Pool {
    tracks: Vec<Uuid>,
    clips: Vec<Uuid>,
    notes: Vec<Uuid>,
}

impl Pool {
    fn new() -> Self {
        let ids = |n| (0..n).map(|_| Uuid::new_v4()).collect();
        Self { tracks: ids(3), clips: ids(4), notes: ids(6) }
    }
}

/// An operation described by pool indices, resolved against a [`Pool`].
#[derive(Debug, Clone)]
enum Intent {
    InsertTrack(usize),
    DeleteTrack(usize),
    RenameTrack(usize, u8),
    InsertClip(usize, usize, u8),
    MoveClip(usize, usize, u8),
    DeleteClip(usize),
    InsertNote(usize, usize, u8),
    SetVelocity(usize, u8),
    DeleteNote(usize),
}

impl Intent {
    fn resolve(&self, pool: &Pool) -> OperationKind {
        match *self {
            Intent::InsertTrack(t) => OperationKind::InsertTrack {
                track_id: pool.tracks[t],
                index: None,
                name: format!("Track {t}"),
                kind: TrackKind::Midi,
                color: "#445566".into(),
            },
            Intent::DeleteTrack(t) => OperationKind::DeleteTrack { track_id: pool.tracks[t] },
            Intent::RenameTrack(t, n) => OperationKind::UpdateField {
                target: pool.tracks[t],
                update: FieldUpdate::TrackName(format!("Take {n}")),
            },
            Intent::InsertClip(c, t, at) => OperationKind::InsertClip {
                clip_id: pool.clips[c],
                track_id: pool.tracks[t],
                start_time: at as f64,
                end_time: at as f64 + 4.0,
            },
            Intent::MoveClip(c, t, at) => OperationKind::MoveClip {
                clip_id: pool.clips[c],
                track_id: pool.tracks[t],
                start_time: at as f64,
            },
            Intent::DeleteClip(c) => OperationKind::DeleteClip { clip_id: pool.clips[c] },
            Intent::InsertNote(n, c, pitch) => OperationKind::InsertNote {
                note_id: pool.notes[n],
                clip_id: pool.clips[c],
                pitch: pitch % 128,
                velocity: 90,
                start_offset: 0.0,
                duration: 1.0,
            },
            Intent::SetVelocity(n, v) => OperationKind::UpdateField {
                target: pool.notes[n],
                update: FieldUpdate::NoteVelocity(v % 128),
            },
            Intent::DeleteNote(n) => OperationKind::DeleteNote { note_id: pool.notes[n] },
        }
    }
}

fn intent() -> impl Strategy<Value = Intent> {
    prop_oneof![
        3 => (0..3usize).prop_map(Intent::InsertTrack),
        1 => (0..3usize).prop_map(Intent::DeleteTrack),
        2 => (0..3usize, any::<u8>()).prop_map(|(t, n)| Intent::RenameTrack(t, n)),
        3 => (0..4usize, 0..3usize, 0..64u8).prop_map(|(c, t, at)| Intent::InsertClip(c, t, at)),
        2 => (0..4usize, 0..3usize, 0..64u8).prop_map(|(c, t, at)| Intent::MoveClip(c, t, at)),
        1 => (0..4usize).prop_map(Intent::DeleteClip),
        3 => (0..6usize, 0..4usize, any::<u8>()).prop_map(|(n, c, p)| Intent::InsertNote(n, c, p)),
        2 => (0..6usize, any::<u8>()).prop_map(|(n, v)| Intent::SetVelocity(n, v)),
        1 => (0..6usize).prop_map(Intent::DeleteNote),
    ]
}

/// Each intent paired with how many versions behind the head its base is.
fn stream() -> impl Strategy<Value = Vec<(Intent, u64)>> {
    prop::collection::vec((intent(), 0..4u64), 1..80)
}

struct Run {
    sequencer: Sequencer,
    accepted: Vec<(u64, Operation)>,
    snapshots: Vec<Document>,
}

fn run(pool: &Pool, ops: &[(Intent, u64)]) -> Run {
    let session = Uuid::new_v4();
    let mut sequencer = Sequencer::new(session, Document::new(Uuid::new_v4()), LogConfig::default());
    let mut accepted = Vec::new();
    let mut snapshots = vec![sequencer.document().clone()];

    for (intent, lag) in ops {
        let base = sequencer.version().saturating_sub(*lag);
        let op = Operation::new(session, Uuid::new_v4(), base, intent.resolve(pool));
        if let Decision::Applied { entry, .. } = sequencer.submit(op) {
            accepted.push((entry.global_seq, entry.operation));
        }
        snapshots.push(sequencer.document().clone());
    }
    Run { sequencer, accepted, snapshots }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sequence_numbers_are_contiguous(ops in stream()) {
        let pool = Pool::new();
        let run = run(&pool, &ops);

        for (i, (seq, _)) in run.accepted.iter().enumerate() {
            prop_assert_eq!(*seq, i as u64 + 1);
        }
        prop_assert_eq!(run.sequencer.version(), run.accepted.len() as u64);
        for pair in run.snapshots.windows(2) {
            prop_assert!(pair[1].version() >= pair[0].version());
        }
    }

    #[test]
    fn prop_replay_matches_live_document(ops in stream()) {
        let pool = Pool::new();
        let run = run(&pool, &ops);

        let replayed = run.sequencer.log().replay().unwrap();
        prop_assert_eq!(&replayed, run.sequencer.document());
        prop_assert!(run.sequencer.document().check_invariants().is_ok());
    }

    #[test]
    fn prop_tombstones_are_permanent(ops in stream()) {
        let pool = Pool::new();
        let run = run(&pool, &ops);
        let ids: Vec<Uuid> = pool.tracks.iter().chain(&pool.clips).chain(&pool.notes).copied().collect();

        for pair in run.snapshots.windows(2) {
            for id in &ids {
                if pair[0].is_tombstoned(id) {
                    prop_assert!(pair[1].is_tombstoned(id));
                    prop_assert!(pair[1].entity_state(id).is_none());
                }
            }
        }
    }

    #[test]
    fn prop_mirrors_converge_under_reordered_delivery(ops in stream(), seed in any::<u64>()) {
        let pool = Pool::new();
        let run = run(&pool, &ops);

        // Deliver the broadcast stream out of order; the reorder buffer
        // must still apply it in sequence.
        let mut delivery = run.accepted.clone();
        let mut state = seed | 1;
        for i in (1..delivery.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            delivery.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let project_id = run.sequencer.document().project_id();
        let mut mirror = Mirror::new(project_id);
        for (seq, op) in delivery {
            mirror.accept(seq, op).unwrap();
        }
        prop_assert_eq!(mirror.buffered(), 0);
        prop_assert_eq!(mirror.document(), run.sequencer.document());
    }
}
