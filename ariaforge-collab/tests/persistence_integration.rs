//! Persistence integration tests.
//!
//! Verifies:
//! - Flushed session state survives closing and reopening the store
//! - A restarted session restores its log from RocksDB
//! - Compaction snapshots are written and used on restart
//! - A tampered log entry forces a snapshot resync
//! - Sessions on different projects stay isolated

use std::sync::Arc;
use std::time::Duration;

use ariaforge_collab::broadcast::Frame;
use ariaforge_collab::identity::Role;
use ariaforge_collab::oplog::{LogConfig, LogEntry};
use ariaforge_collab::session::{JoinOutcome, JoinRequest, SessionConfig, SessionHandle, SubmitOutcome};
use ariaforge_collab::storage::{RocksStore, SessionStore, StoreConfig, StoreError};
use ariaforge_core::{Operation, OperationKind, TrackKind};
use tempfile::tempdir;
use tokio::sync::mpsc;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Joined {
    user_id: Uuid,
    connection_id: Uuid,
    outcome: JoinOutcome,
    _outbox: mpsc::Receiver<Frame>,
}

async fn join(handle: &SessionHandle, role: Role, last_known: Option<u64>) -> Joined {
    let (tx, rx) = mpsc::channel(256);
    let user_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    let outcome = handle
        .join(JoinRequest {
            user_id,
            connection_id,
            role,
            project_id: handle.project_id(),
            last_known_sequence: last_known,
            outbox: tx,
        })
        .await
        .unwrap();
    Joined { user_id, connection_id, outcome, _outbox: rx }
}

fn track_op(session_id: Uuid, user_id: Uuid, base: u64, name: &str) -> Operation {
    Operation::new(
        session_id,
        user_id,
        base,
        OperationKind::InsertTrack {
            track_id: Uuid::new_v4(),
            index: None,
            name: name.into(),
            kind: TrackKind::Audio,
            color: "#AA3300".into(),
        },
    )
}

async fn submit_tracks(handle: &SessionHandle, member: &Joined, count: u64) {
    for _ in 0..count {
        let base = handle.version();
        let op = track_op(handle.session_id(), member.user_id, base, &format!("Take {base}"));
        let outcome = handle.submit(member.user_id, member.connection_id, op).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Accepted { .. }), "got {outcome:?}");
    }
}

/// Reopen the database once every session holding it has shut down.
async fn reopen(path: &std::path::Path) -> RocksStore {
    for _ in 0..100 {
        match RocksStore::open(StoreConfig::for_testing(path)) {
            Ok(store) => return store,
            Err(StoreError::Database(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("Unexpected store error: {e}"),
        }
    }
    panic!("Database lock was never released");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_flushed_session_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let project = Uuid::new_v4();
    let session_id = Uuid::new_v4();

    {
        let store: Arc<dyn SessionStore> = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
        let handle = SessionHandle::spawn(session_id, project, store, SessionConfig::for_testing());
        let owner = join(&handle, Role::Owner, None).await;
        submit_tracks(&handle, &owner, 3).await;

        handle.end(owner.user_id, owner.connection_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle.wait_ended()).await.unwrap();
    }

    let store = reopen(&path).await;
    let doc = store.load_document(project).unwrap();
    assert_eq!(doc.version(), 3);
    assert_eq!(doc.track_count(), 3);
    // The flush folded the session log into the project.
    assert!(store.load_operations_since(session_id, 0).unwrap().is_empty());
    assert_eq!(store.list_projects().unwrap(), vec![project]);
}

#[tokio::test]
async fn test_restarted_session_restores_log() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let project = Uuid::new_v4();
    let session_id = Uuid::new_v4();

    let first = SessionHandle::spawn(session_id, project, store.clone(), SessionConfig::for_testing());
    let editor = join(&first, Role::Editor, None).await;
    submit_tracks(&first, &editor, 4).await;
    assert_eq!(store.load_operations_since(session_id, 0).unwrap().len(), 4);
    let expected = first.document();

    // A second actor over the same session loads what the first persisted.
    let second = SessionHandle::spawn(session_id, project, store.clone(), SessionConfig::for_testing());
    let rejoin = join(&second, Role::Editor, Some(2)).await;
    match rejoin.outcome {
        JoinOutcome::Catchup { document_version, operations } => {
            assert_eq!(document_version, 4);
            assert_eq!(operations.iter().map(|o| o.global_seq).collect::<Vec<_>>(), vec![3, 4]);
        }
        other => panic!("Expected catchup, got {other:?}"),
    }
    assert_eq!(second.document(), expected);
}

#[tokio::test]
async fn test_compaction_snapshot_used_on_restart() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let project = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let config = SessionConfig { log: LogConfig::for_testing(), ..SessionConfig::for_testing() };

    let first = SessionHandle::spawn(session_id, project, store.clone(), config.clone());
    let editor = join(&first, Role::Editor, None).await;
    submit_tracks(&first, &editor, 12).await;

    // Compaction waits for the grace period while the member lags.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let (snapshot_seq, snapshot) = loop {
        if let Some(found) = store.load_snapshot(session_id).unwrap() {
            break found;
        }
        assert!(tokio::time::Instant::now() < deadline, "No snapshot was written");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(snapshot_seq > 0);
    assert_eq!(snapshot.version(), snapshot_seq);
    assert!(store.load_operations_since(session_id, 0).unwrap().iter().all(|e| e.global_seq > snapshot_seq));

    let second = SessionHandle::spawn(session_id, project, store.clone(), config);
    let fresh = join(&second, Role::Viewer, Some(0)).await;
    match fresh.outcome {
        JoinOutcome::Snapshot { document_version, document, resync } => {
            assert_eq!(document_version, 12);
            assert!(!resync);
            assert_eq!(document, first.document());
        }
        other => panic!("Expected snapshot for a client behind the window, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tampered_entry_forces_resync() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let project = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let author = Uuid::new_v4();

    let good = LogEntry::new(1, track_op(session_id, author, 0, "Kept")).unwrap();
    let mut bad = LogEntry::new(2, track_op(session_id, author, 1, "Tampered")).unwrap();
    bad.checksum ^= 0xdead_beef;
    store.append_operations(session_id, &[good, bad]).unwrap();

    let handle = SessionHandle::spawn(session_id, project, store.clone(), SessionConfig::for_testing());
    let member = join(&handle, Role::Editor, Some(2)).await;
    match member.outcome {
        JoinOutcome::Snapshot { document_version, resync, .. } => {
            assert!(resync);
            assert_eq!(document_version, 0);
        }
        other => panic!("Expected resync snapshot, got {other:?}"),
    }
    // Everything after the last good snapshot was discarded.
    assert!(store.load_operations_since(session_id, 0).unwrap().is_empty());
    assert_eq!(handle.version(), 0);
}

#[tokio::test]
async fn test_projects_isolated() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let (project_a, project_b) = (Uuid::new_v4(), Uuid::new_v4());

    let a = SessionHandle::spawn(Uuid::new_v4(), project_a, store.clone(), SessionConfig::for_testing());
    let b = SessionHandle::spawn(Uuid::new_v4(), project_b, store.clone(), SessionConfig::for_testing());
    let owner_a = join(&a, Role::Owner, None).await;
    let owner_b = join(&b, Role::Owner, None).await;
    submit_tracks(&a, &owner_a, 2).await;
    submit_tracks(&b, &owner_b, 5).await;

    a.end(owner_a.user_id, owner_a.connection_id).await.unwrap();
    b.end(owner_b.user_id, owner_b.connection_id).await.unwrap();
    a.wait_ended().await;
    b.wait_ended().await;

    assert_eq!(store.load_document(project_a).unwrap().track_count(), 2);
    assert_eq!(store.load_document(project_b).unwrap().track_count(), 5);
}
