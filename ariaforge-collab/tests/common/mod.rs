//! Helpers shared by the socket-level integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ariaforge_collab::client::{SyncClient, SyncEvent};
use ariaforge_collab::identity::{Role, StaticIdentity};
use ariaforge_collab::server::{ServerConfig, SyncServer};
use ariaforge_core::{OperationKind, TrackKind};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

pub const OWNER: &str = "alice-token";
pub const EDITOR: &str = "bob-token";
pub const SECOND_EDITOR: &str = "carol-token";
pub const VIEWER: &str = "victor-token";

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn identities() -> StaticIdentity {
    StaticIdentity::new()
        .with_user(OWNER, Uuid::new_v4(), Role::Owner)
        .with_user(EDITOR, Uuid::new_v4(), Role::Editor)
        .with_user(SECOND_EDITOR, Uuid::new_v4(), Role::Editor)
        .with_user(VIEWER, Uuid::new_v4(), Role::Viewer)
}

/// Start a server on a free port, return its URL.
pub async fn start_test_server() -> String {
    start_server_with(|config| config).await
}

pub async fn start_server_with(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> String {
    let port = free_port().await;
    let config = configure(ServerConfig::for_testing(format!("127.0.0.1:{port}")));
    let server = SyncServer::open(config, Arc::new(identities())).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

/// Connect, join and wait for the join reply.
pub async fn joined_client(
    url: &str,
    session_id: Uuid,
    project_id: Uuid,
    token: &str,
) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(session_id, project_id, token, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Joined { .. })).await;
    (client, events)
}

/// Poll until the client's mirror reaches `version`.
pub async fn wait_for_version(client: &SyncClient, version: u64) {
    timeout(Duration::from_secs(3), async {
        while client.version().await < version {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Mirror never reached the expected version");
}

pub fn insert_track(name: &str) -> OperationKind {
    OperationKind::InsertTrack {
        track_id: Uuid::new_v4(),
        index: None,
        name: name.into(),
        kind: TrackKind::Midi,
        color: "#22AA88".into(),
    }
}
