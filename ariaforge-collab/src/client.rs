//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, leave)
//! - A mirror of the session document, kept in global sequence order
//! - Operation submission against the mirror's version, with retry
//! - Cursor presence updates

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ariaforge_core::{ApplyError, Document, EntityState, Operation, OperationKind};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    ClientMessage, Cursor, ProtocolError, RejectReason, SequencedOperation, ServerMessage, SessionState,
    StateReason,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, join not yet answered
    Connected,
    Joined,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Join accepted; the mirror is at `document_version`
    Joined {
        user_id: Uuid,
        document_version: u64,
        /// Local state was replaced after a server-side rebuild
        resync: bool,
    },
    JoinRejected(RejectReason),
    /// Another member's operation, already applied to the mirror
    RemoteOperation {
        global_seq: u64,
        op: Operation,
        origin_user_id: Uuid,
    },
    OperationApplied {
        operation_id: Uuid,
        global_seq: u64,
    },
    OperationRejected {
        operation_id: Uuid,
        reason: RejectReason,
        corrected_state: Option<EntityState>,
    },
    /// Retry with [`SyncClient::retry`]
    OperationTimedOut(Uuid),
    Presence {
        user_id: Uuid,
        cursor: Cursor,
    },
    PresenceLeft(Uuid),
    SessionState {
        state: SessionState,
        reason: Option<StateReason>,
    },
    Degraded(bool),
    Error(RejectReason),
    Pong(u64),
    /// The mirror can no longer follow the session; rejoin for a snapshot
    OutOfSync(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MirrorError {
    #[error("Sequence {seq} could not be applied: {source}")]
    Diverged { seq: u64, source: ApplyError },
    #[error("Waiting for sequence {expected} with {buffered} later operations buffered")]
    GapTooLarge { expected: u64, buffered: usize },
}

/// Local copy of the session document.
///
/// Sequenced operations may arrive out of order (a reply on one path, a
/// broadcast on another); anything ahead of `version + 1` waits in the
/// reorder buffer until the gap fills.
#[derive(Debug, Clone)]
pub struct Mirror {
    document: Document,
    reorder: BTreeMap<u64, Operation>,
    max_buffered: usize,
}

impl Mirror {
    pub fn new(project_id: Uuid) -> Self {
        Self::from_document(Document::new(project_id))
    }

    pub fn from_document(document: Document) -> Self {
        Self {
            document,
            reorder: BTreeMap::new(),
            max_buffered: 1024,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn version(&self) -> u64 {
        self.document.version()
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Replace local state with a server snapshot.
    pub fn reset(&mut self, document: Document) {
        let version = document.version();
        self.document = document;
        self.reorder = self.reorder.split_off(&(version + 1));
    }

    /// Accept a sequenced operation. Returns how many operations were
    /// applied (zero while it waits for an earlier one).
    pub fn accept(&mut self, global_seq: u64, op: Operation) -> Result<usize, MirrorError> {
        if global_seq <= self.version() {
            return Ok(0);
        }
        self.reorder.insert(global_seq, op);

        let mut applied = 0;
        while let Some(op) = self.reorder.remove(&(self.version() + 1)) {
            let seq = self.version() + 1;
            self.document = self
                .document
                .apply(&op.kind)
                .map_err(|source| MirrorError::Diverged { seq, source })?;
            applied += 1;
        }

        if self.reorder.len() > self.max_buffered {
            return Err(MirrorError::GapTooLarge {
                expected: self.version() + 1,
                buffered: self.reorder.len(),
            });
        }
        Ok(applied)
    }

    pub fn accept_all(&mut self, operations: Vec<SequencedOperation>) -> Result<usize, MirrorError> {
        let mut applied = 0;
        for sequenced in operations {
            applied += self.accept(sequenced.global_seq, sequenced.operation)?;
        }
        Ok(applied)
    }
}

struct ClientState {
    mirror: Mirror,
    user_id: Option<Uuid>,
    /// Submitted, not yet answered (or timed out)
    in_flight: HashMap<Uuid, Operation>,
    /// A join succeeded at least once; reconnects ask for catch-up
    joined_once: bool,
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server and keeps
/// a mirror of the session document.
pub struct SyncClient {
    session_id: Uuid,
    project_id: Uuid,
    token: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Mirror and in-flight operations, shared with the reader task
    shared: Arc<RwLock<ClientState>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(session_id: Uuid, project_id: Uuid, token: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            session_id,
            project_id,
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            shared: Arc::new(RwLock::new(ClientState {
                mirror: Mirror::new(project_id),
                user_id: None,
                in_flight: HashMap::new(),
                joined_once: false,
            })),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and send the join.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. A
    /// client that joined before asks for catch-up from its mirror version.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let last_known_sequence = {
            let shared = self.shared.read().await;
            shared.joined_once.then(|| shared.mirror.version())
        };
        self.send(&ClientMessage::Join {
            session_id: self.session_id,
            project_id: self.project_id,
            token: self.token.clone(),
            last_known_sequence,
        })
        .await?;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(server_msg) => {
                                let event = Self::on_server_message(server_msg, &shared, &state).await;
                                if let Some(evt) = event {
                                    let _ = event_tx.send(evt).await;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode server message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Fold one server message into local state and translate it into an event.
    async fn on_server_message(
        msg: ServerMessage,
        shared: &RwLock<ClientState>,
        state: &RwLock<ConnectionState>,
    ) -> Option<SyncEvent> {
        let mut shared = shared.write().await;
        let event = match msg {
            ServerMessage::Catchup { user_id, document_version, operations } => {
                shared.user_id = Some(user_id);
                shared.joined_once = true;
                *state.write().await = ConnectionState::Joined;
                if let Err(e) = shared.mirror.accept_all(operations) {
                    return Some(SyncEvent::OutOfSync(e.to_string()));
                }
                SyncEvent::Joined { user_id, document_version, resync: false }
            }
            ServerMessage::Snapshot { user_id, document_version, document, resync } => {
                shared.user_id = Some(user_id);
                shared.joined_once = true;
                shared.mirror.reset(document);
                if resync {
                    shared.in_flight.clear();
                }
                *state.write().await = ConnectionState::Joined;
                SyncEvent::Joined { user_id, document_version, resync }
            }
            ServerMessage::JoinRejected { reason } => SyncEvent::JoinRejected(reason),
            ServerMessage::OperationApplied { operation_id, global_seq, applied } => {
                if let Some(mut op) = shared.in_flight.remove(&operation_id) {
                    if let Some(kind) = applied {
                        op.kind = kind;
                    }
                    if let Err(e) = shared.mirror.accept(global_seq, op) {
                        return Some(SyncEvent::OutOfSync(e.to_string()));
                    }
                }
                SyncEvent::OperationApplied { operation_id, global_seq }
            }
            ServerMessage::OperationRejected { operation_id, reason, corrected_state } => {
                shared.in_flight.remove(&operation_id);
                SyncEvent::OperationRejected { operation_id, reason, corrected_state }
            }
            ServerMessage::OperationTimedOut { operation_id } => SyncEvent::OperationTimedOut(operation_id),
            ServerMessage::OperationBroadcast { global_seq, op, origin_user_id } => {
                if let Err(e) = shared.mirror.accept(global_seq, op.clone()) {
                    return Some(SyncEvent::OutOfSync(e.to_string()));
                }
                SyncEvent::RemoteOperation { global_seq, op, origin_user_id }
            }
            ServerMessage::PresenceBroadcast { user_id, cursor } => {
                log::trace!("Presence from {user_id}");
                SyncEvent::Presence { user_id, cursor }
            }
            ServerMessage::PresenceLeft { user_id } => SyncEvent::PresenceLeft(user_id),
            ServerMessage::SessionState { state, reason } => SyncEvent::SessionState { state, reason },
            ServerMessage::SessionDegraded { degraded } => SyncEvent::Degraded(degraded),
            ServerMessage::Error { reason } => SyncEvent::Error(reason),
            ServerMessage::Pong { nonce } => SyncEvent::Pong(nonce),
        };
        Some(event)
    }

    /// Submit an operation based on the mirror's current version.
    ///
    /// Returns the operation ID; the outcome arrives as an event.
    pub async fn submit(&self, kind: OperationKind) -> Result<Uuid, ProtocolError> {
        let op = {
            let mut shared = self.shared.write().await;
            let user_id = shared.user_id.ok_or(ProtocolError::NotConnected)?;
            let op = Operation::new(self.session_id, user_id, shared.mirror.version(), kind);
            shared.in_flight.insert(op.id, op.clone());
            op
        };
        let id = op.id;
        self.send(&ClientMessage::SubmitOperation { op }).await?;
        Ok(id)
    }

    /// Resend an unanswered operation with a fresh base version. The server
    /// recognizes it if the first attempt was accepted after all.
    pub async fn retry(&self, operation_id: Uuid) -> Result<(), ProtocolError> {
        let op = {
            let mut shared = self.shared.write().await;
            let version = shared.mirror.version();
            let op = shared.in_flight.get_mut(&operation_id).ok_or(ProtocolError::NotConnected)?;
            op.base_version = version;
            op.clone()
        };
        self.send(&ClientMessage::SubmitOperation { op }).await
    }

    /// Send a cursor update. Silently dropped while not joined.
    pub async fn update_presence(&self, cursor: Cursor) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Joined {
            return Ok(());
        }
        self.send(&ClientMessage::PresenceUpdate { cursor }).await
    }

    /// Ask the server to end the session (owner only).
    pub async fn end_session(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::EndSession).await
    }

    /// Leave the session; the server closes the connection.
    pub async fn leave(&mut self) -> Result<(), ProtocolError> {
        let result = self.send(&ClientMessage::Leave).await;
        self.outgoing_tx = None;
        result
    }

    /// Send a ping to the server.
    pub async fn ping(&self, nonce: u64) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping { nonce }).await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::NotConnected)?;
        tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Copy of the mirrored document.
    pub async fn document(&self) -> Document {
        self.shared.read().await.mirror.document().clone()
    }

    pub async fn version(&self) -> u64 {
        self.shared.read().await.mirror.version()
    }

    /// User ID assigned by the server on join.
    pub async fn user_id(&self) -> Option<Uuid> {
        self.shared.read().await.user_id
    }

    pub async fn in_flight(&self) -> usize {
        self.shared.read().await.in_flight.len()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
