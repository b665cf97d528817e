//! WebSocket sync server with session-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── Sequencer ── OperationLog
//!             ├── SessionRegistry ── Session actor (session_id)
//! Client B ──┘     (lazy start)         ├── Dispatcher ── outbox per member
//!                                       ├── PresenceTracker
//!                                       └── SessionStore (RocksDB | memory)
//!                                                │
//!                          ┌─────────────────────┼──────────┐
//!                          ▼                     ▼          ▼
//!                       Client A             Client B    Client C
//! ```
//!
//! Each connection task owns its socket. It forwards client messages to the
//! session actor and drains three sources back to the socket: the member's
//! ordered outbox, the session presence channel and its own replies.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::identity::IdentityProvider;
use crate::presence::PresenceFrame;
use crate::protocol::{ClientMessage, ProtocolError, RejectReason, ServerMessage};
use crate::registry::SessionRegistry;
use crate::session::{JoinOutcome, JoinRequest, SessionConfig, SessionError, SessionHandle, SubmitOutcome};
use crate::storage::{MemoryStore, RocksStore, SessionStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Frames queued per member before it is evicted
    pub outbox_capacity: usize,
    /// Longest a client waits for the sequencer before `OperationTimedOut`
    pub submit_timeout: Duration,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Per-session settings
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            outbox_capacity: 256,
            submit_timeout: Duration::from_secs(5),
            heartbeat_interval_secs: 10,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Config for testing (in-memory, fast session housekeeping).
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            outbox_capacity: 64,
            submit_timeout: Duration::from_secs(2),
            heartbeat_interval_secs: 1,
            session: SessionConfig::for_testing(),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub joins_rejected: u64,
    pub operations_accepted: u64,
    pub operations_rejected: u64,
    pub operations_timed_out: u64,
    pub active_sessions: usize,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    /// Live sessions: session_id → actor handle
    registry: Arc<SessionRegistry>,
    identity: Arc<dyn IdentityProvider>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server over an already opened store.
    pub fn new(config: ServerConfig, store: Arc<dyn SessionStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        let registry = Arc::new(SessionRegistry::new(store, config.session.clone()));
        Self {
            config,
            registry,
            identity,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create a server, opening RocksDB at `storage_path` or falling back
    /// to the in-memory store.
    pub fn open(config: ServerConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self, ServerError> {
        let store: Arc<dyn SessionStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                let store = RocksStore::open(store_config)?;
                log::info!("Opened session store at {}", path.display());
                Arc::new(store)
            }
            None => {
                log::warn!("No storage path configured; sessions are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, store, identity))
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let identity = self.identity.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, identity, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        identity: Arc<dyn IdentityProvider>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            addr,
            connection_id: Uuid::new_v4(),
            sender: ws_sender,
            member: None,
            outbox: None,
            presence: None,
            registry,
            identity,
            stats: stats.clone(),
            config,
        };
        let mut heartbeat = tokio::time::interval(Duration::from_secs(conn.config.heartbeat_interval_secs.max(1)));

        let result = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = conn.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match ClientMessage::decode(&bytes) {
                                Ok(client_msg) => match conn.on_message(client_msg).await {
                                    Ok(true) => {}
                                    Ok(false) => break Ok(()),
                                    Err(e) => break Err(e),
                                },
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = conn.sender.send(Message::Pong(data)).await {
                                break Err(ServerError::from(e));
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        _ => {}
                    }
                }

                // Ordered session traffic for this member
                frame = next_frame(&mut conn.outbox) => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = conn.send_frame(&frame).await {
                                break Err(e);
                            }
                        }
                        None => {
                            // Evicted, or the session ended.
                            log::info!("Outbox of {addr} closed; closing connection");
                            let _ = conn.sender.send(Message::Close(None)).await;
                            break Ok(());
                        }
                    }
                }

                // Presence from other members
                presence = next_presence(&mut conn.presence) => {
                    match presence {
                        Ok(update) => {
                            if Some(update.origin) == conn.user_id() {
                                continue; // Skip own cursor
                            }
                            if let Err(e) = conn.send_frame(&update.frame).await {
                                break Err(e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("Connection {addr} skipped {n} presence frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            conn.presence = None;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(member) = &conn.member {
                        member.session.presence().touch(&member.user_id);
                    }
                }
            }
        };

        // Cleanup: leave the session
        if let Some(member) = conn.member.take() {
            member.session.leave(member.user_id, conn.connection_id).await;
            log::info!("User {} disconnected from session {}", member.user_id, member.session.session_id());
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

async fn next_frame(outbox: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match outbox {
        Some(rx) => rx.recv().await,
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}

/// Await `pending` while forwarding outbox frames to `sink`, so a member
/// waiting on its own reply keeps consuming session traffic.
async fn forward_while<F, S>(
    pending: F,
    outbox: &mut Option<mpsc::Receiver<Frame>>,
    sink: &mut S,
) -> Result<F::Output, S::Error>
where
    F: Future,
    S: Sink<Message> + Unpin,
{
    tokio::pin!(pending);
    let mut open = true;
    loop {
        tokio::select! {
            output = &mut pending => return Ok(output),
            frame = next_frame(outbox), if open => match frame {
                Some(frame) => sink.send(Message::Binary(frame.to_vec().into())).await?,
                // Left for the connection loop to notice after the reply.
                None => open = false,
            },
        }
    }
}

async fn next_presence(
    presence: &mut Option<broadcast::Receiver<PresenceFrame>>,
) -> Result<PresenceFrame, broadcast::error::RecvError> {
    match presence {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct Member {
    user_id: Uuid,
    session: SessionHandle,
}

/// Per-connection state owned by the connection task.
struct Connection {
    addr: SocketAddr,
    connection_id: Uuid,
    sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    member: Option<Member>,
    outbox: Option<mpsc::Receiver<Frame>>,
    presence: Option<broadcast::Receiver<PresenceFrame>>,
    registry: Arc<SessionRegistry>,
    identity: Arc<dyn IdentityProvider>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
}

impl Connection {
    fn user_id(&self) -> Option<Uuid> {
        self.member.as_ref().map(|m| m.user_id)
    }

    /// Returns `false` when the connection should close.
    async fn on_message(&mut self, msg: ClientMessage) -> Result<bool, ServerError> {
        match msg {
            ClientMessage::Join { session_id, project_id, token, last_known_sequence } => {
                self.on_join(session_id, project_id, &token, last_known_sequence).await?;
            }

            ClientMessage::SubmitOperation { op } => {
                let Some((session, user_id)) = self.member.as_ref().map(|m| (m.session.clone(), m.user_id)) else {
                    return self.send_error(RejectReason::NotJoined).await.map(|_| true);
                };
                let operation_id = op.id;
                if op.session_id != session.session_id() || op.kind.validate().is_err() {
                    self.count_rejection().await;
                    let reply = ServerMessage::OperationRejected {
                        operation_id,
                        reason: RejectReason::ValidationFailed,
                        corrected_state: None,
                    };
                    self.send(&reply).await?;
                    return Ok(true);
                }

                let submitting = tokio::time::timeout(
                    self.config.submit_timeout,
                    session.submit(user_id, self.connection_id, op),
                );
                let submitted = forward_while(submitting, &mut self.outbox, &mut self.sender).await?;

                let reply = match submitted {
                    Ok(Ok(outcome)) => {
                        {
                            let mut s = self.stats.write().await;
                            match &outcome {
                                SubmitOutcome::Accepted { .. } => s.operations_accepted += 1,
                                SubmitOutcome::Rejected { .. } => s.operations_rejected += 1,
                            }
                        }
                        // Everything sequenced before this reply goes out first.
                        self.drain_outbox().await?;
                        outcome.into_message(operation_id)
                    }
                    Ok(Err(SessionError::Rejected(reason))) => {
                        self.count_rejection().await;
                        ServerMessage::OperationRejected { operation_id, reason, corrected_state: None }
                    }
                    Ok(Err(SessionError::Closed(_))) => {
                        self.count_rejection().await;
                        ServerMessage::OperationRejected {
                            operation_id,
                            reason: RejectReason::SessionClosing,
                            corrected_state: None,
                        }
                    }
                    Err(_) => {
                        log::warn!("Operation {operation_id} from {user_id} timed out");
                        self.stats.write().await.operations_timed_out += 1;
                        ServerMessage::OperationTimedOut { operation_id }
                    }
                };
                self.send(&reply).await?;
            }

            ClientMessage::PresenceUpdate { cursor } => {
                if let Some(member) = &self.member {
                    member.session.presence().update(member.user_id, cursor);
                } else {
                    self.send_error(RejectReason::NotJoined).await?;
                }
            }

            ClientMessage::EndSession => {
                let Some((session, user_id)) = self.member.as_ref().map(|m| (m.session.clone(), m.user_id)) else {
                    return self.send_error(RejectReason::NotJoined).await.map(|_| true);
                };
                match session.end(user_id, self.connection_id).await {
                    Ok(()) => {}
                    Err(SessionError::Rejected(reason)) => self.send_error(reason).await?,
                    Err(SessionError::Closed(_)) => self.send_error(RejectReason::SessionClosing).await?,
                }
            }

            ClientMessage::Leave => {
                if let Some(member) = self.member.take() {
                    member.session.leave(member.user_id, self.connection_id).await;
                    log::info!("User {} left session {}", member.user_id, member.session.session_id());
                }
                let _ = self.sender.send(Message::Close(None)).await;
                return Ok(false);
            }

            ClientMessage::Ping { nonce } => {
                self.send(&ServerMessage::Pong { nonce }).await?;
            }
        }
        Ok(true)
    }

    async fn on_join(
        &mut self,
        session_id: Uuid,
        project_id: Uuid,
        token: &str,
        last_known_sequence: Option<u64>,
    ) -> Result<(), ServerError> {
        if self.member.is_some() {
            log::debug!("Connection {} sent a second join", self.addr);
            return self.reject_join(RejectReason::ValidationFailed).await;
        }

        let identity = match self.identity.verify(token) {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("Join from {} rejected: {e}", self.addr);
                return self.reject_join(RejectReason::Unauthenticated).await;
            }
        };

        // A session may end between lookup and join; the second attempt
        // starts a fresh one.
        for _ in 0..2 {
            let session = match self.registry.get_or_start(session_id, project_id).await {
                Ok(session) => session,
                Err(reason) => return self.reject_join(reason).await,
            };

            let (outbox_tx, outbox_rx) = mpsc::channel(self.config.outbox_capacity.max(1));
            let presence_rx = session.presence().subscribe();
            let request = JoinRequest {
                user_id: identity.user_id,
                connection_id: self.connection_id,
                role: identity.role,
                project_id,
                last_known_sequence,
                outbox: outbox_tx,
            };

            let outcome = match session.join(request).await {
                Ok(JoinOutcome::Rejected(reason)) | Err(SessionError::Rejected(reason)) => {
                    return self.reject_join(reason).await;
                }
                Err(SessionError::Closed(_)) => continue,
                Ok(outcome) => outcome,
            };

            self.send(&outcome.into_message(identity.user_id)).await?;
            for (user_id, cursor) in session.presence().snapshot() {
                if user_id != identity.user_id {
                    self.send(&ServerMessage::PresenceBroadcast { user_id, cursor }).await?;
                }
            }

            log::info!(
                "User {} ({:?}) joined session {session_id} from {}",
                identity.user_id,
                identity.role,
                self.addr
            );
            self.outbox = Some(outbox_rx);
            self.presence = Some(presence_rx);
            self.member = Some(Member { user_id: identity.user_id, session });
            return Ok(());
        }

        self.reject_join(RejectReason::SessionClosing).await
    }

    async fn reject_join(&mut self, reason: RejectReason) -> Result<(), ServerError> {
        self.stats.write().await.joins_rejected += 1;
        self.send(&ServerMessage::JoinRejected { reason }).await
    }

    async fn send_error(&mut self, reason: RejectReason) -> Result<(), ServerError> {
        self.send(&ServerMessage::Error { reason }).await
    }

    async fn count_rejection(&self) {
        self.stats.write().await.operations_rejected += 1;
    }

    /// Forward frames the session already queued for this member.
    async fn drain_outbox(&mut self) -> Result<(), ServerError> {
        let mut queued = Vec::new();
        if let Some(rx) = &mut self.outbox {
            while let Ok(frame) = rx.try_recv() {
                queued.push(frame);
            }
        }
        for frame in queued {
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    async fn send(&mut self, msg: &ServerMessage) -> Result<(), ServerError> {
        let encoded = msg.encode()?;
        self.sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        self.sender.send(Message::Binary(frame.to_vec().into())).await?;
        Ok(())
    }
}
