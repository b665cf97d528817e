//! Per-session single-writer actor.
//!
//! Architecture:
//! ```text
//!  connection tasks                      session task (one per session)
//! ┌──────────────┐   Command (mpsc)    ┌──────────────────────────────────┐
//! │ join/submit/ │ ──────────────────► │ Sequencer (document + log)       │
//! │ leave/end    │ ◄── oneshot reply ─ │ members, WriteBuffer, Dispatcher │
//! └──────┬───────┘                     │ tick: presence, persistence,     │
//!        │  ▲                          │       compaction, idle, drain    │
//!        │  └── outbox (mpsc<Frame>) ──┤                                  │
//!        │                             └───────┬──────────────────────────┘
//!        └── PresenceTracker (shared) ◄────────┘ watch: state, document
//! ```
//!
//! Lifecycle: `Empty → Active` on the first join, `Active → Draining` on an
//! owner end, idle timeout or persistence overflow, `Draining → Empty` once
//! the session is flushed to the store. The task exits on reaching `Empty`;
//! the registry then replaces the handle on the next join.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ariaforge_core::{Document, EntityState, Operation, OperationKind};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::broadcast::{DispatchCounters, DispatchStats, Dispatcher, Frame};
use crate::identity::Role;
use crate::oplog::{LogConfig, OperationLog};
use crate::presence::PresenceTracker;
use crate::protocol::{RejectReason, SequencedOperation, ServerMessage, SessionState, StateReason};
use crate::sequencer::{CatchUp, Decision, Sequencer};
use crate::storage::{SessionStore, StoreError, WriteBuffer};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// No members and no operations for this long drains the session. Default: 30min.
    pub idle_timeout: Duration,
    /// Housekeeping period. Default: 1s.
    pub tick_interval: Duration,
    /// Operation log retention
    pub log: LogConfig,
    /// Compaction waits at most this long for lagging members. Default: 5min.
    pub compaction_grace: Duration,
    /// Accepted operations buffered while the store is down. Default: 1024.
    pub max_pending_writes: usize,
    /// Minimum spacing of one user's presence frames. Default: 33ms.
    pub presence_interval: Duration,
    /// Presence entries silent this long are dropped. Default: 30s.
    pub presence_timeout: Duration,
    /// Presence frames buffered per connection. Default: 64.
    pub presence_capacity: usize,
    /// Queued commands before senders wait. Default: 1024.
    pub mailbox_capacity: usize,
    /// Flush attempts while draining before giving up. Default: 3.
    pub drain_flush_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            tick_interval: Duration::from_secs(1),
            log: LogConfig::default(),
            compaction_grace: Duration::from_secs(5 * 60),
            max_pending_writes: 1024,
            presence_interval: Duration::from_millis(33),
            presence_timeout: Duration::from_secs(30),
            presence_capacity: 64,
            mailbox_capacity: 1024,
            drain_flush_attempts: 3,
        }
    }
}

impl SessionConfig {
    /// Config for testing (fast ticks, tiny windows).
    pub fn for_testing() -> Self {
        Self {
            idle_timeout: Duration::from_millis(300),
            tick_interval: Duration::from_millis(20),
            log: LogConfig::for_testing(),
            compaction_grace: Duration::from_millis(200),
            max_pending_writes: 4,
            presence_interval: Duration::from_millis(10),
            presence_timeout: Duration::from_secs(5),
            presence_capacity: 64,
            mailbox_capacity: 64,
            drain_flush_attempts: 3,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session {0} has ended")]
    Closed(Uuid),
    #[error("Rejected: {0}")]
    Rejected(RejectReason),
}

/// A verified user asking to become a member.
#[derive(Debug)]
pub struct JoinRequest {
    pub user_id: Uuid,
    /// Distinguishes reconnects of the same user
    pub connection_id: Uuid,
    pub role: Role,
    pub project_id: Uuid,
    pub last_known_sequence: Option<u64>,
    /// Ordered delivery of broadcasts to this member
    pub outbox: mpsc::Sender<Frame>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Catchup {
        document_version: u64,
        operations: Vec<SequencedOperation>,
    },
    Snapshot {
        document_version: u64,
        document: Document,
        resync: bool,
    },
    Rejected(RejectReason),
}

impl JoinOutcome {
    pub fn into_message(self, user_id: Uuid) -> ServerMessage {
        match self {
            JoinOutcome::Catchup { document_version, operations } => {
                ServerMessage::Catchup { user_id, document_version, operations }
            }
            JoinOutcome::Snapshot { document_version, document, resync } => {
                ServerMessage::Snapshot { user_id, document_version, document, resync }
            }
            JoinOutcome::Rejected(reason) => ServerMessage::JoinRejected { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted {
        global_seq: u64,
        /// The payload as applied, when it differs from the submitted one
        applied: Option<OperationKind>,
    },
    Rejected {
        reason: RejectReason,
        corrected_state: Option<EntityState>,
    },
}

impl SubmitOutcome {
    fn rejected(reason: RejectReason) -> Self {
        SubmitOutcome::Rejected { reason, corrected_state: None }
    }

    pub fn into_message(self, operation_id: Uuid) -> ServerMessage {
        match self {
            SubmitOutcome::Accepted { global_seq, applied } => {
                ServerMessage::OperationApplied { operation_id, global_seq, applied }
            }
            SubmitOutcome::Rejected { reason, corrected_state } => {
                ServerMessage::OperationRejected { operation_id, reason, corrected_state }
            }
        }
    }
}

enum Command {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Submit {
        user_id: Uuid,
        connection_id: Uuid,
        op: Operation,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Leave {
        user_id: Uuid,
        connection_id: Uuid,
    },
    End {
        user_id: Uuid,
        connection_id: Uuid,
        reply: oneshot::Sender<Result<(), RejectReason>>,
    },
}

// ─── Handle ───────────────────────────────────────────────────────────

/// Cheap, cloneable address of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    project_id: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    document: watch::Receiver<Document>,
    presence: Arc<PresenceTracker>,
    dispatch: Arc<DispatchCounters>,
}

impl SessionHandle {
    /// Start the session task. State is loaded from `store` before the
    /// first command is processed.
    pub fn spawn(session_id: Uuid, project_id: Uuid, store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        let (commands, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
        let (state_tx, state) = watch::channel(SessionState::Empty);
        let (document_tx, document) = watch::channel(Document::new(project_id));
        let presence = Arc::new(PresenceTracker::new(config.presence_capacity, config.presence_interval));
        let dispatcher = Dispatcher::new();
        let dispatch = dispatcher.counters();

        let shared = Shared {
            session_id,
            project_id,
            config,
            store,
            presence: presence.clone(),
            dispatcher,
            state_tx,
            document_tx,
        };
        tokio::spawn(run(shared, mailbox));

        Self {
            session_id,
            project_id,
            commands,
            state,
            document,
            presence,
            dispatch,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Join { request, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed(self.session_id))
    }

    pub async fn submit(&self, user_id: Uuid, connection_id: Uuid, op: Operation) -> Result<SubmitOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { user_id, connection_id, op, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed(self.session_id))
    }

    /// Remove membership and presence. No-op if the session already ended.
    pub async fn leave(&self, user_id: Uuid, connection_id: Uuid) {
        let _ = self.send(Command::Leave { user_id, connection_id }).await;
    }

    /// Owner-initiated end.
    pub async fn end(&self, user_id: Uuid, connection_id: Uuid) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::End { user_id, connection_id, reply }).await?;
        rx.await
            .map_err(|_| SessionError::Closed(self.session_id))?
            .map_err(SessionError::Rejected)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Latest accepted document version; never waits for the writer.
    pub fn document(&self) -> Document {
        self.document.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.document.borrow().version()
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatch.snapshot()
    }

    /// The session task has exited.
    pub fn is_ended(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn wait_ended(&self) {
        self.commands.closed().await
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed(self.session_id))
    }
}

// ─── Actor ────────────────────────────────────────────────────────────

/// Everything the task owns before its state is loaded.
struct Shared {
    session_id: Uuid,
    project_id: Uuid,
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    presence: Arc<PresenceTracker>,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<SessionState>,
    document_tx: watch::Sender<Document>,
}

struct Member {
    connection_id: Uuid,
    role: Role,
    /// Highest sequence the member is known to have seen
    last_known: u64,
}

struct SessionActor {
    shared: Shared,
    sequencer: Sequencer,
    members: HashMap<Uuid, Member>,
    pending: WriteBuffer,
    state: SessionState,
    degraded: bool,
    /// Log was rebuilt after corruption; joins get a full resync
    resync: bool,
    drain_attempts: u32,
    last_activity: Instant,
    compaction_due_since: Option<Instant>,
    finished: bool,
}

async fn run(shared: Shared, mut mailbox: mpsc::Receiver<Command>) {
    let session_id = shared.session_id;
    let loaded = load(shared.store.as_ref(), session_id, shared.project_id, &shared.config.log);
    let (sequencer, resync) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Session {session_id}: failed to load state: {e}");
            reject_queued(&mut mailbox, RejectReason::PersistenceUnavailable).await;
            return;
        }
    };

    let mut actor = SessionActor::new(shared, sequencer, resync);
    info!(
        "Session {session_id} loaded for project {} at version {}",
        actor.shared.project_id,
        actor.sequencer.version()
    );

    let mut tick = tokio::time::interval(actor.shared.config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !actor.finished {
        tokio::select! {
            command = mailbox.recv() => match command {
                Some(command) => actor.handle(command),
                None => {
                    // Every handle is gone; nobody can reach this session again.
                    actor.begin_drain(StateReason::IdleTimeout);
                    while !actor.finished {
                        tick.tick().await;
                        actor.try_finish_drain();
                    }
                }
            },
            _ = tick.tick() => actor.on_tick(),
        }
    }

    reject_queued(&mut mailbox, RejectReason::SessionClosing).await;
}

/// Close the mailbox and answer whatever is still queued.
async fn reject_queued(mailbox: &mut mpsc::Receiver<Command>, reason: RejectReason) {
    mailbox.close();
    while let Some(command) = mailbox.recv().await {
        match command {
            Command::Join { reply, .. } => {
                let _ = reply.send(JoinOutcome::Rejected(reason));
            }
            Command::Submit { reply, .. } => {
                let _ = reply.send(SubmitOutcome::rejected(reason));
            }
            Command::End { reply, .. } => {
                let _ = reply.send(Err(reason));
            }
            Command::Leave { .. } => {}
        }
    }
}

/// Rebuild the sequencer from the store: project document, then the
/// session's snapshot if it is newer, then the stored log tail.
///
/// Unreadable session data is handled like a failed checksum: the log is cut
/// back to the last valid document, which is stored as the new snapshot, and
/// the returned flag asks every joining client for a full resync.
fn load(
    store: &dyn SessionStore,
    session_id: Uuid,
    project_id: Uuid,
    config: &LogConfig,
) -> Result<(Sequencer, bool), StoreError> {
    let project_doc = store.load_document(project_id)?;
    let (base, mut corruption) = match store.load_snapshot(session_id) {
        Ok(Some((seq, doc))) if seq >= project_doc.version() => (doc, None),
        Ok(_) => (project_doc, None),
        Err(StoreError::Corrupted(e)) => (project_doc, Some(e)),
        Err(e) => return Err(e),
    };

    let stored = if corruption.is_some() {
        None
    } else {
        match store.load_operations_since(session_id, base.version()) {
            Ok(stored) => Some(stored),
            Err(StoreError::Corrupted(e)) => {
                corruption = Some(e);
                None
            }
            Err(e) => return Err(e),
        }
    };
    if let Some(stored) = stored {
        let restored = OperationLog::restore(base.clone(), stored, config.clone());
        match restored.error {
            None => return Ok((Sequencer::from_parts(session_id, restored.document, restored.log), false)),
            Some(e) => corruption = Some(e.to_string()),
        }
    }

    let reason = corruption.unwrap_or_default();
    error!(
        "Session {session_id}: corrupted log ({reason}); rebuilding from snapshot at version {}",
        base.version()
    );
    store.truncate_operations(session_id, base.version())?;
    store.save_snapshot(session_id, base.version(), &base)?;
    Ok((Sequencer::new(session_id, base, config.clone()), true))
}

impl SessionActor {
    fn new(shared: Shared, sequencer: Sequencer, resync: bool) -> Self {
        shared.document_tx.send_replace(sequencer.document().clone());
        let pending = WriteBuffer::new(shared.config.max_pending_writes);
        Self {
            shared,
            sequencer,
            members: HashMap::new(),
            pending,
            state: SessionState::Empty,
            degraded: false,
            resync,
            drain_attempts: 0,
            last_activity: Instant::now(),
            compaction_due_since: None,
            finished: false,
        }
    }

    fn id(&self) -> Uuid {
        self.shared.session_id
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Join { request, reply } => {
                let outcome = self.handle_join(request);
                let _ = reply.send(outcome);
            }
            Command::Submit { user_id, connection_id, op, reply } => {
                let outcome = self.handle_submit(user_id, connection_id, op);
                let _ = reply.send(outcome);
            }
            Command::Leave { user_id, connection_id } => self.handle_leave(user_id, connection_id),
            Command::End { user_id, connection_id, reply } => {
                let result = self.handle_end(user_id, connection_id);
                let _ = reply.send(result);
            }
        }
    }

    fn handle_join(&mut self, request: JoinRequest) -> JoinOutcome {
        if self.state == SessionState::Draining {
            return JoinOutcome::Rejected(RejectReason::SessionClosing);
        }
        if request.project_id != self.shared.project_id {
            return JoinOutcome::Rejected(RejectReason::ProjectMismatch);
        }

        let version = self.sequencer.version();
        let outcome = if self.resync {
            JoinOutcome::Snapshot {
                document_version: version,
                document: self.sequencer.document().clone(),
                resync: true,
            }
        } else {
            match self.sequencer.catch_up(request.last_known_sequence) {
                CatchUp::Operations(operations) => JoinOutcome::Catchup { document_version: version, operations },
                CatchUp::Snapshot(document) => JoinOutcome::Snapshot { document_version: version, document, resync: false },
            }
        };
        debug!(
            "Session {}: {} catches up from {:?} via {}",
            self.id(),
            request.user_id,
            request.last_known_sequence,
            if matches!(outcome, JoinOutcome::Catchup { .. }) { "operations" } else { "snapshot" }
        );

        let user_id = request.user_id;
        self.shared.dispatcher.add(user_id, request.outbox);
        self.members.insert(
            user_id,
            Member { connection_id: request.connection_id, role: request.role, last_known: version },
        );
        self.shared.presence.join(user_id);
        self.last_activity = Instant::now();

        if self.state == SessionState::Empty {
            self.set_state(SessionState::Active);
            info!("Session {} active", self.id());
        }
        info!("User {user_id} joined session {} at version {version}", self.id());
        outcome
    }

    fn handle_submit(&mut self, user_id: Uuid, connection_id: Uuid, mut op: Operation) -> SubmitOutcome {
        let role = match self.members.get(&user_id) {
            Some(member) if member.connection_id == connection_id => member.role,
            _ => return SubmitOutcome::rejected(RejectReason::NotJoined),
        };
        if self.state == SessionState::Draining {
            return SubmitOutcome::rejected(RejectReason::SessionClosing);
        }
        if !role.can_submit(&op.kind) {
            return SubmitOutcome::rejected(RejectReason::PermissionDenied);
        }
        if self.pending.is_full() && !self.flush_pending() {
            warn!("Session {}: write buffer full with the store unavailable", self.id());
            self.begin_drain(StateReason::PersistenceUnavailable);
            return SubmitOutcome::rejected(RejectReason::PersistenceUnavailable);
        }

        op.origin_user_id = user_id;
        match self.sequencer.submit(op) {
            Decision::Applied { entry, transformed } => {
                let global_seq = entry.global_seq;
                self.last_activity = Instant::now();
                if self.resync {
                    debug!("Session {}: history resumes at {global_seq}, joins catch up normally", self.id());
                    self.resync = false;
                }
                if let Some(member) = self.members.get_mut(&user_id) {
                    member.last_known = member.last_known.max(global_seq);
                }

                let broadcast = ServerMessage::OperationBroadcast {
                    global_seq,
                    op: entry.operation.clone(),
                    origin_user_id: user_id,
                };
                let applied = transformed.then(|| entry.operation.kind.clone());
                if let Err(e) = self.pending.push(entry) {
                    error!("Session {}: {e}", self.id());
                }
                self.flush_pending();

                self.shared.document_tx.send_replace(self.sequencer.document().clone());
                self.broadcast(&broadcast, Some(&user_id));
                self.mark_delivered(global_seq);
                self.maybe_compact();
                SubmitOutcome::Accepted { global_seq, applied }
            }
            Decision::Duplicate { global_seq } => SubmitOutcome::Accepted { global_seq, applied: None },
            Decision::Rejected { reason, corrected_state } => {
                if reason != RejectReason::ValidationFailed {
                    debug!("Session {}: rejected operation from {user_id}: {reason}", self.id());
                }
                SubmitOutcome::Rejected { reason, corrected_state }
            }
        }
    }

    fn handle_leave(&mut self, user_id: Uuid, connection_id: Uuid) {
        let current = self.members.get(&user_id).is_some_and(|m| m.connection_id == connection_id);
        if !current {
            return;
        }
        self.members.remove(&user_id);
        self.shared.dispatcher.remove(&user_id);
        self.shared.presence.remove(&user_id);
        self.last_activity = Instant::now();
        info!("User {user_id} left session {} ({} members remain)", self.id(), self.members.len());
    }

    fn handle_end(&mut self, user_id: Uuid, connection_id: Uuid) -> Result<(), RejectReason> {
        let role = match self.members.get(&user_id) {
            Some(member) if member.connection_id == connection_id => member.role,
            _ => return Err(RejectReason::NotJoined),
        };
        if !role.can_end_session() {
            return Err(RejectReason::PermissionDenied);
        }
        info!("Session {} ended by owner {user_id}", self.id());
        self.begin_drain(StateReason::OwnerEnded);
        Ok(())
    }

    fn on_tick(&mut self) {
        self.shared.presence.flush_dirty();
        self.shared.presence.sweep(self.shared.config.presence_timeout);

        if self.state == SessionState::Draining {
            self.try_finish_drain();
            return;
        }
        if !self.pending.is_empty() {
            self.flush_pending();
        }
        self.maybe_compact();
        if !self.members.is_empty() || self.last_activity.elapsed() < self.shared.config.idle_timeout {
            return;
        }
        match self.state {
            SessionState::Active => self.begin_drain(StateReason::IdleTimeout),
            // Never activated: nothing was sequenced, so there is nothing to flush.
            SessionState::Empty => {
                debug!("Session {} was never joined; shutting down", self.id());
                self.finish();
            }
            SessionState::Draining => {}
        }
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Push pending entries to the store. Returns whether nothing is left pending.
    fn flush_pending(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        match self.shared.store.append_operations(self.id(), self.pending.entries()) {
            Ok(()) => {
                self.pending.mark_flushed();
                if self.degraded {
                    self.degraded = false;
                    info!("Session {}: persistence recovered", self.id());
                    self.broadcast(&ServerMessage::SessionDegraded { degraded: false }, None);
                }
                true
            }
            Err(e) => {
                if !self.degraded {
                    self.degraded = true;
                    error!("Session {}: persistence failed, entering degraded mode: {e}", self.id());
                    self.broadcast(&ServerMessage::SessionDegraded { degraded: true }, None);
                } else {
                    warn!(
                        "Session {}: {} operations still pending, last write {:?} ago: {e}",
                        self.id(),
                        self.pending.len(),
                        self.pending.time_since_flush()
                    );
                }
                false
            }
        }
    }

    fn maybe_compact(&mut self) {
        let Some(target) = self.sequencer.log().compaction_target() else {
            self.compaction_due_since = None;
            return;
        };
        if self.degraded {
            return;
        }
        let due_since = *self.compaction_due_since.get_or_insert_with(Instant::now);
        let blocked = self.members.values().any(|m| m.last_known < target);
        if blocked && due_since.elapsed() < self.shared.config.compaction_grace {
            return;
        }

        match self.sequencer.compact(target) {
            Ok(removed) => {
                self.compaction_due_since = None;
                debug!("Session {}: compacted {removed} operations up to {target}", self.id());
                let base = self.sequencer.log().base();
                if let Err(e) = self.shared.store.save_snapshot(self.id(), target, base) {
                    warn!("Session {}: failed to store snapshot at {target}: {e}", self.id());
                }
            }
            Err(e) => error!("Session {}: compaction failed: {e}", self.id()),
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    fn begin_drain(&mut self, reason: StateReason) {
        if self.state == SessionState::Draining || self.finished {
            return;
        }
        info!("Session {} draining ({})", self.id(), reason.code());
        self.set_state(SessionState::Draining);
        self.broadcast(&ServerMessage::SessionState { state: SessionState::Draining, reason: Some(reason) }, None);
        self.try_finish_drain();
    }

    /// Write the final document to the store once; end the session when it
    /// succeeds or the attempts are used up.
    fn try_finish_drain(&mut self) {
        if self.finished {
            return;
        }
        self.drain_attempts += 1;
        let (seq, document) = self.sequencer.snapshot();
        match self.shared.store.flush(self.id(), self.shared.project_id, seq, &document) {
            Ok(()) => {
                self.pending.mark_flushed();
                info!("Session {} flushed at version {seq}", self.id());
                self.finish();
            }
            Err(e) if self.drain_attempts >= self.shared.config.drain_flush_attempts => {
                error!(
                    "Session {}: giving up after {} flush attempts; state up to version {seq} ({} unpersisted operations) is lost: {e}",
                    self.id(),
                    self.drain_attempts,
                    self.pending.len()
                );
                self.finish();
            }
            Err(e) => warn!("Session {}: flush attempt {} failed: {e}", self.id(), self.drain_attempts),
        }
    }

    fn finish(&mut self) {
        self.broadcast(&ServerMessage::SessionState { state: SessionState::Empty, reason: None }, None);
        self.shared.dispatcher.close_all();
        self.shared.presence.clear();
        self.members.clear();
        self.set_state(SessionState::Empty);
        self.finished = true;
        info!("Session {} ended", self.id());
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.shared.state_tx.send_replace(state);
    }

    /// Members whose outbox took the broadcast of `global_seq` now know it.
    fn mark_delivered(&mut self, global_seq: u64) {
        for (user_id, member) in self.members.iter_mut() {
            if self.shared.dispatcher.contains(user_id) {
                member.last_known = member.last_known.max(global_seq);
            }
        }
    }

    fn broadcast(&mut self, msg: &ServerMessage, exclude: Option<&Uuid>) {
        if let Err(e) = self.shared.dispatcher.broadcast_message(msg, exclude) {
            error!("Session {}: failed to encode {}: {e}", self.id(), msg.name());
        }
    }
}
