//! # ariaforge-collab: Real-time collaboration engine for AriaForge
//!
//! Sequences concurrent edits to a project document per session, resolves
//! conflicts, fans accepted operations out in order and persists them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ SessionRegistry
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Mirror      │                     │ Session     │──► SessionStore
//! │ (local doc) │                     │ actor       │    (RocksDB)
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                ┌───────────┼────────────┐
//!                                ▼           ▼            ▼
//!                           Sequencer   Dispatcher   PresenceTracker
//!                           Resolver    (ordered)    (best-effort)
//!                           OperationLog
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`resolver`]: Conflict policy for concurrent operations
//! - [`oplog`]: Checksummed operation log with compaction
//! - [`sequencer`]: Assigns global sequence numbers and applies operations
//! - [`session`]: Per-session single-writer actor and lifecycle
//! - [`registry`]: Session lookup and lazy startup
//! - [`broadcast`]: Ordered fan-out with eviction on backpressure
//! - [`presence`]: Rate-limited cursor presence
//! - [`storage`]: Persistence contract, RocksDB and in-memory stores
//! - [`identity`]: Token verification and roles
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with a mirrored document

pub mod broadcast;
pub mod client;
pub mod identity;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{DispatchStats, Dispatcher, Frame};
pub use client::{ConnectionState, Mirror, MirrorError, SyncClient, SyncEvent};
pub use identity::{AuthError, Identity, IdentityProvider, Role, StaticIdentity};
pub use oplog::{LogConfig, LogEntry, LogError, OperationLog};
pub use presence::PresenceTracker;
pub use protocol::{
    ClientMessage, Cursor, ProtocolError, RejectReason, SequencedOperation, ServerMessage, SessionState,
    StateReason,
};
pub use registry::SessionRegistry;
pub use resolver::{resolve, Resolution};
pub use sequencer::{CatchUp, Decision, Sequencer};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{JoinOutcome, JoinRequest, SessionConfig, SessionError, SessionHandle, SubmitOutcome};
pub use storage::{MemoryStore, RocksStore, SessionStore, StoreConfig, StoreError};
