//! # tessera-sync — Optimistic-update and real-time sync core for Tessera
//!
//! Keeps a collaborative workspace (documents, database blocks, comments,
//! notifications) responsive: every mutation applies locally first, the server
//! confirms in the background, and confirmed changes fan out to every other
//! session through room-scoped WebSocket broadcast.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐    WebSocket    ┌─────────────┐
//! │ SyncClient (per session)     │ ◄──────────────► │ SyncServer  │
//! │   EventRouter ──► stores     │    JSON frames   │ (relay)     │
//! │   stores ──► outbound pump   │                  └──────┬──────┘
//! └──────┬───────────────────────┘                         │
//!        │                                          ┌──────┴──────┐
//! ┌──────┴───────────────┐                          │ RoomHub     │
//! │ OptimisticLedger     │                          │ (fan-out by │
//! │ (retry + rollback)   │                          │  room id)   │
//! └──────┬───────────────┘                          └─────────────┘
//!        │
//! ┌──────┴───────────────┐
//! │ SnapshotBridge       │
//! │ (bincode + LZ4)      │
//! └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`entity`] — Domain entities and transient sync flags
//! - [`ledger`] — Optimistic update ledger: retries, backoff, rollback
//! - [`store`] — Entity stores (documents, database, comments, notifications)
//! - [`persist`] — Versioned snapshot persistence with migration hooks
//! - [`protocol`] — JSON wire protocol: envelopes, events, room addressing
//! - [`router`] — Incoming event dispatch with echo suppression
//! - [`client`] — WebSocket sync client with offline queue
//! - [`membership`] — Room membership and broadcast fan-out
//! - [`server`] — WebSocket relay server

pub mod entity;
pub mod ledger;
pub mod persist;
pub mod protocol;
pub mod store;
pub mod router;
pub mod client;
pub mod membership;
pub mod server;

// Re-exports for convenience
pub use entity::{
    Comment, DatabaseCell, DatabaseProperty, DatabaseRow, Document, DocumentPatch, Notification,
};
pub use ledger::{
    ActionError, OperationHandle, OperationKind, OptimisticLedger, PendingOperation, UpdateStatus,
};
pub use persist::{FileMedium, PersistError, SnapshotBridge, StorageMedium};
pub use protocol::{CellEdit, Envelope, Event, ProtocolError, RoomId, WireMessage};
pub use router::{EventRouter, Stores};
pub use client::{ClientConfig, ConnectionState, OfflineQueue, SyncClient};
pub use membership::{RoomGroup, RoomHub, RoomStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{
    CommentStore, Database, DatabaseStore, DocumentStore, ListKind, NotificationStore, Publish,
    RowDraft, StoreContext,
};
