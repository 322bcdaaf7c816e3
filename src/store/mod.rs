//! Entity stores: per-domain collections holding canonical + optimistic state.
//!
//! Every store exposes the same triad per entity kind:
//! - a read accessor (optimistic entities are indistinguishable from confirmed
//!   ones — the UI renders ahead of confirmation by design),
//! - an `*_optimistic` mutator that applies locally, snapshots pre-state, and
//!   registers the operation with the [`OptimisticLedger`],
//! - a direct mutator used exclusively by the event router for
//!   remote-confirmed changes. Direct mutators never touch the ledger and
//!   never re-emit, so remote events cannot echo.
//!
//! Collections are always replaced wholesale rather than mutated in place, so
//! a rollback snapshot restores state exactly and reference-equality consumers
//! see every change.

pub mod comments;
pub mod database;
pub mod documents;
pub mod notifications;

pub use comments::{CommentStore, CommentsState};
pub use database::{Database, DatabaseState, DatabaseStore, RowDraft};
pub use documents::{DocumentStore, DocumentsState, ListKind};
pub use notifications::{Inbox, NotificationStore, NotificationsState};

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

use crate::ledger::OptimisticLedger;
use crate::protocol::{Event, RoomId};

/// A canonical mutation to re-publish to the transport once confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub room: RoomId,
    pub event: Event,
}

/// Sender half of the stores' outbound event channel. The sync client drains
/// the other half and republishes to the server.
pub type Outbound = mpsc::UnboundedSender<Publish>;

/// Shared wiring handed to every store at construction. Stores are explicit
/// instances — there are no global singletons.
#[derive(Clone)]
pub struct StoreContext {
    pub ledger: OptimisticLedger,
    pub outbound: Option<Outbound>,
}

impl StoreContext {
    pub fn new(ledger: OptimisticLedger) -> Self {
        Self {
            ledger,
            outbound: None,
        }
    }

    pub fn with_outbound(ledger: OptimisticLedger, outbound: Outbound) -> Self {
        Self {
            ledger,
            outbound: Some(outbound),
        }
    }

    /// Emit a confirmed mutation toward the transport. Dropped silently when
    /// no transport is wired (e.g. in unit tests).
    pub fn emit(&self, room: RoomId, event: Event) {
        if let Some(ref outbound) = self.outbound {
            let _ = outbound.send(Publish { room, event });
        }
    }
}

/// Lock helpers: a poisoned lock only means a panicking test thread died
/// mid-write; the state itself is still the last coherent replacement.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
