//! Realtime event router: decoded envelopes in, direct store mutations out.
//!
//! The router is the only caller of the stores' `apply_remote_*` mutators.
//! Those mutators never register ledger operations and never emit, so a
//! dispatched event can never loop back to the transport. Echo suppression is
//! the first check: an envelope whose origin is this session is dropped before
//! any store is touched.

use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{Envelope, Event};
use crate::store::{CommentStore, DatabaseStore, DocumentStore, NotificationStore};

/// The full set of entity stores one client session owns.
pub struct Stores {
    pub documents: DocumentStore,
    pub database: DatabaseStore,
    pub comments: CommentStore,
    pub notifications: NotificationStore,
}

/// Dispatches incoming envelopes to the owning store.
#[derive(Clone)]
pub struct EventRouter {
    stores: Arc<Stores>,
    session_id: Uuid,
}

impl EventRouter {
    pub fn new(stores: Arc<Stores>, session_id: Uuid) -> Self {
        Self { stores, session_id }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Decode and dispatch a raw frame. Malformed or unknown-event frames are
    /// logged and dropped; a bad peer cannot take the dispatcher down.
    pub fn dispatch_raw(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(e) => log::warn!("Dropping undecodable event frame: {e}"),
        }
    }

    /// Apply one envelope to local state.
    pub fn dispatch(&self, envelope: &Envelope) {
        if envelope.origin == self.session_id {
            log::trace!("Suppressing echo of {}", envelope.event.name());
            return;
        }
        log::debug!(
            "Applying {} from room {}",
            envelope.event.name(),
            envelope.room
        );

        match envelope.event.clone() {
            Event::DocCreate {
                document,
                parent_id,
            } => self.stores.documents.apply_remote_create(document, parent_id),
            Event::DocUpdate { id, patch } => {
                self.stores.documents.apply_remote_update(&id, &patch)
            }
            Event::DocArchive { id } => self.stores.documents.apply_remote_archive(&id),
            Event::DocRestore { id } => self.stores.documents.restore_document(&id),

            Event::RowCreate { row } => self.stores.database.apply_remote_row_create(row),
            Event::RowUpdate {
                database_id,
                row_id,
                order,
            } => self
                .stores
                .database
                .apply_remote_row_update(&database_id, &row_id, order),
            Event::RowDelete {
                database_id,
                row_id,
            } => self
                .stores
                .database
                .apply_remote_row_delete(&database_id, &row_id),
            Event::CellUpdate {
                database_id,
                row_id,
                property_id,
                value,
            } => self.stores.database.apply_remote_cell_update(
                &database_id,
                &row_id,
                &property_id,
                value,
            ),
            Event::CellsBatch { database_id, edits } => self
                .stores
                .database
                .apply_remote_cells_batch(&database_id, &edits),
            Event::PropertyCreate { property } => {
                self.stores.database.apply_remote_property_create(property)
            }
            Event::PropertyUpdate {
                database_id,
                property_id,
                name,
            } => self.stores.database.apply_remote_property_update(
                &database_id,
                &property_id,
                &name,
            ),
            Event::PropertyDelete {
                database_id,
                property_id,
            } => self
                .stores
                .database
                .apply_remote_property_delete(&database_id, &property_id),

            Event::CommentCreate { comment } => self.stores.comments.apply_remote_create(comment),
            Event::CommentUpdate {
                page_id,
                comment_id,
                body,
            } => self
                .stores
                .comments
                .apply_remote_update(&page_id, &comment_id, &body),
            Event::CommentResolve {
                page_id,
                comment_id,
                resolved,
            } => self
                .stores
                .comments
                .apply_remote_resolve(&page_id, &comment_id, resolved),
            Event::CommentDelete {
                page_id,
                comment_id,
            } => self
                .stores
                .comments
                .apply_remote_delete(&page_id, &comment_id),

            Event::NotificationCreate { notification } => {
                self.stores.notifications.apply_remote_create(notification)
            }
            Event::NotificationRead { id } => {
                if let Some(user_id) = envelope.user_id.as_deref() {
                    self.stores.notifications.apply_remote_read(user_id, &id);
                }
            }
            Event::NotificationReadAll => {
                if let Some(user_id) = envelope.user_id.as_deref() {
                    self.stores.notifications.apply_remote_read_all(user_id);
                }
            }
            Event::NotificationDelete { id } => {
                if let Some(user_id) = envelope.user_id.as_deref() {
                    self.stores.notifications.apply_remote_delete(user_id, &id);
                }
            }

            // Presence is a transport-level concern; the stores hold no
            // presence state.
            Event::PresenceJoin { .. } | Event::PresenceLeave { .. } => {}
        }
    }
}
