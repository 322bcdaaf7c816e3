//! Notification store: per-user inboxes with a denormalized unread counter.
//!
//! The counter moves in lock-step with the list: every mutation adjusts it by
//! exactly the number of unread entries it touched. `set_notifications` is the
//! only full recompute — it replaces the list wholesale on initial load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::entity::Notification;
use crate::ledger::{ActionError, ActionFactory, OperationHandle, OperationKind, PendingOperation};
use crate::persist::SnapshotBridge;
use crate::protocol::{Event, RoomId};
use crate::store::{read_lock, write_lock, StoreContext};

/// Persisted snapshot version for [`NotificationsState`].
pub const NOTIFICATIONS_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Inbox {
    pub items: Vec<Notification>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotificationsState {
    pub users: HashMap<String, Inbox>,
}

#[derive(Clone)]
pub struct NotificationStore {
    state: Arc<RwLock<NotificationsState>>,
    ctx: StoreContext,
    bridge: SnapshotBridge<NotificationsState>,
}

impl NotificationStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self::with_persistence(
            ctx,
            SnapshotBridge::disabled("notifications", NOTIFICATIONS_STATE_VERSION),
        )
    }

    pub fn with_persistence(ctx: StoreContext, bridge: SnapshotBridge<NotificationsState>) -> Self {
        let state = bridge.load().unwrap_or_default();
        Self {
            state: Arc::new(RwLock::new(state)),
            ctx,
            bridge,
        }
    }

    // ── reads ──────────────────────────────────────────────────────

    pub fn notifications(&self, user_id: &str) -> Vec<Notification> {
        read_lock(&self.state)
            .users
            .get(user_id)
            .map(|inbox| inbox.items.clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, user_id: &str) -> u32 {
        read_lock(&self.state)
            .users
            .get(user_id)
            .map(|inbox| inbox.unread_count)
            .unwrap_or(0)
    }

    pub fn is_pending(&self, user_id: &str, notification_id: &str) -> bool {
        self.ctx.ledger.is_pending(user_id, notification_id)
    }

    // ── optimistic mutators ────────────────────────────────────────

    /// Mark one notification read optimistically.
    pub fn mark_read_optimistic<F, Fut>(
        &self,
        user_id: &str,
        notification_id: &str,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_inbox(user_id);
        {
            let mut state = write_lock(&self.state);
            let inbox = state.users.get_mut(user_id)?;
            let item = inbox.items.iter_mut().find(|n| n.id == notification_id)?;
            if !item.read {
                item.read = true;
                inbox.unread_count = inbox.unread_count.saturating_sub(1);
            }
            item.pending_update = true;
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::NotificationRead, user_id, notification_id);
        let op_id = op.id;

        let store = self.clone();
        let uid = user_id.to_string();
        let nid = notification_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let uid = uid.clone();
            let nid = nid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_pending(&uid, &nid);
                store
                    .ctx
                    .emit(RoomId::user(&uid), Event::NotificationRead { id: nid });
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "notification_id": notification_id }),
            self.restore_closure(user_id, snapshot),
            factory,
        ))
    }

    /// Mark every notification read optimistically. The counter drops to zero
    /// in the same write.
    pub fn mark_all_read_optimistic<F, Fut>(&self, user_id: &str, action: F) -> OperationHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_inbox(user_id);
        {
            let mut state = write_lock(&self.state);
            let inbox = state.users.entry(user_id.to_string()).or_default();
            for item in &mut inbox.items {
                if !item.read {
                    item.read = true;
                    item.pending_update = true;
                }
            }
            inbox.unread_count = 0;
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::NotificationReadAll, user_id, user_id);
        let op_id = op.id;

        let store = self.clone();
        let uid = user_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let uid = uid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_all_pending(&uid);
                store
                    .ctx
                    .emit(RoomId::user(&uid), Event::NotificationReadAll);
                Ok(())
            })
        });

        self.ctx.ledger.add(
            op,
            serde_json::Value::Null,
            self.restore_closure(user_id, snapshot),
            factory,
        )
    }

    /// Delete a notification optimistically. Deleting an unread entry also
    /// decrements the counter.
    pub fn delete_notification_optimistic<F, Fut>(
        &self,
        user_id: &str,
        notification_id: &str,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_inbox(user_id);
        {
            let mut state = write_lock(&self.state);
            let inbox = state.users.get_mut(user_id)?;
            let index = inbox.items.iter().position(|n| n.id == notification_id)?;
            let removed = inbox.items.remove(index);
            if !removed.read {
                inbox.unread_count = inbox.unread_count.saturating_sub(1);
            }
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::NotificationDelete, user_id, notification_id);
        let op_id = op.id;

        let store = self.clone();
        let uid = user_id.to_string();
        let nid = notification_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let uid = uid.clone();
            let nid = nid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store
                    .ctx
                    .emit(RoomId::user(&uid), Event::NotificationDelete { id: nid });
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "notification_id": notification_id }),
            self.restore_closure(user_id, snapshot),
            factory,
        ))
    }

    // ── direct mutators (event router) ─────────────────────────────

    /// Insert an incoming notification. An unread entry bumps the counter;
    /// duplicate delivery is a no-op.
    pub fn apply_remote_create(&self, notification: Notification) {
        {
            let mut state = write_lock(&self.state);
            let inbox = state.users.entry(notification.user_id.clone()).or_default();
            if inbox.items.iter().any(|n| n.id == notification.id) {
                return;
            }
            if !notification.read {
                inbox.unread_count += 1;
            }
            inbox.items.push(notification);
        }
        self.persist();
    }

    pub fn apply_remote_read(&self, user_id: &str, notification_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(inbox) = state.users.get_mut(user_id) {
                if let Some(item) = inbox.items.iter_mut().find(|n| n.id == notification_id) {
                    if !item.read {
                        item.read = true;
                        inbox.unread_count = inbox.unread_count.saturating_sub(1);
                    }
                    item.pending_update = false;
                }
            }
        }
        self.persist();
    }

    pub fn apply_remote_read_all(&self, user_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(inbox) = state.users.get_mut(user_id) {
                for item in &mut inbox.items {
                    item.read = true;
                    item.pending_update = false;
                }
                inbox.unread_count = 0;
            }
        }
        self.persist();
    }

    pub fn apply_remote_delete(&self, user_id: &str, notification_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(inbox) = state.users.get_mut(user_id) {
                if let Some(index) = inbox.items.iter().position(|n| n.id == notification_id) {
                    let removed = inbox.items.remove(index);
                    if !removed.read {
                        inbox.unread_count = inbox.unread_count.saturating_sub(1);
                    }
                }
            }
        }
        self.persist();
    }

    /// Replace a user's inbox wholesale. This is the only place the unread
    /// counter is recomputed from scratch.
    pub fn set_notifications(&self, user_id: &str, items: Vec<Notification>) {
        {
            let mut state = write_lock(&self.state);
            let unread_count = items.iter().filter(|n| !n.read).count() as u32;
            state.users.insert(
                user_id.to_string(),
                Inbox {
                    items,
                    unread_count,
                },
            );
        }
        self.persist();
    }

    // ── internals ──────────────────────────────────────────────────

    fn clear_pending(&self, user_id: &str, notification_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(inbox) = state.users.get_mut(user_id) {
                if let Some(item) = inbox.items.iter_mut().find(|n| n.id == notification_id) {
                    item.pending_update = false;
                }
            }
        }
        self.persist();
    }

    fn clear_all_pending(&self, user_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(inbox) = state.users.get_mut(user_id) {
                for item in &mut inbox.items {
                    item.pending_update = false;
                }
            }
        }
        self.persist();
    }

    fn snapshot_inbox(&self, user_id: &str) -> Option<Inbox> {
        read_lock(&self.state).users.get(user_id).cloned()
    }

    fn restore_closure(
        &self,
        user_id: &str,
        snapshot: Option<Inbox>,
    ) -> Box<dyn FnOnce() + Send> {
        let store = self.clone();
        let uid = user_id.to_string();
        Box::new(move || {
            {
                let mut state = write_lock(&store.state);
                match snapshot {
                    Some(inbox) => {
                        state.users.insert(uid, inbox);
                    }
                    None => {
                        state.users.remove(&uid);
                    }
                }
            }
            store.persist();
        })
    }

    fn persist(&self) {
        let partial = partialize(&read_lock(&self.state));
        self.bridge.store(&partial);
    }
}

/// Partialize for persistence: notifications are never optimistic creations
/// locally, so this only clears pending flags.
pub(crate) fn partialize(state: &NotificationsState) -> NotificationsState {
    let users = state
        .users
        .iter()
        .map(|(uid, inbox)| {
            let items = inbox
                .items
                .iter()
                .map(|n| {
                    let mut clean = n.clone();
                    clean.pending_update = false;
                    clean
                })
                .collect();
            (
                uid.clone(),
                Inbox {
                    items,
                    unread_count: inbox.unread_count,
                },
            )
        })
        .collect();
    NotificationsState { users }
}
