//! Comment store: page-scoped comment threads.
//!
//! Comments live in flat per-page lists. Threading is a filter, not a tree:
//! `thread_comments(page, parent)` selects by `parent_id` at read time, so a
//! reply arriving before its parent is never lost.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::entity::{temp_id, Comment};
use crate::ledger::{ActionError, ActionFactory, OperationHandle, OperationKind, PendingOperation};
use crate::persist::SnapshotBridge;
use crate::protocol::{Event, RoomId};
use crate::store::{read_lock, write_lock, StoreContext};

/// Persisted snapshot version for [`CommentsState`].
pub const COMMENTS_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommentsState {
    /// page id -> comments in arrival order.
    pub pages: HashMap<String, Vec<Comment>>,
}

#[derive(Clone)]
pub struct CommentStore {
    state: Arc<RwLock<CommentsState>>,
    ctx: StoreContext,
    bridge: SnapshotBridge<CommentsState>,
}

impl CommentStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self::with_persistence(
            ctx,
            SnapshotBridge::disabled("comments", COMMENTS_STATE_VERSION),
        )
    }

    pub fn with_persistence(ctx: StoreContext, bridge: SnapshotBridge<CommentsState>) -> Self {
        let state = bridge.load().unwrap_or_default();
        Self {
            state: Arc::new(RwLock::new(state)),
            ctx,
            bridge,
        }
    }

    // ── reads ──────────────────────────────────────────────────────

    pub fn comments(&self, page_id: &str) -> Vec<Comment> {
        read_lock(&self.state)
            .pages
            .get(page_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Comments in one thread: top-level when `parent_id` is `None`, replies
    /// to the given comment otherwise.
    pub fn thread_comments(&self, page_id: &str, parent_id: Option<&str>) -> Vec<Comment> {
        read_lock(&self.state)
            .pages
            .get(page_id)
            .map(|comments| {
                comments
                    .iter()
                    .filter(|c| c.parent_id.as_deref() == parent_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_pending(&self, page_id: &str, comment_id: &str) -> bool {
        self.ctx.ledger.is_pending(page_id, comment_id)
    }

    // ── optimistic mutators ────────────────────────────────────────

    /// Add a comment optimistically; `action` returns the canonical comment.
    pub fn add_comment_optimistic<F, Fut>(
        &self,
        page_id: &str,
        author_id: &str,
        parent_id: Option<&str>,
        body: &str,
        action: F,
    ) -> OperationHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Comment, ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_page(page_id);
        let mut comment = Comment::new(temp_id(), page_id, author_id, body);
        comment.parent_id = parent_id.map(str::to_string);
        comment.optimistic = true;
        {
            let mut state = write_lock(&self.state);
            state
                .pages
                .entry(page_id.to_string())
                .or_default()
                .push(comment.clone());
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::CommentCreate, page_id, &comment.id);
        let op_id = op.id;
        let optimistic = serde_json::to_value(&comment).unwrap_or(serde_json::Value::Null);

        let store = self.clone();
        let page = page_id.to_string();
        let temp = comment.id.clone();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let page = page.clone();
            let temp = temp.clone();
            Box::pin(async move {
                let mut canonical = fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                canonical.clear_transient();
                store.reconcile_create(&page, &temp, canonical.clone());
                store.ctx.emit(
                    RoomId::document(&page),
                    Event::CommentCreate { comment: canonical },
                );
                Ok(())
            })
        });

        self.ctx.ledger.add(
            op,
            optimistic,
            self.restore_closure(page_id, snapshot),
            factory,
        )
    }

    /// Edit a comment's body optimistically.
    pub fn update_comment_optimistic<F, Fut>(
        &self,
        page_id: &str,
        comment_id: &str,
        body: &str,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_page(page_id);
        {
            let mut state = write_lock(&self.state);
            let comments = state.pages.get_mut(page_id)?;
            let comment = comments.iter_mut().find(|c| c.id == comment_id)?;
            comment.body = body.to_string();
            comment.pending_update = true;
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::CommentUpdate, page_id, comment_id);
        let op_id = op.id;

        let store = self.clone();
        let page = page_id.to_string();
        let cid = comment_id.to_string();
        let new_body = body.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let page = page.clone();
            let cid = cid.clone();
            let new_body = new_body.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_pending(&page, &cid);
                store.ctx.emit(
                    RoomId::document(&page),
                    Event::CommentUpdate {
                        page_id: page.clone(),
                        comment_id: cid,
                        body: new_body,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "comment_id": comment_id, "body": body }),
            self.restore_closure(page_id, snapshot),
            factory,
        ))
    }

    /// Toggle a comment's resolved state optimistically.
    pub fn resolve_comment_optimistic<F, Fut>(
        &self,
        page_id: &str,
        comment_id: &str,
        resolved: bool,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_page(page_id);
        {
            let mut state = write_lock(&self.state);
            let comments = state.pages.get_mut(page_id)?;
            let comment = comments.iter_mut().find(|c| c.id == comment_id)?;
            comment.resolved = resolved;
            comment.pending_update = true;
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::CommentResolve, page_id, comment_id);
        let op_id = op.id;

        let store = self.clone();
        let page = page_id.to_string();
        let cid = comment_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let page = page.clone();
            let cid = cid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_pending(&page, &cid);
                store.ctx.emit(
                    RoomId::document(&page),
                    Event::CommentResolve {
                        page_id: page.clone(),
                        comment_id: cid,
                        resolved,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "comment_id": comment_id, "resolved": resolved }),
            self.restore_closure(page_id, snapshot),
            factory,
        ))
    }

    /// Delete a comment optimistically. Replies keep their `parent_id` and
    /// simply stop matching any thread filter.
    pub fn delete_comment_optimistic<F, Fut>(
        &self,
        page_id: &str,
        comment_id: &str,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_page(page_id);
        {
            let mut state = write_lock(&self.state);
            let comments = state.pages.get_mut(page_id)?;
            let before = comments.len();
            comments.retain(|c| c.id != comment_id);
            if comments.len() == before {
                return None;
            }
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::CommentDelete, page_id, comment_id);
        let op_id = op.id;

        let store = self.clone();
        let page = page_id.to_string();
        let cid = comment_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let page = page.clone();
            let cid = cid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.ctx.emit(
                    RoomId::document(&page),
                    Event::CommentDelete {
                        page_id: page.clone(),
                        comment_id: cid,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "comment_id": comment_id }),
            self.restore_closure(page_id, snapshot),
            factory,
        ))
    }

    // ── direct mutators (event router) ─────────────────────────────

    /// Insert a confirmed comment. Duplicate delivery is a no-op.
    pub fn apply_remote_create(&self, mut comment: Comment) {
        comment.clear_transient();
        {
            let mut state = write_lock(&self.state);
            let comments = state.pages.entry(comment.page_id.clone()).or_default();
            if comments.iter().any(|c| c.id == comment.id) {
                return;
            }
            comments.push(comment);
        }
        self.persist();
    }

    pub fn apply_remote_update(&self, page_id: &str, comment_id: &str, body: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(comments) = state.pages.get_mut(page_id) {
                if let Some(comment) = comments.iter_mut().find(|c| c.id == comment_id) {
                    comment.body = body.to_string();
                    comment.pending_update = false;
                }
            }
        }
        self.persist();
    }

    pub fn apply_remote_resolve(&self, page_id: &str, comment_id: &str, resolved: bool) {
        {
            let mut state = write_lock(&self.state);
            if let Some(comments) = state.pages.get_mut(page_id) {
                if let Some(comment) = comments.iter_mut().find(|c| c.id == comment_id) {
                    comment.resolved = resolved;
                    comment.pending_update = false;
                }
            }
        }
        self.persist();
    }

    pub fn apply_remote_delete(&self, page_id: &str, comment_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(comments) = state.pages.get_mut(page_id) {
                comments.retain(|c| c.id != comment_id);
            }
        }
        self.persist();
    }

    /// Replace one page's comments wholesale (initial load).
    pub fn set_comments(&self, page_id: &str, comments: Vec<Comment>) {
        {
            let mut state = write_lock(&self.state);
            state.pages.insert(page_id.to_string(), comments);
        }
        self.persist();
    }

    // ── internals ──────────────────────────────────────────────────

    fn reconcile_create(&self, page_id: &str, temp: &str, canonical: Comment) {
        {
            let mut state = write_lock(&self.state);
            if let Some(comments) = state.pages.get_mut(page_id) {
                if comments.iter().any(|c| c.id == canonical.id) {
                    comments.retain(|c| c.id != temp);
                } else if let Some(slot) = comments.iter_mut().find(|c| c.id == temp) {
                    *slot = canonical;
                }
            }
        }
        self.persist();
    }

    fn clear_pending(&self, page_id: &str, comment_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(comments) = state.pages.get_mut(page_id) {
                if let Some(comment) = comments.iter_mut().find(|c| c.id == comment_id) {
                    comment.pending_update = false;
                }
            }
        }
        self.persist();
    }

    fn snapshot_page(&self, page_id: &str) -> Option<Vec<Comment>> {
        read_lock(&self.state).pages.get(page_id).cloned()
    }

    fn restore_closure(
        &self,
        page_id: &str,
        snapshot: Option<Vec<Comment>>,
    ) -> Box<dyn FnOnce() + Send> {
        let store = self.clone();
        let page = page_id.to_string();
        Box::new(move || {
            {
                let mut state = write_lock(&store.state);
                match snapshot {
                    Some(comments) => {
                        state.pages.insert(page, comments);
                    }
                    None => {
                        state.pages.remove(&page);
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

/// Partialize for persistence: drop optimistic comments, clear pending flags.
pub(crate) fn partialize(state: &CommentsState) -> CommentsState {
    let pages = state
        .pages
        .iter()
        .map(|(page, comments)| {
            let clean = comments
                .iter()
                .filter(|c| !c.optimistic)
                .map(|c| {
                    let mut clean = c.clone();
                    clean.clear_transient();
                    clean
                })
                .collect();
            (page.clone(), clean)
        })
        .collect();
    CommentsState { pages }
}
