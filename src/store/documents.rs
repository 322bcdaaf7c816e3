//! Document store: the workspace page tree plus its flat side-lists.
//!
//! The tree is arena-by-nesting — children live inline in their parent — so
//! update/remove by id are recursive rewrites. Archived pages leave the tree
//! (and every flat list) and land at the head of the trash; restore moves a
//! page back to the tree root, not to its original parent, which may itself
//! have been trashed.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::entity::{temp_id, Document, DocumentPatch};
use crate::ledger::{ActionError, ActionFactory, OperationHandle, OperationKind, PendingOperation};
use crate::persist::SnapshotBridge;
use crate::protocol::{Event, RoomId};
use crate::store::{read_lock, write_lock, StoreContext};

/// Scope key for document operations — the workspace owns one tree.
pub const WORKSPACE_SCOPE: &str = "workspace";

/// Persisted snapshot version for [`DocumentsState`].
pub const DOCUMENTS_STATE_VERSION: u32 = 1;

/// Which flat side-list to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Recent,
    Favorite,
    Published,
    Shared,
}

/// Full document-store state: the tree plus denormalized flat lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentsState {
    pub documents: Vec<Document>,
    pub recent_pages: Vec<Document>,
    pub favorite_pages: Vec<Document>,
    pub published_pages: Vec<Document>,
    pub shared_pages: Vec<Document>,
    pub trash_pages: Vec<Document>,
}

#[derive(Clone)]
pub struct DocumentStore {
    state: Arc<RwLock<DocumentsState>>,
    ctx: StoreContext,
    bridge: SnapshotBridge<DocumentsState>,
}

impl DocumentStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self::with_persistence(
            ctx,
            SnapshotBridge::disabled("documents", DOCUMENTS_STATE_VERSION),
        )
    }

    /// Construct with a persistence bridge, loading the cached snapshot if
    /// one exists.
    pub fn with_persistence(ctx: StoreContext, bridge: SnapshotBridge<DocumentsState>) -> Self {
        let state = bridge.load().unwrap_or_default();
        Self {
            state: Arc::new(RwLock::new(state)),
            ctx,
            bridge,
        }
    }

    // ── reads ──────────────────────────────────────────────────────

    pub fn documents(&self) -> Vec<Document> {
        read_lock(&self.state).documents.clone()
    }

    pub fn find_document(&self, id: &str) -> Option<Document> {
        find_in(&read_lock(&self.state).documents, id).cloned()
    }

    pub fn list(&self, kind: ListKind) -> Vec<Document> {
        let state = read_lock(&self.state);
        list_of(&state, kind).clone()
    }

    pub fn trash(&self) -> Vec<Document> {
        read_lock(&self.state).trash_pages.clone()
    }

    pub fn is_pending(&self, document_id: &str) -> bool {
        self.ctx.ledger.is_pending(WORKSPACE_SCOPE, document_id)
    }

    // ── optimistic mutators ────────────────────────────────────────

    /// Create a page optimistically under `parent_id` (or at the root).
    ///
    /// The page appears immediately with a `temp-*` id and the `optimistic`
    /// flag; on confirmation the temp entry is replaced by the canonical
    /// document returned by `action`.
    pub fn add_document_optimistic<F, Fut>(
        &self,
        title: &str,
        parent_id: Option<&str>,
        action: F,
    ) -> OperationHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Document, ActionError>> + Send + 'static,
    {
        let mut doc = Document::new(temp_id(), title);
        doc.parent_id = parent_id.map(str::to_string);
        doc.optimistic = true;

        let snapshot = read_lock(&self.state).clone();
        {
            let mut state = write_lock(&self.state);
            match parent_id {
                Some(pid) if insert_under(&mut state.documents, pid, doc.clone()) => {}
                _ => state.documents.push(doc.clone()),
            }
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::DocCreate, WORKSPACE_SCOPE, &doc.id);
        let op_id = op.id;
        let optimistic = serde_json::to_value(&doc).unwrap_or(serde_json::Value::Null);

        let store = self.clone();
        let temp = doc.id.clone();
        let parent: Option<String> = parent_id.map(str::to_string);
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let temp = temp.clone();
            let parent = parent.clone();
            Box::pin(async move {
                let mut canonical = fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                canonical.clear_transient();
                store.reconcile_create(&temp, canonical.clone());
                store.ctx.emit(
                    RoomId::document(&canonical.id),
                    Event::DocCreate {
                        document: canonical,
                        parent_id: parent,
                    },
                );
                Ok(())
            })
        });

        self.ctx
            .ledger
            .add(op, optimistic, self.restore_closure(snapshot), factory)
    }

    /// Patch a page optimistically. Returns `None` when the page is unknown.
    pub fn update_document_optimistic<F, Fut>(
        &self,
        id: &str,
        patch: DocumentPatch,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = read_lock(&self.state).clone();
        {
            let mut state = write_lock(&self.state);
            let patch = patch.clone();
            if !update_everywhere(&mut state, id, &mut |doc| {
                patch.apply_to(doc);
                doc.pending_update = true;
            }) {
                return None;
            }
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::DocUpdate, WORKSPACE_SCOPE, id);
        let op_id = op.id;
        let optimistic = serde_json::to_value(&patch).unwrap_or(serde_json::Value::Null);

        let store = self.clone();
        let doc_id = id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let doc_id = doc_id.clone();
            let patch = patch.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_pending(&doc_id);
                store.ctx.emit(
                    RoomId::document(&doc_id),
                    Event::DocUpdate { id: doc_id, patch },
                );
                Ok(())
            })
        });

        Some(
            self.ctx
                .ledger
                .add(op, optimistic, self.restore_closure(snapshot), factory),
        )
    }

    /// Archive a page optimistically: remove it from the tree and every flat
    /// list, and prepend it (tagged archived) to the trash.
    pub fn archive_document_optimistic<F, Fut>(&self, id: &str, action: F) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = read_lock(&self.state).clone();
        {
            let mut state = write_lock(&self.state);
            let mut node = remove_from(&mut state.documents, id)?;
            for kind in [
                ListKind::Recent,
                ListKind::Favorite,
                ListKind::Published,
                ListKind::Shared,
            ] {
                list_of_mut(&mut state, kind).retain(|d| d.id != id);
            }
            node.archived = true;
            node.pending_update = true;
            state.trash_pages.insert(0, node);
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::DocArchive, WORKSPACE_SCOPE, id);
        let op_id = op.id;

        let store = self.clone();
        let doc_id = id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let doc_id = doc_id.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_pending(&doc_id);
                store.ctx.emit(RoomId::document(&doc_id), Event::DocArchive { id: doc_id });
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "id": id }),
            self.restore_closure(snapshot),
            factory,
        ))
    }

    // ── direct mutators (event router / local non-optimistic ops) ──

    /// Insert a confirmed page. Duplicate delivery is a no-op.
    pub fn apply_remote_create(&self, mut document: Document, parent_id: Option<String>) {
        document.clear_transient();
        {
            let mut state = write_lock(&self.state);
            if find_in(&state.documents, &document.id).is_some() {
                return;
            }
            match parent_id.as_deref() {
                Some(pid) if insert_under(&mut state.documents, pid, document.clone()) => {}
                _ => state.documents.push(document),
            }
        }
        self.persist();
    }

    pub fn apply_remote_update(&self, id: &str, patch: &DocumentPatch) {
        {
            let mut state = write_lock(&self.state);
            update_everywhere(&mut state, id, &mut |doc| {
                patch.apply_to(doc);
                doc.pending_update = false;
            });
        }
        self.persist();
    }

    pub fn apply_remote_archive(&self, id: &str) {
        {
            let mut state = write_lock(&self.state);
            let Some(mut node) = remove_from(&mut state.documents, id) else {
                return;
            };
            for kind in [
                ListKind::Recent,
                ListKind::Favorite,
                ListKind::Published,
                ListKind::Shared,
            ] {
                list_of_mut(&mut state, kind).retain(|d| d.id != id);
            }
            node.archived = true;
            node.clear_transient();
            state.trash_pages.insert(0, node);
        }
        self.persist();
    }

    /// Move a trashed page back to the tree root. Non-optimistic by design:
    /// the original parent may itself be trashed.
    pub fn restore_document(&self, id: &str) {
        {
            let mut state = write_lock(&self.state);
            let Some(pos) = state.trash_pages.iter().position(|d| d.id == id) else {
                return;
            };
            let mut node = state.trash_pages.remove(pos);
            node.archived = false;
            node.parent_id = None;
            node.clear_transient();
            if find_in(&state.documents, id).is_none() {
                state.documents.push(node);
            }
        }
        self.persist();
    }

    /// Track a confirmed page in one of the flat side-lists, replacing any
    /// previous entry with the same id.
    pub fn add_to_list(&self, kind: ListKind, document: Document) {
        {
            let mut state = write_lock(&self.state);
            let list = list_of_mut(&mut state, kind);
            list.retain(|d| d.id != document.id);
            list.insert(0, document);
        }
        self.persist();
    }

    // ── internals ──────────────────────────────────────────────────

    fn reconcile_create(&self, temp: &str, canonical: Document) {
        {
            let mut state = write_lock(&self.state);
            if find_in(&state.documents, &canonical.id).is_some() {
                // The event router raced the direct response; keep the entry
                // it already delivered and drop the temp one.
                remove_from(&mut state.documents, temp);
            } else {
                replace_in(&mut state.documents, temp, canonical);
            }
        }
        self.persist();
    }

    fn clear_pending(&self, id: &str) {
        {
            let mut state = write_lock(&self.state);
            update_everywhere(&mut state, id, &mut |doc| doc.pending_update = false);
        }
        self.persist();
    }

    fn restore_closure(&self, snapshot: DocumentsState) -> Box<dyn FnOnce() + Send> {
        let state = Arc::clone(&self.state);
        let bridge = self.bridge.clone();
        Box::new(move || {
            *state
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = snapshot;
            let partial = partialize(&read_snapshot(&state));
            bridge.store(&partial);
        })
    }

    fn persist(&self) {
        let partial = partialize(&read_lock(&self.state));
        self.bridge.store(&partial);
    }
}

fn read_snapshot(state: &Arc<RwLock<DocumentsState>>) -> DocumentsState {
    state
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

fn list_of(state: &DocumentsState, kind: ListKind) -> &Vec<Document> {
    match kind {
        ListKind::Recent => &state.recent_pages,
        ListKind::Favorite => &state.favorite_pages,
        ListKind::Published => &state.published_pages,
        ListKind::Shared => &state.shared_pages,
    }
}

fn list_of_mut(state: &mut DocumentsState, kind: ListKind) -> &mut Vec<Document> {
    match kind {
        ListKind::Recent => &mut state.recent_pages,
        ListKind::Favorite => &mut state.favorite_pages,
        ListKind::Published => &mut state.published_pages,
        ListKind::Shared => &mut state.shared_pages,
    }
}

// ── tree helpers ───────────────────────────────────────────────────

pub(crate) fn find_in<'a>(nodes: &'a [Document], id: &str) -> Option<&'a Document> {
    for node in nodes {
        if node.id == id {
            return Some(node);
        }
        if let Some(found) = find_in(&node.children, id) {
            return Some(found);
        }
    }
    None
}

/// Insert `child` under the node with id `parent_id`, bumping the parent's
/// child counter. Returns false when the parent is not in the tree.
pub(crate) fn insert_under(nodes: &mut Vec<Document>, parent_id: &str, child: Document) -> bool {
    for node in nodes.iter_mut() {
        if node.id == parent_id {
            node.children.push(child);
            node.child_count += 1;
            return true;
        }
        if insert_under(&mut node.children, parent_id, child.clone()) {
            return true;
        }
    }
    false
}

/// Apply `f` to the node with the given id, wherever it sits in the tree.
fn update_in(nodes: &mut Vec<Document>, id: &str, f: &mut dyn FnMut(&mut Document)) -> bool {
    for node in nodes.iter_mut() {
        if node.id == id {
            f(node);
            return true;
        }
        if update_in(&mut node.children, id, f) {
            return true;
        }
    }
    false
}

/// Remove a node (with its subtree), decrementing its parent's child counter.
pub(crate) fn remove_from(nodes: &mut Vec<Document>, id: &str) -> Option<Document> {
    if let Some(pos) = nodes.iter().position(|n| n.id == id) {
        return Some(nodes.remove(pos));
    }
    for node in nodes.iter_mut() {
        if let Some(pos) = node.children.iter().position(|n| n.id == id) {
            let removed = node.children.remove(pos);
            node.child_count = node.child_count.saturating_sub(1);
            return Some(removed);
        }
        if let Some(removed) = remove_from(&mut node.children, id) {
            return Some(removed);
        }
    }
    None
}

/// Replace the node with id `id` in place, preserving its tree position.
fn replace_in(nodes: &mut Vec<Document>, id: &str, replacement: Document) -> bool {
    for node in nodes.iter_mut() {
        if node.id == id {
            *node = replacement;
            return true;
        }
        if replace_in(&mut node.children, id, replacement.clone()) {
            return true;
        }
    }
    false
}

/// Update a page in the tree and in every flat-list copy of it.
fn update_everywhere(
    state: &mut DocumentsState,
    id: &str,
    f: &mut dyn FnMut(&mut Document),
) -> bool {
    let mut touched = update_in(&mut state.documents, id, f);
    for list in [
        &mut state.recent_pages,
        &mut state.favorite_pages,
        &mut state.published_pages,
        &mut state.shared_pages,
        &mut state.trash_pages,
    ] {
        for doc in list.iter_mut() {
            if doc.id == id {
                f(doc);
                touched = true;
            }
        }
    }
    touched
}

/// Partialize for persistence: drop optimistic entities and clear pending
/// flags so a crash mid-mutation never resurrects a ghost on reload.
pub(crate) fn partialize(state: &DocumentsState) -> DocumentsState {
    DocumentsState {
        documents: strip_tree(&state.documents),
        recent_pages: strip_tree(&state.recent_pages),
        favorite_pages: strip_tree(&state.favorite_pages),
        published_pages: strip_tree(&state.published_pages),
        shared_pages: strip_tree(&state.shared_pages),
        trash_pages: strip_tree(&state.trash_pages),
    }
}

fn strip_tree(nodes: &[Document]) -> Vec<Document> {
    nodes
        .iter()
        .filter(|d| !d.optimistic)
        .map(|d| {
            let mut clean = d.clone();
            clean.pending_update = false;
            clean.children = strip_tree(&d.children);
            clean.child_count = clean.children.len() as u32;
            clean
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::OptimisticLedger;

    fn store() -> DocumentStore {
        DocumentStore::new(StoreContext::new(OptimisticLedger::new()))
    }

    fn seeded_tree() -> Vec<Document> {
        let mut root = Document::new("root", "Root");
        let mut mid = Document::new("mid", "Middle");
        mid.parent_id = Some("root".to_string());
        let mut leaf = Document::new("leaf", "Leaf");
        leaf.parent_id = Some("mid".to_string());
        mid.children.push(leaf);
        mid.child_count = 1;
        root.children.push(mid);
        root.child_count = 1;
        vec![root]
    }

    #[test]
    fn test_find_in_nested() {
        let tree = seeded_tree();
        assert!(find_in(&tree, "leaf").is_some());
        assert!(find_in(&tree, "missing").is_none());
    }

    #[test]
    fn test_insert_under_bumps_counter() {
        let mut tree = seeded_tree();
        let inserted = insert_under(&mut tree, "mid", Document::new("new", "New"));
        assert!(inserted);
        let mid = find_in(&tree, "mid").unwrap();
        assert_eq!(mid.child_count, 2);
        assert_eq!(mid.children.len(), 2);
    }

    #[test]
    fn test_remove_from_decrements_counter() {
        let mut tree = seeded_tree();
        let removed = remove_from(&mut tree, "leaf").unwrap();
        assert_eq!(removed.id, "leaf");
        let mid = find_in(&tree, "mid").unwrap();
        assert_eq!(mid.child_count, 0);
        assert!(remove_from(&mut tree, "leaf").is_none());
    }

    #[test]
    fn test_apply_remote_create_duplicate_dropped() {
        let store = store();
        store.apply_remote_create(Document::new("d1", "One"), None);
        store.apply_remote_create(Document::new("d1", "One again"), None);

        let docs = store.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "One");
    }

    #[test]
    fn test_apply_remote_archive_sweeps_lists() {
        let store = store();
        let doc = Document::new("d1", "One");
        store.apply_remote_create(doc.clone(), None);
        store.add_to_list(ListKind::Favorite, doc.clone());
        store.add_to_list(ListKind::Recent, doc);

        store.apply_remote_archive("d1");

        assert!(store.documents().is_empty());
        assert!(store.list(ListKind::Favorite).is_empty());
        assert!(store.list(ListKind::Recent).is_empty());
        let trash = store.trash();
        assert_eq!(trash.len(), 1);
        assert!(trash[0].archived);
    }

    #[test]
    fn test_restore_lands_at_root() {
        let store = store();
        let parent = Document::new("parent", "Parent");
        store.apply_remote_create(parent, None);
        let mut child = Document::new("child", "Child");
        child.parent_id = Some("parent".to_string());
        store.apply_remote_create(child, Some("parent".to_string()));

        store.apply_remote_archive("child");
        store.restore_document("child");

        let docs = store.documents();
        assert_eq!(docs.len(), 2);
        let restored = docs.iter().find(|d| d.id == "child").unwrap();
        assert!(restored.parent_id.is_none());
        assert!(!restored.archived);
        assert!(store.trash().is_empty());
    }

    #[test]
    fn test_partialize_strips_ghosts() {
        let mut optimistic_doc = Document::new("temp-x", "Draft");
        optimistic_doc.optimistic = true;
        let mut pending_doc = Document::new("d1", "Real");
        pending_doc.pending_update = true;
        pending_doc.children.push(optimistic_doc.clone());
        pending_doc.child_count = 1;

        let state = DocumentsState {
            documents: vec![pending_doc, optimistic_doc],
            ..DocumentsState::default()
        };
        let partial = partialize(&state);

        assert_eq!(partial.documents.len(), 1);
        assert_eq!(partial.documents[0].id, "d1");
        assert!(!partial.documents[0].pending_update);
        assert!(partial.documents[0].children.is_empty());
        assert_eq!(partial.documents[0].child_count, 0);
    }
}
