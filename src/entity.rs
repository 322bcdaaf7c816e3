//! Domain entities shared by the stores, the wire protocol, and persistence.
//!
//! Every entity carries two transient flags that are never part of the durable
//! schema:
//!
//! - `optimistic` — the entity exists only locally, pending server confirmation
//!   of its creation.
//! - `pending_update` — a mutation to an existing entity is in flight.
//!
//! Both flags are stripped by the persistence partialize pass and cleared when
//! canonical state is written during reconciliation.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a temporary entity id for an optimistic create.
///
/// The temporary id is replaced (never duplicated) by the canonical id once
/// the server confirms the create.
pub fn temp_id() -> String {
    format!("temp-{}", Uuid::new_v4())
}

/// Whether an id is a temporary (pre-confirmation) id.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with("temp-")
}

/// A page in the workspace tree.
///
/// Children are owned inline — the tree is an arena-by-nesting, so there are
/// no parent back-pointers and updates by id are recursive rewrites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub icon: Option<String>,
    pub archived: bool,
    /// Denormalized child counter, kept in sync by tree mutations.
    pub child_count: u32,
    pub children: Vec<Document>,
    pub updated_at: u64,
    #[serde(default)]
    pub optimistic: bool,
    #[serde(default)]
    pub pending_update: bool,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            icon: None,
            archived: false,
            child_count: 0,
            children: Vec::new(),
            updated_at: now_millis(),
            optimistic: false,
            pending_update: false,
        }
    }

    /// Clear transient sync flags on this node only.
    pub fn clear_transient(&mut self) {
        self.optimistic = false;
        self.pending_update = false;
    }
}

/// Field-level patch for a document. `None` fields are untouched, so two
/// concurrent updates to different fields reconcile independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl DocumentPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            icon: None,
        }
    }

    /// Apply this patch to a document, bumping its modification time.
    pub fn apply_to(&self, doc: &mut Document) {
        if let Some(ref title) = self.title {
            doc.title = title.clone();
        }
        if let Some(ref icon) = self.icon {
            doc.icon = Some(icon.clone());
        }
        doc.updated_at = now_millis();
    }
}

/// A row in a database block. Cells are exclusively owned by their row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseRow {
    pub id: String,
    pub database_id: String,
    pub order: u32,
    pub cells: Vec<DatabaseCell>,
    #[serde(default)]
    pub optimistic: bool,
    #[serde(default)]
    pub pending_update: bool,
}

impl DatabaseRow {
    pub fn new(id: impl Into<String>, database_id: impl Into<String>, order: u32) -> Self {
        Self {
            id: id.into(),
            database_id: database_id.into(),
            order,
            cells: Vec::new(),
            optimistic: false,
            pending_update: false,
        }
    }

    /// Clear transient flags on the row and every cell.
    pub fn clear_transient(&mut self) {
        self.optimistic = false;
        self.pending_update = false;
        for cell in &mut self.cells {
            cell.pending_update = false;
        }
    }

    pub fn cell(&self, property_id: &str) -> Option<&DatabaseCell> {
        self.cells.iter().find(|c| c.property_id == property_id)
    }
}

/// A single cell, identified within its row by `property_id`.
///
/// The value is an opaque serializable blob — the sync core moves it intact
/// and never interprets property-type semantics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseCell {
    pub property_id: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub pending_update: bool,
}

impl DatabaseCell {
    pub fn new(property_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            property_id: property_id.into(),
            value,
            pending_update: false,
        }
    }
}

/// A column definition for a database block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseProperty {
    pub id: String,
    pub database_id: String,
    pub name: String,
    /// Property type tag ("text", "number", "select", …). Opaque to the core.
    pub kind: String,
    #[serde(default)]
    pub optimistic: bool,
    #[serde(default)]
    pub pending_update: bool,
}

impl DatabaseProperty {
    pub fn new(
        id: impl Into<String>,
        database_id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            database_id: database_id.into(),
            name: name.into(),
            kind: kind.into(),
            optimistic: false,
            pending_update: false,
        }
    }

    pub fn clear_transient(&mut self) {
        self.optimistic = false;
        self.pending_update = false;
    }
}

/// A comment on a page, threaded via `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: String,
    pub page_id: String,
    pub parent_id: Option<String>,
    pub author_id: String,
    pub body: String,
    pub resolved: bool,
    pub created_at: u64,
    #[serde(default)]
    pub optimistic: bool,
    #[serde(default)]
    pub pending_update: bool,
}

impl Comment {
    pub fn new(
        id: impl Into<String>,
        page_id: impl Into<String>,
        author_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            page_id: page_id.into(),
            parent_id: None,
            author_id: author_id.into(),
            body: body.into(),
            resolved: false,
            created_at: now_millis(),
            optimistic: false,
            pending_update: false,
        }
    }

    pub fn clear_transient(&mut self) {
        self.optimistic = false;
        self.pending_update = false;
    }
}

/// A notification targeted at one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub message: String,
    pub read: bool,
    pub created_at: u64,
    #[serde(default)]
    pub pending_update: bool,
}

impl Notification {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            kind: kind.into(),
            message: message.into(),
            read: false,
            created_at: now_millis(),
            pending_update: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_id_shape() {
        let id = temp_id();
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("row-42"));
    }

    #[test]
    fn test_temp_ids_unique() {
        assert_ne!(temp_id(), temp_id());
    }

    #[test]
    fn test_document_patch_partial() {
        let mut doc = Document::new("d1", "Old title");
        doc.icon = Some("📄".to_string());

        DocumentPatch::title("New title").apply_to(&mut doc);

        assert_eq!(doc.title, "New title");
        // Untouched fields survive
        assert_eq!(doc.icon.as_deref(), Some("📄"));
    }

    #[test]
    fn test_row_clear_transient_reaches_cells() {
        let mut row = DatabaseRow::new("r1", "db1", 0);
        row.optimistic = true;
        let mut cell = DatabaseCell::new("propA", serde_json::json!(42));
        cell.pending_update = true;
        row.cells.push(cell);

        row.clear_transient();

        assert!(!row.optimistic);
        assert!(!row.cells[0].pending_update);
    }

    #[test]
    fn test_transient_flags_default_on_deserialize() {
        // Wire payloads may omit the flags entirely
        let json = r#"{"id":"r1","database_id":"db1","order":0,"cells":[]}"#;
        let row: DatabaseRow = serde_json::from_str(json).unwrap();
        assert!(!row.optimistic);
        assert!(!row.pending_update);
    }
}
