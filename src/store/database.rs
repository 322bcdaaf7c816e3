//! Database store: rows, cells, and properties of database blocks, all
//! scoped by `database_id`.
//!
//! Cell updates are upserts — writing to a property a row has no cell for
//! creates the cell instead of failing. Batch cell updates are one optimistic
//! transaction: one snapshot, one pending operation, one server call, so the
//! whole batch confirms or rolls back together.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::entity::{temp_id, DatabaseCell, DatabaseProperty, DatabaseRow};
use crate::ledger::{ActionError, ActionFactory, OperationHandle, OperationKind, PendingOperation};
use crate::persist::SnapshotBridge;
use crate::protocol::{CellEdit, Event, RoomId};
use crate::store::{read_lock, write_lock, StoreContext};

/// Persisted snapshot version for [`DatabaseState`].
pub const DATABASE_STATE_VERSION: u32 = 1;

/// One database block: an ordered row collection plus its property schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Database {
    pub id: String,
    pub rows: Vec<DatabaseRow>,
    pub properties: Vec<DatabaseProperty>,
}

impl Database {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rows: Vec::new(),
            properties: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseState {
    pub databases: HashMap<String, Database>,
}

/// Seed values for an optimistic row create.
#[derive(Debug, Clone, Default)]
pub struct RowDraft {
    pub order: Option<u32>,
    pub cells: Vec<DatabaseCell>,
}

#[derive(Clone)]
pub struct DatabaseStore {
    state: Arc<RwLock<DatabaseState>>,
    ctx: StoreContext,
    bridge: SnapshotBridge<DatabaseState>,
}

impl DatabaseStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self::with_persistence(
            ctx,
            SnapshotBridge::disabled("database", DATABASE_STATE_VERSION),
        )
    }

    pub fn with_persistence(ctx: StoreContext, bridge: SnapshotBridge<DatabaseState>) -> Self {
        let state = bridge.load().unwrap_or_default();
        Self {
            state: Arc::new(RwLock::new(state)),
            ctx,
            bridge,
        }
    }

    // ── reads ──────────────────────────────────────────────────────

    pub fn database_rows(&self, database_id: &str) -> Vec<DatabaseRow> {
        read_lock(&self.state)
            .databases
            .get(database_id)
            .map(|db| db.rows.clone())
            .unwrap_or_default()
    }

    pub fn row(&self, database_id: &str, row_id: &str) -> Option<DatabaseRow> {
        read_lock(&self.state)
            .databases
            .get(database_id)
            .and_then(|db| db.rows.iter().find(|r| r.id == row_id))
            .cloned()
    }

    pub fn cell(&self, database_id: &str, row_id: &str, property_id: &str) -> Option<DatabaseCell> {
        self.row(database_id, row_id)
            .and_then(|row| row.cell(property_id).cloned())
    }

    pub fn properties(&self, database_id: &str) -> Vec<DatabaseProperty> {
        read_lock(&self.state)
            .databases
            .get(database_id)
            .map(|db| db.properties.clone())
            .unwrap_or_default()
    }

    pub fn is_pending(&self, database_id: &str, entity_id: &str) -> bool {
        self.ctx.ledger.is_pending(database_id, entity_id)
    }

    // ── optimistic mutators ────────────────────────────────────────

    /// Create a row optimistically. It appears at once with a `temp-*` id and
    /// the `optimistic` flag; `action` must return the canonical row.
    pub fn create_row_optimistic<F, Fut>(
        &self,
        database_id: &str,
        draft: RowDraft,
        action: F,
    ) -> OperationHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DatabaseRow, ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_entry(database_id);
        let row = {
            let mut state = write_lock(&self.state);
            let db = entry(&mut state, database_id);
            let mut row = DatabaseRow::new(
                temp_id(),
                database_id,
                draft.order.unwrap_or(db.rows.len() as u32),
            );
            row.cells = draft.cells;
            row.optimistic = true;
            db.rows.push(row.clone());
            row
        };
        self.persist();

        let op = PendingOperation::new(OperationKind::RowCreate, database_id, &row.id);
        let op_id = op.id;
        let optimistic = serde_json::to_value(&row).unwrap_or(serde_json::Value::Null);

        let store = self.clone();
        let db_id = database_id.to_string();
        let temp = row.id.clone();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let temp = temp.clone();
            Box::pin(async move {
                let mut canonical = fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                canonical.clear_transient();
                store.reconcile_row_create(&db_id, &temp, canonical.clone());
                store
                    .ctx
                    .emit(RoomId::database(&db_id), Event::RowCreate { row: canonical });
                Ok(())
            })
        });

        self.ctx.ledger.add(
            op,
            optimistic,
            self.restore_closure(database_id, snapshot),
            factory,
        )
    }

    /// Reorder a row optimistically.
    pub fn update_row_optimistic<F, Fut>(
        &self,
        database_id: &str,
        row_id: &str,
        order: u32,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_entry(database_id);
        {
            let mut state = write_lock(&self.state);
            let db = state.databases.get_mut(database_id)?;
            let row = db.rows.iter_mut().find(|r| r.id == row_id)?;
            row.order = order;
            row.pending_update = true;
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::RowUpdate, database_id, row_id);
        let op_id = op.id;

        let store = self.clone();
        let db_id = database_id.to_string();
        let rid = row_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let rid = rid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_row_pending(&db_id, &rid);
                store.ctx.emit(
                    RoomId::database(&db_id),
                    Event::RowUpdate {
                        database_id: db_id.clone(),
                        row_id: rid,
                        order,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "row_id": row_id, "order": order }),
            self.restore_closure(database_id, snapshot),
            factory,
        ))
    }

    /// Delete a row optimistically. The snapshot is the removed row itself,
    /// reinserted at its old position on rollback.
    pub fn delete_row_optimistic<F, Fut>(
        &self,
        database_id: &str,
        row_id: &str,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let (removed, index) = {
            let mut state = write_lock(&self.state);
            let db = state.databases.get_mut(database_id)?;
            let index = db.rows.iter().position(|r| r.id == row_id)?;
            (db.rows.remove(index), index)
        };
        self.persist();

        let op = PendingOperation::new(OperationKind::RowDelete, database_id, row_id);
        let op_id = op.id;

        let rollback = {
            let store = self.clone();
            let db_id = database_id.to_string();
            let removed = removed.clone();
            Box::new(move || {
                {
                    let mut state = write_lock(&store.state);
                    let db = entry(&mut state, &db_id);
                    let at = index.min(db.rows.len());
                    db.rows.insert(at, removed);
                }
                store.persist();
            }) as Box<dyn FnOnce() + Send>
        };

        let store = self.clone();
        let db_id = database_id.to_string();
        let rid = row_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let rid = rid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.ctx.emit(
                    RoomId::database(&db_id),
                    Event::RowDelete {
                        database_id: db_id.clone(),
                        row_id: rid,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::to_value(&removed).unwrap_or(serde_json::Value::Null),
            rollback,
            factory,
        ))
    }

    /// Update one cell optimistically, creating the cell if the row has no
    /// entry for the property yet.
    pub fn update_cell_optimistic<F, Fut>(
        &self,
        database_id: &str,
        row_id: &str,
        property_id: &str,
        value: serde_json::Value,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_entry(database_id);
        {
            let mut state = write_lock(&self.state);
            let db = state.databases.get_mut(database_id)?;
            let row = db.rows.iter_mut().find(|r| r.id == row_id)?;
            upsert_cell(row, property_id, value.clone(), true);
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::CellUpdate, database_id, row_id);
        let op_id = op.id;

        let store = self.clone();
        let db_id = database_id.to_string();
        let rid = row_id.to_string();
        let pid = property_id.to_string();
        let optimistic = serde_json::json!({
            "row_id": row_id,
            "property_id": property_id,
            "value": value,
        });
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let rid = rid.clone();
            let pid = pid.clone();
            let value = value.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.clear_cell_pending(&db_id, &rid, &pid);
                store.ctx.emit(
                    RoomId::database(&db_id),
                    Event::CellUpdate {
                        database_id: db_id.clone(),
                        row_id: rid,
                        property_id: pid,
                        value,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            optimistic,
            self.restore_closure(database_id, snapshot),
            factory,
        ))
    }

    /// Apply a list of cell edits as one optimistic transaction: one rollback
    /// snapshot, one pending operation, one server call. A partial failure is
    /// not representable — the batch confirms or reverts as a whole.
    pub fn batch_update_cells_optimistic<F, Fut>(
        &self,
        database_id: &str,
        edits: Vec<CellEdit>,
        action: F,
    ) -> OperationHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_entry(database_id);
        {
            let mut state = write_lock(&self.state);
            let db = entry(&mut state, database_id);
            for edit in &edits {
                if let Some(row) = db.rows.iter_mut().find(|r| r.id == edit.row_id) {
                    upsert_cell(row, &edit.property_id, edit.value.clone(), true);
                }
            }
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::CellBatch, database_id, database_id);
        let op_id = op.id;

        let store = self.clone();
        let db_id = database_id.to_string();
        let optimistic = serde_json::to_value(&edits).unwrap_or(serde_json::Value::Null);
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let edits = edits.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                {
                    let mut state = write_lock(&store.state);
                    if let Some(db) = state.databases.get_mut(&db_id) {
                        for edit in &edits {
                            if let Some(row) = db.rows.iter_mut().find(|r| r.id == edit.row_id) {
                                if let Some(cell) =
                                    row.cells.iter_mut().find(|c| c.property_id == edit.property_id)
                                {
                                    cell.pending_update = false;
                                }
                            }
                        }
                    }
                }
                store.persist();
                store.ctx.emit(
                    RoomId::database(&db_id),
                    Event::CellsBatch {
                        database_id: db_id.clone(),
                        edits,
                    },
                );
                Ok(())
            })
        });

        self.ctx.ledger.add(
            op,
            optimistic,
            self.restore_closure(database_id, snapshot),
            factory,
        )
    }

    /// Add a property optimistically; `action` returns the canonical one.
    pub fn add_property_optimistic<F, Fut>(
        &self,
        database_id: &str,
        name: &str,
        kind: &str,
        action: F,
    ) -> OperationHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DatabaseProperty, ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_entry(database_id);
        let mut property = DatabaseProperty::new(temp_id(), database_id, name, kind);
        property.optimistic = true;
        {
            let mut state = write_lock(&self.state);
            entry(&mut state, database_id).properties.push(property.clone());
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::PropertyCreate, database_id, &property.id);
        let op_id = op.id;
        let optimistic = serde_json::to_value(&property).unwrap_or(serde_json::Value::Null);

        let store = self.clone();
        let db_id = database_id.to_string();
        let temp = property.id.clone();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let temp = temp.clone();
            Box::pin(async move {
                let mut canonical = fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                canonical.clear_transient();
                {
                    let mut state = write_lock(&store.state);
                    if let Some(db) = state.databases.get_mut(&db_id) {
                        if db.properties.iter().any(|p| p.id == canonical.id) {
                            db.properties.retain(|p| p.id != temp);
                        } else if let Some(slot) =
                            db.properties.iter_mut().find(|p| p.id == temp)
                        {
                            *slot = canonical.clone();
                        }
                    }
                }
                store.persist();
                store.ctx.emit(
                    RoomId::database(&db_id),
                    Event::PropertyCreate { property: canonical },
                );
                Ok(())
            })
        });

        self.ctx.ledger.add(
            op,
            optimistic,
            self.restore_closure(database_id, snapshot),
            factory,
        )
    }

    /// Rename a property optimistically.
    pub fn update_property_optimistic<F, Fut>(
        &self,
        database_id: &str,
        property_id: &str,
        name: &str,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_entry(database_id);
        {
            let mut state = write_lock(&self.state);
            let db = state.databases.get_mut(database_id)?;
            let prop = db.properties.iter_mut().find(|p| p.id == property_id)?;
            prop.name = name.to_string();
            prop.pending_update = true;
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::PropertyUpdate, database_id, property_id);
        let op_id = op.id;

        let store = self.clone();
        let db_id = database_id.to_string();
        let pid = property_id.to_string();
        let new_name = name.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let pid = pid.clone();
            let new_name = new_name.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                {
                    let mut state = write_lock(&store.state);
                    if let Some(db) = state.databases.get_mut(&db_id) {
                        if let Some(prop) = db.properties.iter_mut().find(|p| p.id == pid) {
                            prop.pending_update = false;
                        }
                    }
                }
                store.persist();
                store.ctx.emit(
                    RoomId::database(&db_id),
                    Event::PropertyUpdate {
                        database_id: db_id.clone(),
                        property_id: pid,
                        name: new_name,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "property_id": property_id, "name": name }),
            self.restore_closure(database_id, snapshot),
            factory,
        ))
    }

    /// Delete a property optimistically, sweeping its cells out of every row.
    pub fn delete_property_optimistic<F, Fut>(
        &self,
        database_id: &str,
        property_id: &str,
        action: F,
    ) -> Option<OperationHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let snapshot = self.snapshot_entry(database_id);
        {
            let mut state = write_lock(&self.state);
            let db = state.databases.get_mut(database_id)?;
            if !db.properties.iter().any(|p| p.id == property_id) {
                return None;
            }
            db.properties.retain(|p| p.id != property_id);
            for row in &mut db.rows {
                row.cells.retain(|c| c.property_id != property_id);
            }
        }
        self.persist();

        let op = PendingOperation::new(OperationKind::PropertyDelete, database_id, property_id);
        let op_id = op.id;

        let store = self.clone();
        let db_id = database_id.to_string();
        let pid = property_id.to_string();
        let factory: ActionFactory = Box::new(move || {
            let fut = action();
            let store = store.clone();
            let db_id = db_id.clone();
            let pid = pid.clone();
            Box::pin(async move {
                fut.await?;
                if !store.ctx.ledger.contains(op_id) {
                    return Ok(());
                }
                store.ctx.emit(
                    RoomId::database(&db_id),
                    Event::PropertyDelete {
                        database_id: db_id.clone(),
                        property_id: pid,
                    },
                );
                Ok(())
            })
        });

        Some(self.ctx.ledger.add(
            op,
            serde_json::json!({ "property_id": property_id }),
            self.restore_closure(database_id, snapshot),
            factory,
        ))
    }

    // ── direct mutators (event router) ─────────────────────────────

    /// Insert a confirmed row. Duplicate delivery is a no-op.
    pub fn apply_remote_row_create(&self, mut row: DatabaseRow) {
        row.clear_transient();
        {
            let mut state = write_lock(&self.state);
            let db = entry(&mut state, &row.database_id);
            if db.rows.iter().any(|r| r.id == row.id) {
                return;
            }
            db.rows.push(row);
        }
        self.persist();
    }

    pub fn apply_remote_row_update(&self, database_id: &str, row_id: &str, order: u32) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                if let Some(row) = db.rows.iter_mut().find(|r| r.id == row_id) {
                    row.order = order;
                    row.pending_update = false;
                }
            }
        }
        self.persist();
    }

    pub fn apply_remote_row_delete(&self, database_id: &str, row_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                db.rows.retain(|r| r.id != row_id);
            }
        }
        self.persist();
    }

    /// Upsert a confirmed cell value.
    pub fn apply_remote_cell_update(
        &self,
        database_id: &str,
        row_id: &str,
        property_id: &str,
        value: serde_json::Value,
    ) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                if let Some(row) = db.rows.iter_mut().find(|r| r.id == row_id) {
                    upsert_cell(row, property_id, value, false);
                }
            }
        }
        self.persist();
    }

    pub fn apply_remote_cells_batch(&self, database_id: &str, edits: &[CellEdit]) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                for edit in edits {
                    if let Some(row) = db.rows.iter_mut().find(|r| r.id == edit.row_id) {
                        upsert_cell(row, &edit.property_id, edit.value.clone(), false);
                    }
                }
            }
        }
        self.persist();
    }

    pub fn apply_remote_property_create(&self, mut property: DatabaseProperty) {
        property.clear_transient();
        {
            let mut state = write_lock(&self.state);
            let db = entry(&mut state, &property.database_id);
            if db.properties.iter().any(|p| p.id == property.id) {
                return;
            }
            db.properties.push(property);
        }
        self.persist();
    }

    pub fn apply_remote_property_update(&self, database_id: &str, property_id: &str, name: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                if let Some(prop) = db.properties.iter_mut().find(|p| p.id == property_id) {
                    prop.name = name.to_string();
                    prop.pending_update = false;
                }
            }
        }
        self.persist();
    }

    pub fn apply_remote_property_delete(&self, database_id: &str, property_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                db.properties.retain(|p| p.id != property_id);
                for row in &mut db.rows {
                    row.cells.retain(|c| c.property_id != property_id);
                }
            }
        }
        self.persist();
    }

    /// Replace one database wholesale (initial load from the server).
    pub fn set_database(&self, database: Database) {
        {
            let mut state = write_lock(&self.state);
            state.databases.insert(database.id.clone(), database);
        }
        self.persist();
    }

    // ── internals ──────────────────────────────────────────────────

    fn reconcile_row_create(&self, database_id: &str, temp: &str, canonical: DatabaseRow) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                if db.rows.iter().any(|r| r.id == canonical.id) {
                    // Router delivery raced the direct response; drop the temp
                    // entry rather than duplicating the canonical one.
                    db.rows.retain(|r| r.id != temp);
                } else if let Some(slot) = db.rows.iter_mut().find(|r| r.id == temp) {
                    *slot = canonical;
                }
            }
        }
        self.persist();
    }

    fn clear_row_pending(&self, database_id: &str, row_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                if let Some(row) = db.rows.iter_mut().find(|r| r.id == row_id) {
                    row.pending_update = false;
                }
            }
        }
        self.persist();
    }

    fn clear_cell_pending(&self, database_id: &str, row_id: &str, property_id: &str) {
        {
            let mut state = write_lock(&self.state);
            if let Some(db) = state.databases.get_mut(database_id) {
                if let Some(row) = db.rows.iter_mut().find(|r| r.id == row_id) {
                    if let Some(cell) = row.cells.iter_mut().find(|c| c.property_id == property_id)
                    {
                        cell.pending_update = false;
                    }
                }
            }
        }
        self.persist();
    }

    /// Snapshot of one database entry (`None` if the scope is empty), enough
    /// to restore the scope exactly on rollback.
    fn snapshot_entry(&self, database_id: &str) -> Option<Database> {
        read_lock(&self.state).databases.get(database_id).cloned()
    }

    fn restore_closure(
        &self,
        database_id: &str,
        snapshot: Option<Database>,
    ) -> Box<dyn FnOnce() + Send> {
        let store = self.clone();
        let db_id = database_id.to_string();
        Box::new(move || {
            {
                let mut state = write_lock(&store.state);
                match snapshot {
                    Some(db) => {
                        state.databases.insert(db_id, db);
                    }
                    None => {
                        state.databases.remove(&db_id);
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

fn entry<'a>(state: &'a mut DatabaseState, database_id: &str) -> &'a mut Database {
    state
        .databases
        .entry(database_id.to_string())
        .or_insert_with(|| Database::new(database_id))
}

fn upsert_cell(row: &mut DatabaseRow, property_id: &str, value: serde_json::Value, pending: bool) {
    match row.cells.iter_mut().find(|c| c.property_id == property_id) {
        Some(cell) => {
            cell.value = value;
            cell.pending_update = pending;
        }
        None => {
            let mut cell = DatabaseCell::new(property_id, value);
            cell.pending_update = pending;
            row.cells.push(cell);
        }
    }
}

/// Partialize for persistence: drop optimistic rows/properties, clear
/// pending flags everywhere else.
pub(crate) fn partialize(state: &DatabaseState) -> DatabaseState {
    let databases = state
        .databases
        .iter()
        .map(|(id, db)| {
            let rows = db
                .rows
                .iter()
                .filter(|r| !r.optimistic)
                .map(|r| {
                    let mut clean = r.clone();
                    clean.clear_transient();
                    clean
                })
                .collect();
            let properties = db
                .properties
                .iter()
                .filter(|p| !p.optimistic)
                .map(|p| {
                    let mut clean = p.clone();
                    clean.clear_transient();
                    clean
                })
                .collect();
            (
                id.clone(),
                Database {
                    id: db.id.clone(),
                    rows,
                    properties,
                },
            )
        })
        .collect();
    DatabaseState { databases }
}
