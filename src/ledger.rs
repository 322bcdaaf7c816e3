//! Optimistic update ledger: the single authority for "did this mutation
//! survive contact with the server".
//!
//! Each in-flight mutation is a command record pairing a [`PendingOperation`]
//! with its rollback closure and a re-invocable server action. The ledger
//! knows nothing about entity shapes — the optimistic state it holds is an
//! opaque JSON snapshot kept only for inspection.
//!
//! Lifecycle:
//! ```text
//! Store.x_optimistic()
//!       │ apply locally, snapshot pre-state
//!       ▼
//! Ledger::add ──► spawn process task ──► server action
//!       │                │ Ok            │ Err
//!       │                ▼               ▼
//!       │            remove record   retry (2s/4s/8s), then
//!       │                            rollback + remove
//!       ▼
//! OperationHandle.settled resolves
//! ```
//!
//! The ledger cannot distinguish transient failures from logical rejections;
//! both are retried identically up to the cap, after which rollback fires.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::entity::now_millis;

/// Error returned by a server action. The ledger treats every failure alike —
/// it carries a message for logging only.
#[derive(Debug, Clone)]
pub struct ActionError(pub String);

impl ActionError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server action failed: {}", self.0)
    }
}

impl std::error::Error for ActionError {}

/// Boxed future returned by a wrapped server action.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send>>;

/// Re-invocable server-action factory; called once per attempt so retries
/// replay the full call.
pub type ActionFactory = Box<dyn Fn() -> ActionFuture + Send + Sync>;

/// Rollback closure restoring the pre-mutation snapshot. Invoked at most once.
pub type Rollback = Box<dyn FnOnce() + Send>;

/// What kind of mutation an operation is, tagged entity-then-verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "doc:create")]
    DocCreate,
    #[serde(rename = "doc:update")]
    DocUpdate,
    #[serde(rename = "doc:archive")]
    DocArchive,
    #[serde(rename = "row:create")]
    RowCreate,
    #[serde(rename = "row:update")]
    RowUpdate,
    #[serde(rename = "row:delete")]
    RowDelete,
    #[serde(rename = "cell:update")]
    CellUpdate,
    #[serde(rename = "cell:batch")]
    CellBatch,
    #[serde(rename = "property:create")]
    PropertyCreate,
    #[serde(rename = "property:update")]
    PropertyUpdate,
    #[serde(rename = "property:delete")]
    PropertyDelete,
    #[serde(rename = "comment:create")]
    CommentCreate,
    #[serde(rename = "comment:update")]
    CommentUpdate,
    #[serde(rename = "comment:resolve")]
    CommentResolve,
    #[serde(rename = "comment:delete")]
    CommentDelete,
    #[serde(rename = "notification:read")]
    NotificationRead,
    #[serde(rename = "notification:read-all")]
    NotificationReadAll,
    #[serde(rename = "notification:delete")]
    NotificationDelete,
}

/// An in-flight mutation registered by a store.
///
/// Created together with its ledger record and destroyed with it — there is
/// never a pending operation without a record, or vice versa.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOperation {
    /// Operation id, distinct from the entity id.
    pub id: Uuid,
    pub kind: OperationKind,
    /// Scope key: databaseId / pageId / userId / "workspace".
    pub scope: String,
    pub entity_id: String,
    pub timestamp: u64,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, scope: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            scope: scope.into(),
            entity_id: entity_id.into(),
            timestamp: now_millis(),
        }
    }
}

/// Terminal (or current) status of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Pending,
    Success,
    Error,
}

/// Handle returned to the caller of an optimistic mutator.
///
/// `settled` resolves once the operation leaves the ledger — confirmed,
/// rolled back after retry exhaustion, or cancelled externally.
pub struct OperationHandle {
    pub id: Uuid,
    pub settled: oneshot::Receiver<UpdateStatus>,
}

struct UpdateRecord {
    op: PendingOperation,
    /// Opaque snapshot of the optimistic payload, kept for inspection.
    optimistic: serde_json::Value,
    status: UpdateStatus,
    retry_count: u32,
    rollback: Option<Rollback>,
    done: Option<oneshot::Sender<UpdateStatus>>,
    /// Insertion order, so rollback_all unwinds newest-first.
    seq: u64,
}

/// The ledger. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OptimisticLedger {
    updates: Arc<Mutex<HashMap<Uuid, UpdateRecord>>>,
    seq: Arc<AtomicU64>,
    max_retries: u32,
    base_delay: Duration,
}

impl Default for OptimisticLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticLedger {
    /// Production policy: 3 retries with 2s/4s/8s backoff.
    pub fn new() -> Self {
        Self::with_policy(3, Duration::from_secs(1))
    }

    /// Custom retry policy. Delay before retry `n` is `base_delay * 2^n`.
    pub fn with_policy(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            updates: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            max_retries,
            base_delay,
        }
    }

    /// Register an in-flight mutation and immediately begin processing it.
    ///
    /// Does not block: the server action runs on a spawned task. The caller's
    /// wrapped action is responsible for writing reconciled state on success —
    /// the ledger only guarantees the action ran without throwing.
    pub fn add(
        &self,
        op: PendingOperation,
        optimistic: serde_json::Value,
        rollback: Rollback,
        action: ActionFactory,
    ) -> OperationHandle {
        let id = op.id;
        let (done_tx, done_rx) = oneshot::channel();
        let record = UpdateRecord {
            op,
            optimistic,
            status: UpdateStatus::Pending,
            retry_count: 0,
            rollback: Some(rollback),
            done: Some(done_tx),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.lock().insert(id, record);

        let ledger = self.clone();
        tokio::spawn(async move {
            ledger.process(id, action).await;
        });

        OperationHandle {
            id,
            settled: done_rx,
        }
    }

    /// Drive one operation to completion: attempt, retry with exponential
    /// backoff, and roll back once retries are exhausted.
    async fn process(&self, id: Uuid, action: ActionFactory) {
        loop {
            match action().await {
                Ok(()) => {
                    self.settle(id, UpdateStatus::Success);
                    return;
                }
                Err(e) => {
                    let retry = {
                        let mut updates = self.lock();
                        match updates.get_mut(&id) {
                            // Rolled back externally while the call was in
                            // flight — nothing left to do.
                            None => return,
                            Some(record) => {
                                if record.retry_count < self.max_retries {
                                    record.retry_count += 1;
                                    Some(record.retry_count)
                                } else {
                                    None
                                }
                            }
                        }
                    };

                    match retry {
                        Some(n) => {
                            let delay = self.base_delay * 2u32.saturating_pow(n);
                            log::warn!(
                                "Operation {id} failed ({e}), retry {n}/{} in {delay:?}",
                                self.max_retries
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            log::error!(
                                "Operation {id} failed after {} retries ({e}), rolling back",
                                self.max_retries
                            );
                            self.settle(id, UpdateStatus::Error);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Remove a record, firing its rollback when the outcome is an error.
    fn settle(&self, id: Uuid, status: UpdateStatus) {
        let record = self.lock().remove(&id);
        if let Some(mut record) = record {
            record.status = status;
            if status == UpdateStatus::Error {
                if let Some(rollback) = record.rollback.take() {
                    rollback();
                }
            }
            if let Some(done) = record.done.take() {
                let _ = done.send(status);
            }
        }
    }

    /// All operations still awaiting a server outcome, for "unsaved changes"
    /// indicators.
    pub fn pending(&self) -> Vec<PendingOperation> {
        let updates = self.lock();
        let mut ops: Vec<_> = updates.values().map(|r| (r.seq, r.op.clone())).collect();
        ops.sort_by_key(|(seq, _)| *seq);
        ops.into_iter().map(|(_, op)| op).collect()
    }

    /// Whether any operation matches the given scope and entity.
    pub fn is_pending(&self, scope: &str, entity_id: &str) -> bool {
        self.lock()
            .values()
            .any(|r| r.op.scope == scope && r.op.entity_id == entity_id)
    }

    /// Whether an operation is still live. Reconciliation checks this before
    /// writing canonical state so that late successes after rollback — and
    /// duplicate deliveries — are no-ops.
    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().contains_key(&id)
    }

    /// The opaque optimistic snapshot recorded for an operation.
    pub fn optimistic_state(&self, id: Uuid) -> Option<serde_json::Value> {
        self.lock().get(&id).map(|r| r.optimistic.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Cancel one operation: invoke its rollback and drop the record without
    /// waiting for the in-flight call. A late success becomes a no-op.
    pub fn rollback(&self, id: Uuid) {
        self.settle(id, UpdateStatus::Error);
    }

    /// Cancel every pending operation, unwinding newest-first so that
    /// overlapping snapshots restore the oldest pre-state last.
    pub fn rollback_all(&self) {
        let ids: Vec<Uuid> = {
            let updates = self.lock();
            let mut entries: Vec<_> = updates.values().map(|r| (r.seq, r.op.id)).collect();
            entries.sort_by(|a, b| b.0.cmp(&a.0));
            entries.into_iter().map(|(_, id)| id).collect()
        };
        for id in ids {
            self.settle(id, UpdateStatus::Error);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, UpdateRecord>> {
        self.updates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn op(kind: OperationKind) -> PendingOperation {
        PendingOperation::new(kind, "db1", "r1")
    }

    fn ok_action() -> ActionFactory {
        Box::new(|| Box::pin(async { Ok(()) }))
    }

    fn failing_action(calls: Arc<AtomicUsize>) -> ActionFactory {
        Box::new(move || {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ActionError::new("rejected"))
            })
        })
    }

    #[tokio::test]
    async fn test_success_removes_record() {
        let ledger = OptimisticLedger::new();
        let handle = ledger.add(
            op(OperationKind::RowCreate),
            serde_json::json!({"id": "temp-1"}),
            Box::new(|| {}),
            ok_action(),
        );

        assert_eq!(handle.settled.await.unwrap(), UpdateStatus::Success);
        assert!(ledger.is_empty());
        assert!(!ledger.is_pending("db1", "r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_rolls_back() {
        let ledger = OptimisticLedger::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));
        let rb = rolled_back.clone();

        let handle = ledger.add(
            op(OperationKind::CellUpdate),
            serde_json::Value::Null,
            Box::new(move || {
                rb.fetch_add(1, Ordering::SeqCst);
            }),
            failing_action(calls.clone()),
        );

        assert_eq!(handle.settled.await.unwrap(), UpdateStatus::Error);
        // Initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule() {
        let ledger = OptimisticLedger::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let _handle = ledger.add(
            op(OperationKind::CellUpdate),
            serde_json::Value::Null,
            Box::new(|| {}),
            failing_action(calls.clone()),
        );

        // Let the first attempt run
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // First retry fires after 2s
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Second after a further 4s
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Third after a further 8s, then no more
        tokio::time::sleep(Duration::from_millis(8_100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_pending_listing_in_insertion_order() {
        let ledger = OptimisticLedger::new();
        let gate = Arc::new(tokio::sync::Notify::new());

        let blocked: ActionFactory = {
            let gate = gate.clone();
            Box::new(move || {
                let gate = gate.clone();
                Box::pin(async move {
                    gate.notified().await;
                    Ok(())
                })
            })
        };
        let _h1 = ledger.add(
            PendingOperation::new(OperationKind::RowCreate, "db1", "a"),
            serde_json::Value::Null,
            Box::new(|| {}),
            blocked,
        );
        let blocked2: ActionFactory = {
            let gate = gate.clone();
            Box::new(move || {
                let gate = gate.clone();
                Box::pin(async move {
                    gate.notified().await;
                    Ok(())
                })
            })
        };
        let _h2 = ledger.add(
            PendingOperation::new(OperationKind::CellUpdate, "db1", "b"),
            serde_json::Value::Null,
            Box::new(|| {}),
            blocked2,
        );

        let pending = ledger.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].entity_id, "a");
        assert_eq!(pending[1].entity_id, "b");
        assert!(ledger.is_pending("db1", "a"));
        assert!(!ledger.is_pending("db2", "a"));
    }

    #[tokio::test]
    async fn test_rollback_all_unwinds_newest_first() {
        let ledger = OptimisticLedger::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());

        for name in ["first", "second", "third"] {
            let order = order.clone();
            let gate = gate.clone();
            ledger.add(
                PendingOperation::new(OperationKind::DocUpdate, "workspace", name),
                serde_json::Value::Null,
                Box::new(move || {
                    order.lock().unwrap().push(name);
                }),
                Box::new(move || {
                    let gate = gate.clone();
                    Box::pin(async move {
                        gate.notified().await;
                        Ok(())
                    })
                }),
            );
        }

        ledger.rollback_all();
        assert!(ledger.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_late_success_after_rollback_is_noop() {
        let ledger = OptimisticLedger::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let reconciled = Arc::new(AtomicUsize::new(0));

        let action: ActionFactory = {
            let gate = gate.clone();
            let ledger_probe = ledger.clone();
            let reconciled = reconciled.clone();
            Box::new(move || {
                let gate = gate.clone();
                let ledger_probe = ledger_probe.clone();
                let reconciled = reconciled.clone();
                Box::pin(async move {
                    gate.notified().await;
                    // Stale-reconciliation guard: the record is gone, so the
                    // wrapper must not write canonical state.
                    if ledger_probe.pending().is_empty() {
                        return Ok(());
                    }
                    reconciled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        let handle = ledger.add(
            op(OperationKind::RowCreate),
            serde_json::Value::Null,
            Box::new(|| {}),
            action,
        );
        tokio::task::yield_now().await;

        ledger.rollback(handle.id);
        assert!(!ledger.contains(handle.id));

        gate.notify_waiters();
        tokio::task::yield_now().await;
        assert_eq!(reconciled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_optimistic_state_inspectable() {
        let ledger = OptimisticLedger::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let snapshot = serde_json::json!({"id": "temp-1", "order": 0});

        let handle = ledger.add(
            op(OperationKind::RowCreate),
            snapshot.clone(),
            Box::new(|| {}),
            Box::new(move || {
                let gate = gate.clone();
                Box::pin(async move {
                    gate.notified().await;
                    Ok(())
                })
            }),
        );

        assert_eq!(ledger.optimistic_state(handle.id), Some(snapshot));
    }
}
