//! Transaction handles and the transaction manager.

use crate::lock_manager::LockManager;
use kestrel_common::{Rid, TxnId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Lifecycle state of a transaction under two-phase locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Acquiring locks; the only state in which new locks are granted.
    Growing,
    /// Releasing locks.
    Shrinking,
    Committed,
    Aborted,
}

/// Kind of a heap write performed by a transaction.
#[derive(Debug, Clone)]
pub enum WriteType {
    Insert,
    Delete,
    /// Carries the pre-update payload bytes for undo.
    Update { old: Vec<u8> },
}

/// One heap modification recorded for commit/abort processing.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub rid: Rid,
    pub write_type: WriteType,
}

/// A transaction handle.
///
/// Carries the state machine, the shared and exclusive lock sets
/// maintained by the lock manager, and the write set maintained by the
/// table heap. The handle is shared by reference between the heap, the
/// lock manager and the transaction manager; all interior state is
/// independently synchronized.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    shared_locks: Mutex<HashSet<Rid>>,
    exclusive_locks: Mutex<HashSet<Rid>>,
    writes: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    /// Creates a fresh transaction in the Growing state.
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            shared_locks: Mutex::new(HashSet::new()),
            exclusive_locks: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Transitions the state. The table page calls this with `Aborted` on
    /// logic violations (out-of-range slot, tombstoned slot).
    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// True if this transaction holds a shared lock on `rid`.
    pub fn holds_shared(&self, rid: &Rid) -> bool {
        self.shared_locks.lock().contains(rid)
    }

    /// True if this transaction holds an exclusive lock on `rid`.
    pub fn holds_exclusive(&self, rid: &Rid) -> bool {
        self.exclusive_locks.lock().contains(rid)
    }

    /// True if this transaction holds any lock on `rid`.
    pub fn holds_any(&self, rid: &Rid) -> bool {
        self.holds_exclusive(rid) || self.holds_shared(rid)
    }

    pub(crate) fn grant_shared(&self, rid: Rid) {
        self.shared_locks.lock().insert(rid);
    }

    pub(crate) fn grant_exclusive(&self, rid: Rid) {
        self.exclusive_locks.lock().insert(rid);
    }

    pub(crate) fn promote(&self, rid: Rid) {
        self.shared_locks.lock().remove(&rid);
        self.exclusive_locks.lock().insert(rid);
    }

    pub(crate) fn clear_locks(&self) -> (HashSet<Rid>, HashSet<Rid>) {
        let shared = std::mem::take(&mut *self.shared_locks.lock());
        let exclusive = std::mem::take(&mut *self.exclusive_locks.lock());
        (shared, exclusive)
    }

    /// Records a heap write for commit/abort processing.
    pub fn record_write(&self, rid: Rid, write_type: WriteType) {
        self.writes.lock().push(WriteRecord { rid, write_type });
    }

    /// Drains the recorded writes in execution order.
    pub fn take_writes(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut *self.writes.lock())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Hands out transaction ids and drives commit/abort.
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicI32,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            next_txn_id: AtomicI32::new(0),
        }
    }

    /// Starts a new transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        Arc::new(Transaction::new(id))
    }

    /// Commits `txn`: applies each recorded write through `apply` (the
    /// heap turns tombstoned deletes into physical deletes here), then
    /// releases every lock and marks the transaction committed.
    pub fn commit<F>(&self, txn: &Transaction, mut apply: F)
    where
        F: FnMut(&WriteRecord),
    {
        txn.set_state(TransactionState::Shrinking);
        for record in txn.take_writes() {
            apply(&record);
        }
        self.lock_manager.unlock_all(txn);
        txn.set_state(TransactionState::Committed);
    }

    /// Aborts `txn`: undoes each recorded write through `undo` in reverse
    /// execution order, then releases every lock and marks the
    /// transaction aborted.
    pub fn abort<F>(&self, txn: &Transaction, mut undo: F)
    where
        F: FnMut(&WriteRecord),
    {
        txn.set_state(TransactionState::Shrinking);
        for record in txn.take_writes().iter().rev() {
            undo(record);
        }
        self.lock_manager.unlock_all(txn);
        txn.set_state(TransactionState::Aborted);
    }
}
