//! Record-level lock manager.

use crate::transaction::{Transaction, TransactionState};
use kestrel_common::{Rid, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};

/// Lock modes a transaction can request on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// One transaction's pending or granted request on a record.
#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

/// FIFO queue of requests for one record id.
///
/// Granted requests stay in the queue until the holder releases; the
/// counts cache how many are granted so compatibility checks do not
/// rescan the queue.
#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    shared_granted: usize,
    exclusive_granted: bool,
}

impl LockRequestQueue {
    /// Grants pending requests in queue order. The first incompatible
    /// request stops further grants, so a waiting exclusive request is
    /// never overtaken by shared requests queued behind it.
    fn try_grant(&mut self) {
        for request in self.requests.iter_mut() {
            if request.granted {
                continue;
            }
            let compatible = match request.mode {
                LockMode::Shared => !self.exclusive_granted,
                LockMode::Exclusive => self.shared_granted == 0 && !self.exclusive_granted,
            };
            if !compatible {
                break;
            }
            request.granted = true;
            match request.mode {
                LockMode::Shared => self.shared_granted += 1,
                LockMode::Exclusive => self.exclusive_granted = true,
            }
        }
    }

    /// Recomputes the granted counts after requests were removed.
    fn recount(&mut self) {
        self.shared_granted = self
            .requests
            .iter()
            .filter(|r| r.granted && r.mode == LockMode::Shared)
            .count();
        self.exclusive_granted = self
            .requests
            .iter()
            .any(|r| r.granted && r.mode == LockMode::Exclusive);
    }

    fn is_granted(&self, txn_id: TxnId) -> bool {
        self.requests
            .iter()
            .find(|r| r.txn_id == txn_id)
            .map_or(false, |r| r.granted)
    }
}

/// Grants shared and exclusive locks per record id.
///
/// Each record carries a FIFO request queue; requests are granted in
/// arrival order and block indefinitely until compatible — there is no
/// timeout and no deadlock detection here (resolution is the
/// transaction manager's concern). Grants are recorded in the
/// requesting transaction's lock sets. Under two-phase locking,
/// requests from a transaction that is no longer in the Growing state
/// are denied.
pub struct LockManager {
    table: Mutex<HashMap<Rid, LockRequestQueue>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Enqueues `(txn, mode)` on `rid` and blocks until the request is
    /// granted in FIFO order.
    fn lock(&self, txn: &Transaction, rid: Rid, mode: LockMode) {
        let mut table = self.table.lock();
        table.entry(rid).or_default().requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: false,
        });

        loop {
            let granted = {
                let queue = table
                    .get_mut(&rid)
                    .expect("queue exists while a request is pending");
                queue.try_grant();
                queue.is_granted(txn.id())
            };
            if granted {
                return;
            }
            self.released.wait(&mut table);
        }
    }

    /// Acquires a shared lock on `rid`. Returns true on grant; holding
    /// either lock mode already counts as granted.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.state() != TransactionState::Growing {
            log::debug!("shared lock on {rid} denied for {}: not growing", txn.id());
            return false;
        }
        if txn.holds_any(&rid) {
            return true;
        }

        self.lock(txn, rid, LockMode::Shared);
        txn.grant_shared(rid);
        true
    }

    /// Acquires an exclusive lock on `rid`. Returns true on grant.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.state() != TransactionState::Growing {
            log::debug!(
                "exclusive lock on {rid} denied for {}: not growing",
                txn.id()
            );
            return false;
        }
        if txn.holds_exclusive(&rid) {
            return true;
        }
        if txn.holds_shared(&rid) {
            // Re-locking a shared-held rid exclusively is an upgrade.
            return self.lock_upgrade(txn, rid);
        }

        self.lock(txn, rid, LockMode::Exclusive);
        txn.grant_exclusive(rid);
        true
    }

    /// Upgrades a held shared lock on `rid` to exclusive. The upgrade
    /// request jumps to the head of the queue and blocks until every
    /// other shared holder releases. Returns false if the caller does
    /// not hold the shared lock.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.state() != TransactionState::Growing {
            return false;
        }
        if txn.holds_exclusive(&rid) {
            return true;
        }
        if !txn.holds_shared(&rid) {
            log::debug!("upgrade on {rid} denied for {}: no shared lock", txn.id());
            return false;
        }

        let mut table = self.table.lock();
        {
            let queue = table.entry(rid).or_default();
            // Retire the granted shared request and queue-jump with an
            // exclusive one: the upgrader must win over later waiters,
            // and nothing queued behind it can be granted meanwhile.
            if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) {
                if queue.requests[pos].granted {
                    queue.shared_granted -= 1;
                }
                queue.requests.remove(pos);
            }
            queue.requests.push_front(LockRequest {
                txn_id: txn.id(),
                mode: LockMode::Exclusive,
                granted: false,
            });
        }

        loop {
            let granted = {
                let queue = table
                    .get_mut(&rid)
                    .expect("queue exists while a request is pending");
                queue.try_grant();
                queue.is_granted(txn.id())
            };
            if granted {
                drop(table);
                txn.promote(rid);
                return true;
            }
            self.released.wait(&mut table);
        }
    }

    /// Releases every lock held by `txn`, regrants in FIFO order on the
    /// affected records and wakes all waiters.
    pub fn unlock_all(&self, txn: &Transaction) {
        txn.clear_locks();

        let mut table = self.table.lock();
        let mut affected = Vec::new();
        table.retain(|rid, queue| {
            let before = queue.requests.len();
            queue.requests.retain(|r| r.txn_id != txn.id());
            if queue.requests.len() < before {
                affected.push(*rid);
            }
            !queue.requests.is_empty()
        });

        for rid in affected {
            if let Some(queue) = table.get_mut(&rid) {
                queue.recount();
                queue.try_grant();
            }
        }
        drop(table);
        self.released.notify_all();
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
