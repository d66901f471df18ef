//! Table heap: a doubly-linked list of slotted table pages.

use crate::heap::page::TablePage;
use crate::tuple::Tuple;
use kestrel_buffer::BufferPoolManager;
use kestrel_common::{KestrelError, PageId, Result, Rid, PAGE_SIZE};
use kestrel_txn::{LockManager, Transaction, WriteRecord, WriteType};
use std::sync::Arc;

/// Variable-length tuple storage over chained table pages.
///
/// Insertion walks the chain from the first page until a page accepts
/// the tuple, allocating and linking a fresh page at the tail when none
/// does. Mutations are dispatched to the page named by the RID and are
/// recorded in the transaction's write set for commit/abort processing.
pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Creates a heap with one fresh, empty page.
    pub fn create(bpm: Arc<BufferPoolManager>, lock_manager: Arc<LockManager>) -> Result<Self> {
        // Page 0 of the database file is the header page; data pages
        // start after it.
        if bpm.disk_manager().num_pages() == 0 {
            let header_id = bpm.disk_manager().allocate_page();
            debug_assert_eq!(header_id, kestrel_common::HEADER_PAGE_ID);
        }

        let mut guard = bpm.new_page_write().ok_or(KestrelError::BufferPoolFull)?;
        let first_page_id = guard.page_id();
        TablePage::init(
            &mut guard[..],
            first_page_id,
            PAGE_SIZE,
            PageId::INVALID,
            PageId::INVALID,
        );
        drop(guard);

        Ok(Self {
            bpm,
            lock_manager,
            first_page_id,
        })
    }

    /// Reopens a heap whose first page already exists.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        lock_manager: Arc<LockManager>,
        first_page_id: PageId,
    ) -> Self {
        Self {
            bpm,
            lock_manager,
            first_page_id,
        }
    }

    /// Page id of the head of the page chain.
    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Inserts `tuple`, walking the chain until a page accepts it.
    ///
    /// Returns None when the tuple cannot fit any page, the lock is
    /// denied, or the buffer pool is exhausted.
    pub fn insert_tuple(&self, tuple: &Tuple, txn: &Transaction) -> Option<Rid> {
        if tuple.size() + TablePage::HEADER_SIZE + TablePage::SLOT_SIZE > PAGE_SIZE {
            return None;
        }

        let mut page_id = self.first_page_id;
        loop {
            let mut guard = self.bpm.fetch_page_write(page_id)?;
            if let Some(rid) =
                TablePage::insert_tuple(&mut guard[..], tuple, txn, &self.lock_manager)
            {
                txn.record_write(rid, WriteType::Insert);
                return Some(rid);
            }

            let next = TablePage::next_page_id(&guard[..]);
            if next.is_valid() {
                drop(guard);
                page_id = next;
                continue;
            }

            // End of the chain: grow by one page linked at the tail.
            let mut new_guard = self.bpm.new_page_write()?;
            let new_page_id = new_guard.page_id();
            TablePage::init(
                &mut new_guard[..],
                new_page_id,
                PAGE_SIZE,
                page_id,
                PageId::INVALID,
            );
            TablePage::set_next_page_id(&mut guard[..], new_page_id);
            drop(guard);
            log::debug!("table heap grew: {new_page_id} linked after {page_id}");

            let rid =
                TablePage::insert_tuple(&mut new_guard[..], tuple, txn, &self.lock_manager)?;
            txn.record_write(rid, WriteType::Insert);
            return Some(rid);
        }
    }

    /// Tombstones the tuple at `rid`.
    pub fn mark_delete(&self, rid: Rid, txn: &Transaction) -> bool {
        let Some(mut guard) = self.bpm.fetch_page_write(rid.page_id) else {
            return false;
        };
        let marked = TablePage::mark_delete(&mut guard[..], rid, txn, &self.lock_manager);
        if marked {
            txn.record_write(rid, WriteType::Delete);
        }
        marked
    }

    /// Replaces the tuple at `rid`, returning the previous tuple.
    pub fn update_tuple(&self, new_tuple: &Tuple, rid: Rid, txn: &Transaction) -> Option<Tuple> {
        let mut guard = self.bpm.fetch_page_write(rid.page_id)?;
        let old =
            TablePage::update_tuple(&mut guard[..], new_tuple, rid, txn, &self.lock_manager)?;
        txn.record_write(
            rid,
            WriteType::Update {
                old: old.data().to_vec(),
            },
        );
        Some(old)
    }

    /// Physically removes the tuple at `rid` (commit of a tombstone, or
    /// undo of an insert).
    pub fn apply_delete(&self, rid: Rid, txn: &Transaction) {
        if let Some(mut guard) = self.bpm.fetch_page_write(rid.page_id) {
            TablePage::apply_delete(&mut guard[..], rid, txn);
        }
    }

    /// Reverts the tombstone at `rid`.
    pub fn rollback_delete(&self, rid: Rid, txn: &Transaction) {
        if let Some(mut guard) = self.bpm.fetch_page_write(rid.page_id) {
            TablePage::rollback_delete(&mut guard[..], rid, txn);
        }
    }

    /// Copies out the tuple at `rid` under a shared lock.
    pub fn get_tuple(&self, rid: Rid, txn: &Transaction) -> Option<Tuple> {
        let guard = self.bpm.fetch_page_read(rid.page_id)?;
        TablePage::get_tuple(&guard[..], rid, txn, &self.lock_manager)
    }

    /// Commit-time write application: tombstoned deletes become physical.
    pub fn commit_write(&self, record: &WriteRecord, txn: &Transaction) {
        if let WriteType::Delete = record.write_type {
            self.apply_delete(record.rid, txn);
        }
    }

    /// Abort-time undo of one write record.
    pub fn undo_write(&self, record: &WriteRecord, txn: &Transaction) {
        match &record.write_type {
            WriteType::Insert => self.apply_delete(record.rid, txn),
            WriteType::Delete => self.rollback_delete(record.rid, txn),
            WriteType::Update { old } => {
                let old_tuple = Tuple::from_bytes(record.rid, old.clone());
                if let Some(mut guard) = self.bpm.fetch_page_write(record.rid.page_id) {
                    let _ = TablePage::update_tuple(
                        &mut guard[..],
                        &old_tuple,
                        record.rid,
                        txn,
                        &self.lock_manager,
                    );
                }
            }
        }
    }

    /// Iterates the live tuples of this heap in (page, slot) order.
    pub fn iter<'a>(&'a self, txn: &'a Transaction) -> TableIterator<'a> {
        TableIterator {
            heap: self,
            txn,
            rid: self.first_live_rid(),
        }
    }

    fn first_live_rid(&self) -> Option<Rid> {
        let mut page_id = self.first_page_id;
        while page_id.is_valid() {
            let guard = self.bpm.fetch_page_read(page_id)?;
            if let Some(rid) = TablePage::first_tuple_rid(&guard[..]) {
                return Some(rid);
            }
            page_id = TablePage::next_page_id(&guard[..]);
        }
        None
    }

    fn next_live_rid(&self, current: Rid) -> Option<Rid> {
        let guard = self.bpm.fetch_page_read(current.page_id)?;
        if let Some(rid) = TablePage::next_tuple_rid(&guard[..], current) {
            return Some(rid);
        }
        let mut page_id = TablePage::next_page_id(&guard[..]);
        drop(guard);

        while page_id.is_valid() {
            let guard = self.bpm.fetch_page_read(page_id)?;
            if let Some(rid) = TablePage::first_tuple_rid(&guard[..]) {
                return Some(rid);
            }
            page_id = TablePage::next_page_id(&guard[..]);
        }
        None
    }
}

/// Cursor over the live tuples of a table heap. Two iterators are at the
/// same position exactly when their current (page id, slot) pairs match.
pub struct TableIterator<'a> {
    heap: &'a TableHeap,
    txn: &'a Transaction,
    rid: Option<Rid>,
}

impl<'a> TableIterator<'a> {
    /// RID of the tuple the cursor currently points at.
    pub fn current_rid(&self) -> Option<Rid> {
        self.rid
    }
}

impl<'a> Iterator for TableIterator<'a> {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        let rid = self.rid?;
        let tuple = self.heap.get_tuple(rid, self.txn)?;
        self.rid = self.heap.next_live_rid(rid);
        Some(tuple)
    }
}

impl<'a> PartialEq for TableIterator<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.rid == other.rid
    }
}
