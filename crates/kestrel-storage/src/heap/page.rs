//! Slotted table page.
//!
//! Layout (little-endian i32 fields):
//! ```text
//!  ----------------------------------------------------------------
//! | PageId (4) | PrevPageId (4) | NextPageId (4) | FreeSpacePtr (4) |
//!  ----------------------------------------------------------------
//! | TupleCount (4) | slot 0: offset (4), size (4) | slot 1 ... |
//!  ----------------------------------------------------------------
//! | ... free space ... | tuple payloads packed toward the page end |
//!  ----------------------------------------------------------------
//!                      ^ free space pointer
//! ```
//!
//! A slot's size field encodes its status: positive is a live tuple,
//! zero is an empty reusable slot, negative is a tombstone whose
//! absolute value is the original size. Tombstoned payloads stay in the
//! packed region until `apply_delete` physically removes them.

use crate::tuple::Tuple;
use kestrel_common::{PageId, Rid};
use kestrel_txn::{LockManager, Transaction, TransactionState};

/// In-slice operations over a table page byte buffer.
pub struct TablePage;

impl TablePage {
    /// Bytes taken by the page header.
    pub const HEADER_SIZE: usize = 20;
    /// Bytes taken by one slot directory entry.
    pub const SLOT_SIZE: usize = 8;

    const PAGE_ID_OFFSET: usize = 0;
    const PREV_OFFSET: usize = 4;
    const NEXT_OFFSET: usize = 8;
    const FREE_SPACE_PTR_OFFSET: usize = 12;
    const TUPLE_COUNT_OFFSET: usize = 16;

    fn read_i32(data: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])
    }

    fn write_i32(data: &mut [u8], offset: usize, value: i32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes the header of a fresh page.
    pub fn init(data: &mut [u8], page_id: PageId, page_size: usize, prev: PageId, next: PageId) {
        Self::write_i32(data, Self::PAGE_ID_OFFSET, page_id.0);
        Self::write_i32(data, Self::PREV_OFFSET, prev.0);
        Self::write_i32(data, Self::NEXT_OFFSET, next.0);
        Self::write_i32(data, Self::FREE_SPACE_PTR_OFFSET, page_size as i32);
        Self::write_i32(data, Self::TUPLE_COUNT_OFFSET, 0);
    }

    pub fn page_id(data: &[u8]) -> PageId {
        PageId(Self::read_i32(data, Self::PAGE_ID_OFFSET))
    }

    pub fn prev_page_id(data: &[u8]) -> PageId {
        PageId(Self::read_i32(data, Self::PREV_OFFSET))
    }

    pub fn next_page_id(data: &[u8]) -> PageId {
        PageId(Self::read_i32(data, Self::NEXT_OFFSET))
    }

    pub fn set_prev_page_id(data: &mut [u8], prev: PageId) {
        Self::write_i32(data, Self::PREV_OFFSET, prev.0);
    }

    pub fn set_next_page_id(data: &mut [u8], next: PageId) {
        Self::write_i32(data, Self::NEXT_OFFSET, next.0);
    }

    fn free_space_pointer(data: &[u8]) -> i32 {
        Self::read_i32(data, Self::FREE_SPACE_PTR_OFFSET)
    }

    fn set_free_space_pointer(data: &mut [u8], value: i32) {
        Self::write_i32(data, Self::FREE_SPACE_PTR_OFFSET, value);
    }

    pub fn tuple_count(data: &[u8]) -> i32 {
        Self::read_i32(data, Self::TUPLE_COUNT_OFFSET)
    }

    fn set_tuple_count(data: &mut [u8], count: i32) {
        Self::write_i32(data, Self::TUPLE_COUNT_OFFSET, count);
    }

    fn tuple_offset_at(data: &[u8], slot: i32) -> i32 {
        Self::read_i32(data, Self::HEADER_SIZE + Self::SLOT_SIZE * slot as usize)
    }

    fn set_tuple_offset_at(data: &mut [u8], slot: i32, offset: i32) {
        Self::write_i32(data, Self::HEADER_SIZE + Self::SLOT_SIZE * slot as usize, offset);
    }

    fn tuple_size_at(data: &[u8], slot: i32) -> i32 {
        Self::read_i32(data, Self::HEADER_SIZE + Self::SLOT_SIZE * slot as usize + 4)
    }

    fn set_tuple_size_at(data: &mut [u8], slot: i32, size: i32) {
        Self::write_i32(
            data,
            Self::HEADER_SIZE + Self::SLOT_SIZE * slot as usize + 4,
            size,
        );
    }

    /// Contiguous free bytes between the slot directory and the packed
    /// tuple region.
    pub fn free_space(data: &[u8]) -> i32 {
        Self::free_space_pointer(data)
            - Self::HEADER_SIZE as i32
            - Self::SLOT_SIZE as i32 * Self::tuple_count(data)
    }

    /// Inserts `tuple`, reusing the first empty slot if one exists.
    ///
    /// Requires an exclusive lock on the chosen RID; returns None when
    /// the page lacks space or the lock is denied.
    pub fn insert_tuple(
        data: &mut [u8],
        tuple: &Tuple,
        txn: &Transaction,
        lock_manager: &LockManager,
    ) -> Option<Rid> {
        let size = tuple.size() as i32;
        if size == 0 {
            return None;
        }

        let count = Self::tuple_count(data);
        let reuse = (0..count).find(|&i| Self::tuple_size_at(data, i) == 0);

        let slot = match reuse {
            Some(slot) => {
                if Self::free_space(data) < size {
                    return None;
                }
                slot
            }
            None => {
                if Self::free_space(data) < size + Self::SLOT_SIZE as i32 {
                    return None;
                }
                count
            }
        };

        let rid = Rid::new(Self::page_id(data), slot as u32);
        if !lock_manager.lock_exclusive(txn, rid) {
            return None;
        }

        let offset = Self::free_space_pointer(data) - size;
        Self::set_free_space_pointer(data, offset);
        data[offset as usize..(offset + size) as usize].copy_from_slice(tuple.data());
        Self::set_tuple_offset_at(data, slot, offset);
        Self::set_tuple_size_at(data, slot, size);
        if slot == count {
            Self::set_tuple_count(data, count + 1);
        }
        Some(rid)
    }

    /// Acquires (or upgrades to) an exclusive lock on `rid` for a write.
    fn lock_for_write(rid: Rid, txn: &Transaction, lock_manager: &LockManager) -> bool {
        if txn.holds_shared(&rid) {
            lock_manager.lock_upgrade(txn, rid)
        } else if txn.holds_exclusive(&rid) {
            true
        } else {
            lock_manager.lock_exclusive(txn, rid)
        }
    }

    /// Tombstones the tuple at `rid` by negating its slot size.
    ///
    /// Logic violations (slot out of range, empty or already tombstoned
    /// slot) abort the transaction; lock denial just returns false.
    pub fn mark_delete(
        data: &mut [u8],
        rid: Rid,
        txn: &Transaction,
        lock_manager: &LockManager,
    ) -> bool {
        let slot = rid.slot as i32;
        if slot < 0 || slot >= Self::tuple_count(data) {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        let size = Self::tuple_size_at(data, slot);
        if size <= 0 {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if !Self::lock_for_write(rid, txn, lock_manager) {
            return false;
        }

        Self::set_tuple_size_at(data, slot, -size);
        true
    }

    /// Replaces the tuple at `rid` with `new_tuple`, shifting the packed
    /// region to absorb the size delta. Returns the old tuple.
    pub fn update_tuple(
        data: &mut [u8],
        new_tuple: &Tuple,
        rid: Rid,
        txn: &Transaction,
        lock_manager: &LockManager,
    ) -> Option<Tuple> {
        let slot = rid.slot as i32;
        if slot < 0 || slot >= Self::tuple_count(data) {
            txn.set_state(TransactionState::Aborted);
            return None;
        }
        let old_size = Self::tuple_size_at(data, slot);
        if old_size <= 0 {
            txn.set_state(TransactionState::Aborted);
            return None;
        }
        let new_size = new_tuple.size() as i32;
        if Self::free_space(data) < new_size - old_size {
            return None;
        }
        if !Self::lock_for_write(rid, txn, lock_manager) {
            return None;
        }

        let old_offset = Self::tuple_offset_at(data, slot);
        let old = Tuple::from_bytes(
            rid,
            data[old_offset as usize..(old_offset + old_size) as usize].to_vec(),
        );

        let free_space_pointer = Self::free_space_pointer(data);
        debug_assert!(old_offset >= free_space_pointer);
        let delta = old_size - new_size;

        // Shift the packed region below the old payload by the delta,
        // then write the new payload where the old one ended.
        data.copy_within(
            free_space_pointer as usize..old_offset as usize,
            (free_space_pointer + delta) as usize,
        );
        Self::set_free_space_pointer(data, free_space_pointer + delta);
        let new_offset = old_offset + delta;
        data[new_offset as usize..(new_offset + new_size) as usize]
            .copy_from_slice(new_tuple.data());
        Self::set_tuple_size_at(data, slot, new_size);

        // Fix every slot (live or tombstoned) whose payload moved,
        // including the updated slot itself.
        for i in 0..Self::tuple_count(data) {
            let offset_i = Self::tuple_offset_at(data, i);
            if Self::tuple_size_at(data, i) != 0 && offset_i < old_offset + old_size {
                Self::set_tuple_offset_at(data, i, offset_i + delta);
            }
        }
        Some(old)
    }

    /// Physically removes the tuple at `rid`: commits a tombstone, or
    /// undoes an insert. The caller's transaction must already hold the
    /// exclusive lock.
    pub fn apply_delete(data: &mut [u8], rid: Rid, txn: &Transaction) {
        let slot = rid.slot as i32;
        assert!(
            slot >= 0 && slot < Self::tuple_count(data),
            "apply_delete: slot out of range"
        );
        let mut size = Self::tuple_size_at(data, slot);
        if size < 0 {
            size = -size;
        }
        assert!(size > 0, "apply_delete of an empty slot");
        assert!(
            txn.holds_exclusive(&rid),
            "apply_delete without the exclusive lock"
        );

        let offset = Self::tuple_offset_at(data, slot);
        let free_space_pointer = Self::free_space_pointer(data);
        debug_assert!(offset >= free_space_pointer);

        data.copy_within(
            free_space_pointer as usize..offset as usize,
            (free_space_pointer + size) as usize,
        );
        Self::set_free_space_pointer(data, free_space_pointer + size);
        Self::set_tuple_size_at(data, slot, 0);
        Self::set_tuple_offset_at(data, slot, 0);

        for i in 0..Self::tuple_count(data) {
            let offset_i = Self::tuple_offset_at(data, i);
            if Self::tuple_size_at(data, i) != 0 && offset_i < offset {
                Self::set_tuple_offset_at(data, i, offset_i + size);
            }
        }
    }

    /// Reverts a tombstone back to a live tuple.
    pub fn rollback_delete(data: &mut [u8], rid: Rid, txn: &Transaction) {
        let slot = rid.slot as i32;
        assert!(
            slot >= 0 && slot < Self::tuple_count(data),
            "rollback_delete: slot out of range"
        );
        let size = Self::tuple_size_at(data, slot);
        assert!(size < 0, "rollback_delete of a live slot");
        assert!(
            txn.holds_exclusive(&rid),
            "rollback_delete without the exclusive lock"
        );
        Self::set_tuple_size_at(data, slot, -size);
    }

    /// Copies out the tuple at `rid` under a shared lock (skipped when
    /// the transaction already holds any lock on the record).
    pub fn get_tuple(
        data: &[u8],
        rid: Rid,
        txn: &Transaction,
        lock_manager: &LockManager,
    ) -> Option<Tuple> {
        let slot = rid.slot as i32;
        if slot < 0 || slot >= Self::tuple_count(data) {
            txn.set_state(TransactionState::Aborted);
            return None;
        }
        let size = Self::tuple_size_at(data, slot);
        if size <= 0 {
            txn.set_state(TransactionState::Aborted);
            return None;
        }
        if !txn.holds_any(&rid) && !lock_manager.lock_shared(txn, rid) {
            return None;
        }

        let offset = Self::tuple_offset_at(data, slot);
        Some(Tuple::from_bytes(
            rid,
            data[offset as usize..(offset + size) as usize].to_vec(),
        ))
    }

    /// RID of the first live tuple on this page.
    pub fn first_tuple_rid(data: &[u8]) -> Option<Rid> {
        (0..Self::tuple_count(data))
            .find(|&i| Self::tuple_size_at(data, i) > 0)
            .map(|i| Rid::new(Self::page_id(data), i as u32))
    }

    /// RID of the next live tuple after `current` on this page.
    pub fn next_tuple_rid(data: &[u8], current: Rid) -> Option<Rid> {
        debug_assert_eq!(current.page_id, Self::page_id(data));
        (current.slot as i32 + 1..Self::tuple_count(data))
            .find(|&i| Self::tuple_size_at(data, i) > 0)
            .map(|i| Rid::new(Self::page_id(data), i as u32))
    }
}
