//! The header page: index name -> root page id records in page 0.
//!
//! Layout:
//! ```text
//! +------------------+--------------------------------------+
//! | record count (4) | records: name (32, NUL padded)       |
//! |                  |          root page id (4)            |
//! +------------------+--------------------------------------+
//! ```

use kestrel_common::{KestrelError, PageId, Result};

/// Accessors for the header page byte buffer.
pub struct HeaderPage;

impl HeaderPage {
    /// Maximum stored length of an index name.
    pub const NAME_SIZE: usize = 32;
    /// Size of one record: name plus root page id.
    pub const RECORD_SIZE: usize = Self::NAME_SIZE + 4;
    const COUNT_OFFSET: usize = 0;
    const RECORDS_OFFSET: usize = 4;

    /// Number of records the page can hold.
    pub fn capacity(data: &[u8]) -> usize {
        (data.len() - Self::RECORDS_OFFSET) / Self::RECORD_SIZE
    }

    /// Number of records currently stored.
    pub fn record_count(data: &[u8]) -> usize {
        i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
    }

    fn set_record_count(data: &mut [u8], count: usize) {
        data[Self::COUNT_OFFSET..Self::COUNT_OFFSET + 4]
            .copy_from_slice(&(count as i32).to_le_bytes());
    }

    fn record_offset(index: usize) -> usize {
        Self::RECORDS_OFFSET + index * Self::RECORD_SIZE
    }

    fn name_at(data: &[u8], index: usize) -> &[u8] {
        let offset = Self::record_offset(index);
        let name = &data[offset..offset + Self::NAME_SIZE];
        let end = name.iter().position(|&b| b == 0).unwrap_or(Self::NAME_SIZE);
        &name[..end]
    }

    fn root_at(data: &[u8], index: usize) -> PageId {
        let offset = Self::record_offset(index) + Self::NAME_SIZE;
        PageId(i32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]))
    }

    fn find(data: &[u8], name: &str) -> Option<usize> {
        (0..Self::record_count(data)).find(|&i| Self::name_at(data, i) == name.as_bytes())
    }

    /// Appends a record for `name`. Fails if the name is too long, the
    /// page is full, or the name is already registered.
    pub fn insert_record(data: &mut [u8], name: &str, root_id: PageId) -> Result<()> {
        if name.len() >= Self::NAME_SIZE {
            return Err(KestrelError::IndexNameTooLong(name.to_string()));
        }
        if Self::find(data, name).is_some() {
            return Err(KestrelError::IndexAlreadyExists(name.to_string()));
        }
        let count = Self::record_count(data);
        if count >= Self::capacity(data) {
            return Err(KestrelError::HeaderPageFull);
        }

        let offset = Self::record_offset(count);
        data[offset..offset + Self::NAME_SIZE].fill(0);
        data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        data[offset + Self::NAME_SIZE..offset + Self::RECORD_SIZE]
            .copy_from_slice(&root_id.0.to_le_bytes());
        Self::set_record_count(data, count + 1);
        Ok(())
    }

    /// Rewrites the root page id of an existing record.
    pub fn update_record(data: &mut [u8], name: &str, root_id: PageId) -> Result<()> {
        let index =
            Self::find(data, name).ok_or_else(|| KestrelError::IndexNotFound(name.to_string()))?;
        let offset = Self::record_offset(index) + Self::NAME_SIZE;
        data[offset..offset + 4].copy_from_slice(&root_id.0.to_le_bytes());
        Ok(())
    }

    /// Removes the record for `name`, compacting the record array.
    pub fn delete_record(data: &mut [u8], name: &str) -> bool {
        let Some(index) = Self::find(data, name) else {
            return false;
        };
        let count = Self::record_count(data);
        let from = Self::record_offset(index + 1);
        let to = Self::record_offset(count);
        data.copy_within(from..to, Self::record_offset(index));
        Self::set_record_count(data, count - 1);
        true
    }

    /// Looks up the root page id registered under `name`.
    pub fn get_root_id(data: &[u8], name: &str) -> Option<PageId> {
        Self::find(data, name).map(|i| Self::root_at(data, i))
    }
}
