//! B+tree index over the buffer pool.

pub mod index;
pub mod internal;
pub mod iterator;
pub mod key;
pub mod leaf;
pub mod page;

pub use index::BPlusTree;
pub use internal::InternalPage;
pub use iterator::IndexIterator;
pub use key::{FixedKey, IndexKey};
pub use leaf::LeafPage;
pub use page::{TreePage, TreePageType};
