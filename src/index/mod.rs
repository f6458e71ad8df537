//! Versioned index sets: sorted integer lists over copy-on-write block
//! trees, with snapshot isolation and atomic publication.

mod block;
mod list;
mod set_store;

pub use block::{compaction_class, pack_ints, unpack_ints, IndexBlock};
pub use list::SortedIntList;
pub use set_store::{IndexSet, IndexSetStore};
