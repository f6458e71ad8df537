//! Persistent area stores.
//!
//! A [`Store`] is a flat namespace of allocated *areas*: variable-sized
//! byte ranges identified by an [`AreaId`]. Areas are immutable once
//! finished, except for a small set of well-known fixed areas mutated
//! through [`MutableArea::check_out`]. A single global write latch
//! serializes all allocations and writes within one process.
//!
//! Two implementations exist:
//! - [`FileStore`] - areas laid over the buffer manager's paged file
//! - [`HeapStore`] - in-memory, for `heap-only` databases and tests

mod area;
mod file_store;
mod heap_store;
mod latch;
mod page_file;

pub use area::{Area, AreaWriter, MutableArea};
pub use file_store::FileStore;
pub use heap_store::HeapStore;
pub use page_file::PageFile;

pub(crate) use latch::WriteLatch;

use crate::common::{AreaId, Result};

/// Number of fixed-area pointer slots in the store header.
pub const FIXED_SLOT_COUNT: usize = 16;

/// Fixed slot holding the conglomerate state area pointer.
pub const STATE_SLOT: usize = 0;

/// A byte-addressable persistent container.
///
/// # Failure contract
/// I/O errors surface as [`Error::Io`](crate::common::Error::Io)
/// (storage failure). Requesting an area that was never allocated, or one
/// that has been freed, is a logic bug and panics.
pub trait Store: Send + Sync {
    /// Allocate an area of exactly `size` bytes.
    ///
    /// The returned writer finalizes the area with
    /// [`AreaWriter::finish`], after which it is immutable.
    fn create_area(&self, size: usize) -> Result<AreaWriter>;

    /// Read an allocated area.
    fn get_area(&self, id: AreaId) -> Result<Area>;

    /// Open a well-known fixed area for in-place mutation.
    fn get_mutable_area(&self, id: AreaId) -> Result<MutableArea>;

    /// Mark an area free. Space may be coalesced lazily.
    fn delete_area(&self, id: AreaId) -> Result<()>;

    /// Read a fixed-area pointer slot from the store header.
    fn get_fixed_slot(&self, slot: usize) -> Result<AreaId>;

    /// Publish a fixed-area pointer slot in the store header.
    fn set_fixed_slot(&self, slot: usize, id: AreaId) -> Result<()>;

    /// Acquire the global write latch (reentrant).
    fn lock_for_write(&self);

    /// Release the global write latch.
    fn unlock_for_write(&self);

    /// Write bytes into an area at `offset` within its data.
    ///
    /// This is the plumbing beneath [`AreaWriter::finish`] and
    /// [`MutableArea::check_out`]; it is not intended for direct use.
    fn write_area_data(&self, id: AreaId, offset: usize, data: &[u8]) -> Result<()>;

    /// Flush dirty state to persistent storage, optionally fsyncing.
    fn checkpoint(&self, sync: bool) -> Result<()>;
}

/// RAII guard for the store write latch.
///
/// Obtained through [`lock_store_write`]; releases on drop so the latch
/// is freed on every exit path.
pub struct StoreWriteGuard<'a> {
    store: &'a dyn Store,
}

impl Drop for StoreWriteGuard<'_> {
    fn drop(&mut self) {
        self.store.unlock_for_write();
    }
}

/// Acquire the store write latch for the current scope.
pub fn lock_store_write(store: &dyn Store) -> StoreWriteGuard<'_> {
    store.lock_for_write();
    StoreWriteGuard { store }
}
