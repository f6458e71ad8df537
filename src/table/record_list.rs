//! The fixed record list: a table's persistent row directory.
//!
//! A growable array of 12-byte entries (`status: u32`, `pointer: i64`)
//! laid out over doubling mutable block areas, addressed by row index.
//! Status `0` marks a free slot; slot reuse walks an in-memory free list
//! rebuilt by scanning statuses on open. Freeing keeps the pointer
//! intact so the opening scan can still cross-check a slot against the
//! master index.
//!
//! ```text
//! header (mutable, 544 B):
//!   magic u32, version u32, used i64, block_count u32, reserved u32,
//!   padding 8 B, 64 x block pointer i64
//! block k (mutable): (64 << min(k, 12)) x 12 B entries
//! ```

use std::sync::Arc;

use crate::common::{AreaId, Error, Result};
use crate::store::{lock_store_write, MutableArea, Store};

const RECORD_LIST_MAGIC: u32 = 0x0F1C_8C01;
const RECORD_LIST_VERSION: u32 = 1;
const RECORD_SIZE: usize = 12;
const MAX_BLOCKS: usize = 64;
const HEADER_SIZE: usize = 32 + MAX_BLOCKS * 8;

const USED_OFFSET: usize = 8;
const BLOCK_COUNT_OFFSET: usize = 16;
const BLOCK_PTRS_OFFSET: usize = 32;

/// Capacity of block `k` in records.
fn block_capacity(k: usize) -> u64 {
    64u64 << k.min(12)
}

/// Persistent directory of row slots.
pub struct FixedRecordList {
    store: Arc<dyn Store>,
    header: MutableArea,
    blocks: Vec<MutableArea>,
    used: u64,
    free_slots: Vec<u64>,
}

impl FixedRecordList {
    /// Create an empty record list.
    pub fn create(store: Arc<dyn Store>) -> Result<Self> {
        let _guard = lock_store_write(store.as_ref());
        let header_id = store.create_area(HEADER_SIZE)?.finish(store.as_ref())?;
        let mut header = store.get_mutable_area(header_id)?;
        header.put_u32_at(0, RECORD_LIST_MAGIC);
        header.put_u32_at(4, RECORD_LIST_VERSION);
        header.check_out(store.as_ref())?;
        drop(_guard);
        Ok(Self {
            store,
            header,
            blocks: Vec::new(),
            used: 0,
            free_slots: Vec::new(),
        })
    }

    /// Open an existing record list and rebuild the free list.
    pub fn open(store: Arc<dyn Store>, header_id: AreaId) -> Result<Self> {
        let header = store.get_mutable_area(header_id)?;
        let magic = header.get_u32_at(0)?;
        if magic != RECORD_LIST_MAGIC {
            return Err(Error::Corruption(format!(
                "bad record list magic {:08x} at {}",
                magic, header_id
            )));
        }
        let version = header.get_u32_at(4)?;
        if version != RECORD_LIST_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported record list version {}",
                version
            )));
        }
        let used = header.get_i64_at(USED_OFFSET)? as u64;
        let block_count = header.get_u32_at(BLOCK_COUNT_OFFSET)? as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for k in 0..block_count {
            let ptr = AreaId::new(header.get_i64_at(BLOCK_PTRS_OFFSET + k * 8)?);
            blocks.push(store.get_mutable_area(ptr)?);
        }
        let mut list = Self {
            store,
            header,
            blocks,
            used,
            free_slots: Vec::new(),
        };
        for i in 0..used {
            if list.get(i)?.0 == 0 {
                list.free_slots.push(i);
            }
        }
        Ok(list)
    }

    /// The header area id, recorded in the table header.
    pub fn header_area(&self) -> AreaId {
        self.header.id()
    }

    /// High-water mark of ever-allocated slots.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Locate slot `i`: (block index, byte offset within the block).
    fn locate(&self, i: u64) -> Result<(usize, usize)> {
        let mut remaining = i;
        for k in 0..self.blocks.len() {
            let cap = block_capacity(k);
            if remaining < cap {
                return Ok((k, remaining as usize * RECORD_SIZE));
            }
            remaining -= cap;
        }
        Err(Error::Corruption(format!(
            "record slot {} beyond allocated blocks",
            i
        )))
    }

    /// Read slot `i` as (status, pointer).
    pub fn get(&self, i: u64) -> Result<(u32, i64)> {
        let (k, at) = self.locate(i)?;
        let status = self.blocks[k].get_u32_at(at)?;
        let ptr = self.blocks[k].get_i64_at(at + 4)?;
        Ok((status, ptr))
    }

    /// Write slot `i`.
    pub fn set(&mut self, i: u64, status: u32, ptr: i64) -> Result<()> {
        let _guard = lock_store_write(self.store.as_ref());
        let (k, at) = self.locate(i)?;
        self.blocks[k].put_u32_at(at, status);
        self.blocks[k].put_i64_at(at + 4, ptr);
        self.blocks[k].check_out(self.store.as_ref())
    }

    /// Update only the status of slot `i`.
    pub fn set_status(&mut self, i: u64, status: u32) -> Result<()> {
        let _guard = lock_store_write(self.store.as_ref());
        let (k, at) = self.locate(i)?;
        self.blocks[k].put_u32_at(at, status);
        self.blocks[k].check_out(self.store.as_ref())
    }

    /// Allocate a slot, reusing a freed one when available.
    ///
    /// The slot's status is zero until the caller sets it.
    pub fn alloc(&mut self) -> Result<u64> {
        if let Some(slot) = self.free_slots.pop() {
            return Ok(slot);
        }
        let slot = self.used;
        self.ensure_capacity(slot + 1)?;
        self.used = slot + 1;
        let _guard = lock_store_write(self.store.as_ref());
        self.header.put_i64_at(USED_OFFSET, self.used as i64);
        self.header.check_out(self.store.as_ref())?;
        Ok(slot)
    }

    /// Mark slot `i` free. The pointer field is left intact.
    pub fn free(&mut self, i: u64) -> Result<()> {
        self.set_status(i, 0)?;
        self.free_slots.push(i);
        Ok(())
    }

    /// Resurrect a freed slot with the given status and pointer (opening
    /// scan repair). Removes it from the free list.
    pub fn mark_used(&mut self, i: u64, status: u32, ptr: i64) -> Result<()> {
        self.free_slots.retain(|&s| s != i);
        self.set(i, status, ptr)
    }

    fn ensure_capacity(&mut self, needed: u64) -> Result<()> {
        let mut capacity: u64 = (0..self.blocks.len()).map(block_capacity).sum();
        while capacity < needed {
            let k = self.blocks.len();
            if k >= MAX_BLOCKS {
                return Err(Error::Corruption("record list block limit reached".into()));
            }
            let size = block_capacity(k) as usize * RECORD_SIZE;
            let _guard = lock_store_write(self.store.as_ref());
            let block_id = self.store.create_area(size)?.finish(self.store.as_ref())?;
            self.header.put_i64_at(BLOCK_PTRS_OFFSET + k * 8, block_id.0);
            self.header.put_u32_at(BLOCK_COUNT_OFFSET, (k + 1) as u32);
            self.header.check_out(self.store.as_ref())?;
            self.blocks.push(self.store.get_mutable_area(block_id)?);
            capacity += block_capacity(k);
        }
        Ok(())
    }

    /// Every area owned by this list (for `DROP TABLE`).
    pub fn all_areas(&self) -> Vec<AreaId> {
        let mut out = vec![self.header.id()];
        out.extend(self.blocks.iter().map(|b| b.id()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HeapStore;

    fn heap() -> Arc<dyn Store> {
        Arc::new(HeapStore::new())
    }

    #[test]
    fn test_alloc_and_set_get() {
        let store = heap();
        let mut list = FixedRecordList::create(Arc::clone(&store)).unwrap();
        let a = list.alloc().unwrap();
        let b = list.alloc().unwrap();
        assert_eq!((a, b), (0, 1));
        list.set(a, 0x8000_0010, 4096).unwrap();
        assert_eq!(list.get(a).unwrap(), (0x8000_0010, 4096));
        assert_eq!(list.get(b).unwrap(), (0, 0));
    }

    #[test]
    fn test_growth_across_blocks() {
        let store = heap();
        let mut list = FixedRecordList::create(Arc::clone(&store)).unwrap();
        // First block holds 64 records; push well past it.
        for i in 0..200u64 {
            let slot = list.alloc().unwrap();
            assert_eq!(slot, i);
            list.set(slot, 0x8000_0000 | i as u32, i as i64 * 8).unwrap();
        }
        for i in 0..200u64 {
            assert_eq!(list.get(i).unwrap(), (0x8000_0000 | i as u32, i as i64 * 8));
        }
    }

    #[test]
    fn test_free_and_reuse_keeps_pointer() {
        let store = heap();
        let mut list = FixedRecordList::create(Arc::clone(&store)).unwrap();
        let a = list.alloc().unwrap();
        list.set(a, 0x8000_0000, 777).unwrap();
        list.free(a).unwrap();
        // Status cleared, pointer preserved for the opening scan.
        assert_eq!(list.get(a).unwrap(), (0, 777));
        assert_eq!(list.alloc().unwrap(), a);
    }

    #[test]
    fn test_reopen() {
        let store = heap();
        let header = {
            let mut list = FixedRecordList::create(Arc::clone(&store)).unwrap();
            for i in 0..100u64 {
                let slot = list.alloc().unwrap();
                list.set(slot, 0x8000_0000, i as i64).unwrap();
            }
            list.free(42).unwrap();
            list.header_area()
        };
        let mut list = FixedRecordList::open(Arc::clone(&store), header).unwrap();
        assert_eq!(list.used(), 100);
        assert_eq!(list.get(7).unwrap(), (0x8000_0000, 7));
        // The freed slot is found again by the open-time scan.
        assert_eq!(list.alloc().unwrap(), 42);
    }
}
