//! In-memory store for `heap-only` databases and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{AreaId, Error, Result};
use crate::store::area::{Area, AreaWriter, MutableArea};
use crate::store::latch::WriteLatch;
use crate::store::{Store, FIXED_SLOT_COUNT};

/// A store whose areas live entirely in process memory.
///
/// Ids are synthesized from a bump counter using the same 8-byte-aligned
/// spacing a file store would produce, so pointer arithmetic assumptions
/// hold in tests.
pub struct HeapStore {
    areas: Mutex<HashMap<i64, Arc<Vec<u8>>>>,
    fixed: Mutex<[AreaId; FIXED_SLOT_COUNT]>,
    next_id: AtomicI64,
    latch: WriteLatch,
}

impl HeapStore {
    pub fn new() -> Self {
        Self {
            areas: Mutex::new(HashMap::new()),
            fixed: Mutex::new([AreaId::NULL; FIXED_SLOT_COUNT]),
            // Parity with FileStore: ids below 256 are header space.
            next_id: AtomicI64::new(256),
            latch: WriteLatch::new(),
        }
    }

    /// Number of currently allocated areas.
    pub fn area_count(&self) -> usize {
        self.areas.lock().len()
    }
}

impl Default for HeapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for HeapStore {
    fn create_area(&self, size: usize) -> Result<AreaWriter> {
        let span = (size as i64 + 8 + 7) & !7;
        let id = self.next_id.fetch_add(span, Ordering::Relaxed);
        self.areas.lock().insert(id, Arc::new(vec![0u8; size]));
        Ok(AreaWriter::new(AreaId::new(id), size))
    }

    fn get_area(&self, id: AreaId) -> Result<Area> {
        let areas = self.areas.lock();
        let data = areas
            .get(&id.0)
            .unwrap_or_else(|| panic!("{} is not allocated", id));
        Ok(Area::new(id, Arc::clone(data)))
    }

    fn get_mutable_area(&self, id: AreaId) -> Result<MutableArea> {
        let areas = self.areas.lock();
        let data = areas
            .get(&id.0)
            .unwrap_or_else(|| panic!("{} is not allocated", id));
        Ok(MutableArea::new(id, data.as_ref().clone()))
    }

    fn delete_area(&self, id: AreaId) -> Result<()> {
        let removed = self.areas.lock().remove(&id.0);
        if removed.is_none() {
            // Double-free indicates a refcounting bug upstream.
            return Err(Error::Corruption(format!("{} freed twice", id)));
        }
        Ok(())
    }

    fn get_fixed_slot(&self, slot: usize) -> Result<AreaId> {
        Ok(self.fixed.lock()[slot])
    }

    fn set_fixed_slot(&self, slot: usize, id: AreaId) -> Result<()> {
        self.fixed.lock()[slot] = id;
        Ok(())
    }

    fn lock_for_write(&self) {
        self.latch.lock();
    }

    fn unlock_for_write(&self) {
        self.latch.unlock();
    }

    fn write_area_data(&self, id: AreaId, offset: usize, data: &[u8]) -> Result<()> {
        let mut areas = self.areas.lock();
        let buf = areas
            .get_mut(&id.0)
            .unwrap_or_else(|| panic!("{} is not allocated", id));
        let buf = Arc::make_mut(buf);
        if offset + data.len() > buf.len() {
            return Err(Error::Corruption(format!(
                "write past end of {}: {}..{} > {}",
                id,
                offset,
                offset + data.len(),
                buf.len()
            )));
        }
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn checkpoint(&self, _sync: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read() {
        let store = HeapStore::new();
        let mut w = store.create_area(8).unwrap();
        w.write_i64(77);
        let id = w.finish(&store).unwrap();

        let mut area = store.get_area(id).unwrap();
        assert_eq!(area.read_i64().unwrap(), 77);
        assert_eq!(store.area_count(), 1);
    }

    #[test]
    fn test_ids_are_distinct() {
        let store = HeapStore::new();
        let a = store.create_area(100).unwrap().finish(&store).unwrap();
        let b = store.create_area(100).unwrap().finish(&store).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_delete_area() {
        let store = HeapStore::new();
        let id = store.create_area(4).unwrap().finish(&store).unwrap();
        store.delete_area(id).unwrap();
        assert_eq!(store.area_count(), 0);
        // Freeing twice is a refcount bug.
        assert!(store.delete_area(id).is_err());
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_get_missing_area_panics() {
        let store = HeapStore::new();
        let _ = store.get_area(AreaId::new(999));
    }

    #[test]
    fn test_fixed_slots() {
        let store = HeapStore::new();
        assert!(store.get_fixed_slot(0).unwrap().is_null());
        store.set_fixed_slot(0, AreaId::new(512)).unwrap();
        assert_eq!(store.get_fixed_slot(0).unwrap(), AreaId::new(512));
    }
}
