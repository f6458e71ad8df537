//! File-backed area store.
//!
//! Areas are laid out sequentially in a single database file accessed
//! through the [`BufferManager`]. An area id is the byte offset of its
//! 16-byte header:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │ capacity: i64   │ length: i64     │ data: capacity bytes     │
//! │  bit 62 = free  │ exact data size │                          │
//! └─────────────────┴─────────────────┴──────────────────────────┘
//! ```
//!
//! Capacity is the slot's 8-byte-aligned span (stable across reuse, so
//! the open-time header walk stays aligned); length is the exact number
//! of bytes a reader gets back.
//!
//! The store header occupies the first [`HEADER_RESERVED`] bytes:
//! magic, format version, allocation high-water mark, and the fixed-area
//! pointer slots. Allocation walks an in-memory free list (rebuilt by
//! scanning headers on open) and falls back to bumping the high-water
//! mark. Freed space is reused first-fit; coalescing is lazy.

use std::path::Path;

use log::info;
use parking_lot::Mutex;

use crate::buffer::BufferManager;
use crate::common::{AreaId, DbConfig, Error, Result};
use crate::store::area::{Area, AreaWriter, MutableArea};
use crate::store::latch::WriteLatch;
use crate::store::{Store, FIXED_SLOT_COUNT};

const STORE_MAGIC: u32 = 0x4D56_5354; // "MVST"
const STORE_VERSION: u32 = 1;

/// Bytes reserved at offset 0 for the store header.
const HEADER_RESERVED: i64 = 256;

// Header field offsets.
const MAGIC_OFFSET: u64 = 0;
const VERSION_OFFSET: u64 = 4;
const HIGH_WATER_OFFSET: u64 = 8;
const FIXED_SLOTS_OFFSET: u64 = 16;

// Area header layout.
const AREA_HEADER_SIZE: i64 = 16;
const FREE_FLAG: i64 = 1 << 62;
const CAPACITY_MASK: i64 = (1 << 56) - 1;

/// Smallest split remainder worth keeping as its own free area.
const MIN_SPLIT: usize = 64;

/// Database file name within `database_path`.
pub const DATA_FILE_NAME: &str = "data.mvc";
/// Redo journal file name within `database_path`.
pub const JOURNAL_FILE_NAME: &str = "data.mvj";

struct FreeEntry {
    offset: i64,
    capacity: usize,
}

struct AllocState {
    /// Next unallocated offset.
    high_water: i64,
    free: Vec<FreeEntry>,
}

/// Area store persisted in a single database file.
pub struct FileStore {
    buf: BufferManager,
    alloc: Mutex<AllocState>,
    latch: WriteLatch,
    read_only: bool,
}

impl FileStore {
    /// Create a fresh store under `config.database_path`.
    pub fn create(config: &DbConfig) -> Result<Self> {
        let data_path = config.database_path.join(DATA_FILE_NAME);
        let journal_path = config.database_path.join(JOURNAL_FILE_NAME);
        let buf = BufferManager::create(
            &data_path,
            &journal_path,
            config.page_size,
            config.max_cache_pages,
            config.journal_enabled(),
        )?;

        let store = Self {
            buf,
            alloc: Mutex::new(AllocState {
                high_water: HEADER_RESERVED,
                free: Vec::new(),
            }),
            latch: WriteLatch::new(),
            read_only: false,
        };
        store.buf.write(MAGIC_OFFSET, &STORE_MAGIC.to_be_bytes())?;
        store.buf.write(VERSION_OFFSET, &STORE_VERSION.to_be_bytes())?;
        store
            .buf
            .write(HIGH_WATER_OFFSET, &HEADER_RESERVED.to_be_bytes())?;
        for slot in 0..FIXED_SLOT_COUNT {
            store.write_fixed_slot(slot, AreaId::NULL)?;
        }
        store.buf.checkpoint(config.sync_on_commit())?;
        Ok(store)
    }

    /// Open an existing store, replaying the redo journal first and
    /// rebuilding the free list from the area headers.
    pub fn open(config: &DbConfig) -> Result<Self> {
        let data_path = config.database_path.join(DATA_FILE_NAME);
        let journal_path = config.database_path.join(JOURNAL_FILE_NAME);
        let buf = BufferManager::open(
            &data_path,
            &journal_path,
            config.page_size,
            config.max_cache_pages,
            config.journal_enabled(),
        )?;

        let mut raw = [0u8; 4];
        buf.read(MAGIC_OFFSET, &mut raw)?;
        if u32::from_be_bytes(raw) != STORE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad store magic {:08x}",
                u32::from_be_bytes(raw)
            )));
        }
        buf.read(VERSION_OFFSET, &mut raw)?;
        let version = u32::from_be_bytes(raw);
        if version != STORE_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported store format version {}",
                version
            )));
        }
        let mut raw8 = [0u8; 8];
        buf.read(HIGH_WATER_OFFSET, &mut raw8)?;
        let high_water = i64::from_be_bytes(raw8);

        // Walk the headers to rebuild the free list.
        let mut free = Vec::new();
        let mut at = HEADER_RESERVED;
        while at < high_water {
            buf.read(at as u64, &mut raw8)?;
            let capacity_word = i64::from_be_bytes(raw8);
            let capacity = (capacity_word & CAPACITY_MASK) as usize;
            if capacity == 0 {
                return Err(Error::Corruption(format!(
                    "zero-length area header at offset {}",
                    at
                )));
            }
            if capacity_word & FREE_FLAG != 0 {
                free.push(FreeEntry {
                    offset: at,
                    capacity,
                });
            }
            at += AREA_HEADER_SIZE + capacity as i64;
        }
        info!(
            "opened file store: {} bytes allocated, {} free areas",
            high_water,
            free.len()
        );

        Ok(Self {
            buf,
            alloc: Mutex::new(AllocState { high_water, free }),
            latch: WriteLatch::new(),
            read_only: config.read_only,
        })
    }

    /// The underlying buffer manager (exposed for stats).
    pub fn buffer(&self) -> &BufferManager {
        &self.buf
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn write_fixed_slot(&self, slot: usize, id: AreaId) -> Result<()> {
        let at = FIXED_SLOTS_OFFSET + (slot * 8) as u64;
        self.buf.write(at, &id.0.to_be_bytes())
    }

    /// Read an area header as (capacity word, exact length).
    fn read_header(&self, id: AreaId) -> Result<(i64, usize)> {
        let mut raw = [0u8; 16];
        self.buf.read(id.0 as u64, &mut raw)?;
        let capacity_word = i64::from_be_bytes(raw[0..8].try_into().unwrap());
        let length = i64::from_be_bytes(raw[8..16].try_into().unwrap()) as usize;
        Ok((capacity_word, length))
    }

    fn write_header(&self, offset: i64, capacity_word: i64, length: usize) -> Result<()> {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&capacity_word.to_be_bytes());
        raw[8..16].copy_from_slice(&(length as i64).to_be_bytes());
        self.buf.write(offset as u64, &raw)
    }

    /// Allocate a slot for exactly `size` bytes, reusing a free area
    /// when one fits. Slot capacity stays 8-byte aligned so the header
    /// walk on open remains stable across reuse.
    fn alloc(&self, size: usize) -> Result<AreaId> {
        let needed = (size.max(1) + 7) & !7;
        let mut alloc = self.alloc.lock();

        if let Some(pos) = alloc.free.iter().position(|e| e.capacity >= needed) {
            let entry = alloc.free.remove(pos);
            let remainder = entry.capacity - needed;
            let capacity = if remainder >= MIN_SPLIT + AREA_HEADER_SIZE as usize {
                let leftover = remainder - AREA_HEADER_SIZE as usize;
                let tail = entry.offset + AREA_HEADER_SIZE + needed as i64;
                self.write_header(tail, leftover as i64 | FREE_FLAG, 0)?;
                alloc.free.push(FreeEntry {
                    offset: tail,
                    capacity: leftover,
                });
                needed
            } else {
                // Absorb the remainder rather than track a useless sliver.
                entry.capacity
            };
            self.write_header(entry.offset, capacity as i64, size)?;
            return Ok(AreaId::new(entry.offset));
        }

        let offset = alloc.high_water;
        alloc.high_water = offset + AREA_HEADER_SIZE + needed as i64;
        self.write_header(offset, needed as i64, size)?;
        self.buf
            .write(HIGH_WATER_OFFSET, &alloc.high_water.to_be_bytes())?;
        Ok(AreaId::new(offset))
    }
}

impl Store for FileStore {
    fn create_area(&self, size: usize) -> Result<AreaWriter> {
        self.check_writable()?;
        let id = self.alloc(size)?;
        Ok(AreaWriter::new(id, size))
    }

    fn get_area(&self, id: AreaId) -> Result<Area> {
        let (capacity_word, length) = self.read_header(id)?;
        assert!(
            capacity_word & FREE_FLAG == 0 && capacity_word != 0,
            "{} is not allocated",
            id
        );
        let mut data = vec![0u8; length];
        self.buf.read(id.0 as u64 + AREA_HEADER_SIZE as u64, &mut data)?;
        Ok(Area::new(id, std::sync::Arc::new(data)))
    }

    fn get_mutable_area(&self, id: AreaId) -> Result<MutableArea> {
        let area = self.get_area(id)?;
        Ok(MutableArea::new(id, area.as_slice().to_vec()))
    }

    fn delete_area(&self, id: AreaId) -> Result<()> {
        self.check_writable()?;
        let (capacity_word, _) = self.read_header(id)?;
        if capacity_word & FREE_FLAG != 0 {
            return Err(Error::Corruption(format!("{} freed twice", id)));
        }
        let capacity = (capacity_word & CAPACITY_MASK) as usize;
        self.write_header(id.0, capacity as i64 | FREE_FLAG, 0)?;
        self.alloc.lock().free.push(FreeEntry {
            offset: id.0,
            capacity,
        });
        Ok(())
    }

    fn get_fixed_slot(&self, slot: usize) -> Result<AreaId> {
        assert!(slot < FIXED_SLOT_COUNT);
        let mut raw = [0u8; 8];
        self.buf.read(FIXED_SLOTS_OFFSET + (slot * 8) as u64, &mut raw)?;
        Ok(AreaId::new(i64::from_be_bytes(raw)))
    }

    fn set_fixed_slot(&self, slot: usize, id: AreaId) -> Result<()> {
        assert!(slot < FIXED_SLOT_COUNT);
        self.check_writable()?;
        self.write_fixed_slot(slot, id)
    }

    fn lock_for_write(&self) {
        self.latch.lock();
    }

    fn unlock_for_write(&self) {
        self.latch.unlock();
    }

    fn write_area_data(&self, id: AreaId, offset: usize, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let (_, length) = self.read_header(id)?;
        if offset + data.len() > length {
            return Err(Error::Corruption(format!(
                "write past end of {}: {}..{} > {}",
                id,
                offset,
                offset + data.len(),
                length
            )));
        }
        self.buf
            .write(id.0 as u64 + AREA_HEADER_SIZE as u64 + offset as u64, data)
    }

    fn checkpoint(&self, sync: bool) -> Result<()> {
        self.buf.checkpoint(sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> DbConfig {
        DbConfig {
            database_path: dir.to_path_buf(),
            page_size: 512,
            max_cache_pages: 16,
            ..DbConfig::default()
        }
    }

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(&test_config(dir.path())).unwrap();

        let mut w = store.create_area(13).unwrap();
        w.write_string("persisted");
        let id = w.finish(&store).unwrap();

        let mut area = store.get_area(id).unwrap();
        // Odd sizes read back at their exact length, not slot capacity.
        assert_eq!(area.len(), 13);
        assert_eq!(area.read_string().unwrap(), "persisted");
    }

    #[test]
    fn test_reopen_preserves_areas() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let id = {
            let store = FileStore::create(&config).unwrap();
            let mut w = store.create_area(8).unwrap();
            w.write_i64(4242);
            let id = w.finish(&store).unwrap();
            store.set_fixed_slot(1, id).unwrap();
            store.checkpoint(true).unwrap();
            id
        };
        {
            let store = FileStore::open(&config).unwrap();
            assert_eq!(store.get_fixed_slot(1).unwrap(), id);
            let mut area = store.get_area(id).unwrap();
            assert_eq!(area.read_i64().unwrap(), 4242);
        }
    }

    #[test]
    fn test_free_list_reuse() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(&test_config(dir.path())).unwrap();

        let a = store.create_area(64).unwrap().finish(&store).unwrap();
        let _b = store.create_area(64).unwrap().finish(&store).unwrap();
        store.delete_area(a).unwrap();

        // Same-size allocation lands in the freed slot.
        let c = store.create_area(64).unwrap().finish(&store).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let a = {
            let store = FileStore::create(&config).unwrap();
            let a = store.create_area(64).unwrap().finish(&store).unwrap();
            let _b = store.create_area(64).unwrap().finish(&store).unwrap();
            store.delete_area(a).unwrap();
            store.checkpoint(true).unwrap();
            a
        };
        {
            let store = FileStore::open(&config).unwrap();
            let c = store.create_area(64).unwrap().finish(&store).unwrap();
            assert_eq!(c, a);
        }
    }

    #[test]
    fn test_double_free_fails() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(&test_config(dir.path())).unwrap();
        let id = store.create_area(16).unwrap().finish(&store).unwrap();
        store.delete_area(id).unwrap();
        assert!(store.delete_area(id).is_err());
    }

    #[test]
    fn test_read_only_blocks_writes() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        FileStore::create(&config).unwrap();
        config.read_only = true;
        let store = FileStore::open(&config).unwrap();
        assert!(matches!(store.create_area(8), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let store = FileStore::create(&config).unwrap();
            store.checkpoint(true).unwrap();
        }
        // Stomp the magic.
        let path = dir.path().join(DATA_FILE_NAME);
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(FileStore::open(&config), Err(Error::Corruption(_))));
    }
}
