//! Versioned, snapshot-capable store of sorted integer lists.
//!
//! One [`IndexSetStore`] owns the persistent index lists of one table.
//! Readers take an [`IndexSet`] snapshot: a shallow clone of each list's
//! block chain plus a reference on the list's current *generation*.
//! Mutation is copy-on-write inside the snapshot; `commit()` writes the
//! changed blocks to fresh areas and atomically publishes a new index
//! header through the start area's pointer.
//!
//! # On-disk layout
//! ```text
//! start area (32 B):   magic u32 = 0x0CA90291, version u32 = 1,
//!                      indexHeaderPointer i64, padding 16 B
//! index header:        version u32 = 1, reserved u32 = 0,
//!                      indexCount i64 = N,
//!                      N x (type u32 = 1, blockSize u32, indexBlockPointer i64)
//! index block area:    version u32 = 1, reserved u32 = 0,
//!                      entryCount i64 = E,
//!                      E x (firstInt i64, lastInt i64, elementPointer i64,
//!                           size_and_compaction u32)
//! element area:        compactionClass x elementCount bytes, big-endian
//! ```
//! `size_and_compaction` holds the element count in the low 24 bits and
//! the compaction class in the high 8 bits.
//!
//! # Generation chain
//! Superseded index-block areas form a parent chain per list, refcounted
//! from snapshots. A generation's superseded areas are freed only once
//! the generation is unreferenced *and* its whole parent chain has been
//! freed, so no area dies while a live snapshot can transitively reach
//! it. The walk is deterministic; every area passes through
//! `delete_area` exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::{AreaId, Error, Result};
use crate::index::block::{pack_ints, IndexBlock};
use crate::index::list::SortedIntList;
use crate::store::{lock_store_write, Store};

const START_MAGIC: u32 = 0x0CA9_0291;
const START_VERSION: u32 = 1;
const START_AREA_SIZE: usize = 32;

const HEADER_VERSION: u32 = 1;
const SUMMARY_VERSION: u32 = 1;
const LIST_TYPE: u32 = 1;

/// Arena index of a list generation.
type GenId = usize;

struct Generation {
    /// The index-block summary area of this generation.
    area: AreaId,
    blocks: Vec<Arc<IndexBlock>>,
    parent: Option<GenId>,
    child: Option<GenId>,
    /// Element areas this generation superseded when it was created.
    deleted_areas: Vec<AreaId>,
    ref_count: usize,
    /// Set when a newer generation has been published for the list.
    superseded: bool,
    freed: bool,
}

struct ListState {
    block_size: u32,
    gen: GenId,
}

struct SetStoreInner {
    start_area: AreaId,
    header_area: AreaId,
    lists: Vec<ListState>,
    arena: Vec<Option<Generation>>,
    free_slots: Vec<GenId>,
    /// Bumped on every publish; snapshots must descend from the current
    /// version to commit.
    version: u64,
}

/// A snapshot of all lists of one index set.
///
/// Immutable with respect to subsequent commits; mutation through
/// `list_mut` is private to the holder until the set is committed.
pub struct IndexSet {
    lists: Vec<SortedIntList>,
    base_gens: Vec<GenId>,
    version: u64,
}

impl IndexSet {
    /// Number of lists (list 0 is the master row list).
    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    /// Read access to list `n`.
    pub fn list(&self, n: usize) -> &SortedIntList {
        &self.lists[n]
    }

    /// Mutable access to list `n` (copy-on-write).
    pub fn list_mut(&mut self, n: usize) -> &mut SortedIntList {
        &mut self.lists[n]
    }

    /// Whether any list diverged from the published state.
    pub fn is_modified(&self) -> bool {
        self.lists.iter().any(|l| l.is_modified())
    }
}

/// Persistent store of one table's index lists.
pub struct IndexSetStore {
    store: Arc<dyn Store>,
    inner: Mutex<SetStoreInner>,
}

impl IndexSetStore {
    // ========================================================================
    // Creation / opening
    // ========================================================================

    /// Create a fresh set with `list_count` empty lists.
    pub fn create(store: Arc<dyn Store>, list_count: usize, block_size: usize) -> Result<Self> {
        let _guard = lock_store_write(store.as_ref());

        let mut arena: Vec<Option<Generation>> = Vec::new();
        let mut lists = Vec::with_capacity(list_count);
        for _ in 0..list_count {
            let area = write_summary_area(store.as_ref(), &[])?;
            let gen = arena.len();
            arena.push(Some(Generation {
                area,
                blocks: Vec::new(),
                parent: None,
                child: None,
                deleted_areas: Vec::new(),
                ref_count: 0,
                superseded: false,
                freed: false,
            }));
            lists.push(ListState {
                block_size: block_size as u32,
                gen,
            });
        }

        let header_area = write_header_area(store.as_ref(), &lists, &arena)?;

        let mut w = store.create_area(START_AREA_SIZE)?;
        w.write_u32(START_MAGIC);
        w.write_u32(START_VERSION);
        w.write_i64(header_area.0);
        let start_area = w.finish(store.as_ref())?;

        drop(_guard);

        Ok(Self {
            store,
            inner: Mutex::new(SetStoreInner {
                start_area,
                header_area,
                lists,
                arena,
                free_slots: Vec::new(),
                version: 0,
            }),
        })
    }

    /// Open an existing set from its start area.
    pub fn open(store: Arc<dyn Store>, start_area: AreaId) -> Result<Self> {
        let mut start = store.get_area(start_area)?;
        let magic = start.read_u32()?;
        if magic != START_MAGIC {
            return Err(Error::Corruption(format!(
                "bad index set magic {:08x} at {}",
                magic, start_area
            )));
        }
        let version = start.read_u32()?;
        if version != START_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported index set version {}",
                version
            )));
        }
        let header_area = AreaId::new(start.read_i64()?);

        let mut header = store.get_area(header_area)?;
        let hversion = header.read_u32()?;
        let _reserved = header.read_u32()?;
        if hversion != HEADER_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported index header version {}",
                hversion
            )));
        }
        let count = header.read_i64()? as usize;

        let mut arena: Vec<Option<Generation>> = Vec::new();
        let mut lists = Vec::with_capacity(count);
        for _ in 0..count {
            let ltype = header.read_u32()?;
            if ltype != LIST_TYPE {
                return Err(Error::Corruption(format!("unknown index list type {}", ltype)));
            }
            let block_size = header.read_u32()?;
            let summary_area = AreaId::new(header.read_i64()?);
            let blocks = read_summary_area(&store, summary_area)?;
            let gen = arena.len();
            arena.push(Some(Generation {
                area: summary_area,
                blocks,
                parent: None,
                child: None,
                deleted_areas: Vec::new(),
                ref_count: 0,
                superseded: false,
                freed: false,
            }));
            lists.push(ListState { block_size, gen });
        }

        Ok(Self {
            store,
            inner: Mutex::new(SetStoreInner {
                start_area,
                header_area,
                lists,
                arena,
                free_slots: Vec::new(),
                version: 0,
            }),
        })
    }

    /// The start area id, recorded in the owning table's header.
    pub fn start_area(&self) -> AreaId {
        self.inner.lock().start_area
    }

    /// Number of lists in the published set.
    pub fn list_count(&self) -> usize {
        self.inner.lock().lists.len()
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Take a snapshot of the published lists.
    ///
    /// The snapshot sees a fixed set of immutable blocks and is
    /// unaffected by subsequent commits. Release it with
    /// [`IndexSetStore::release_snapshot`] (or consume it in
    /// [`IndexSetStore::commit`]).
    pub fn snapshot(&self) -> IndexSet {
        let mut inner = self.inner.lock();
        let mut lists = Vec::with_capacity(inner.lists.len());
        let mut base_gens = Vec::with_capacity(inner.lists.len());
        for i in 0..inner.lists.len() {
            let gen_id = inner.lists[i].gen;
            let block_size = inner.lists[i].block_size as usize;
            let gen = inner.arena[gen_id].as_mut().expect("live generation");
            gen.ref_count += 1;
            lists.push(SortedIntList::from_blocks(gen.blocks.clone(), block_size));
            base_gens.push(gen_id);
        }
        IndexSet {
            lists,
            base_gens,
            version: inner.version,
        }
    }

    /// Drop a snapshot's references, freeing superseded generations
    /// whose parent chains have fully collapsed.
    pub fn release_snapshot(&self, set: IndexSet) -> Result<()> {
        let mut inner = self.inner.lock();
        for gen_id in &set.base_gens {
            self.remove_reference(&mut inner, *gen_id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Atomically publish a mutated snapshot.
    ///
    /// Must be called with the conglomerate's commit lock held, and only
    /// against a snapshot that descends from the currently published one.
    ///
    /// # Panics
    /// Panics if the snapshot does not descend from the published state;
    /// that is a logic error in the caller's commit sequencing.
    pub fn commit(&self, set: IndexSet) -> Result<()> {
        let mut inner = self.inner.lock();
        assert_eq!(
            set.version, inner.version,
            "index set commit against a stale snapshot"
        );
        assert_eq!(set.lists.len(), inner.lists.len());

        let store = Arc::clone(&self.store);
        let _guard = lock_store_write(store.as_ref());

        let mut any_change = false;
        for (i, list) in set.lists.iter().enumerate() {
            if !list.is_modified() {
                continue;
            }
            any_change = true;
            let parent_id = inner.lists[i].gen;

            // Write each in-memory block to a fresh element area; retained
            // stored blocks are shared as-is.
            let mut new_blocks: Vec<Arc<IndexBlock>> = Vec::with_capacity(list.blocks().len());
            for block in list.blocks() {
                if block.is_memory() {
                    let values = Arc::new(block.values_vec()?);
                    let (class, packed) = pack_ints(&values)?;
                    let mut w = store.create_area(packed.len())?;
                    w.write_bytes(&packed);
                    let area = w.finish(store.as_ref())?;
                    new_blocks.push(Arc::new(IndexBlock::stored_primed(
                        Arc::clone(&store),
                        area,
                        class,
                        values,
                    )));
                } else {
                    new_blocks.push(Arc::clone(block));
                }
            }

            // Element areas of the parent that no longer appear are
            // superseded by this generation.
            let retained: HashSet<AreaId> =
                new_blocks.iter().filter_map(|b| b.stored_area()).collect();
            let parent = inner.arena[parent_id].as_ref().expect("live generation");
            let deleted_areas: Vec<AreaId> = parent
                .blocks
                .iter()
                .filter_map(|b| b.stored_area())
                .filter(|a| !retained.contains(a))
                .collect();

            let summary_area = write_summary_area_blocks(store.as_ref(), &new_blocks)?;

            let new_id = alloc_gen_slot(&mut inner);
            inner.arena[new_id] = Some(Generation {
                area: summary_area,
                blocks: new_blocks,
                parent: Some(parent_id),
                child: None,
                deleted_areas,
                ref_count: 0,
                superseded: false,
                freed: false,
            });
            {
                let parent = inner.arena[parent_id].as_mut().expect("live generation");
                parent.superseded = true;
                parent.child = Some(new_id);
            }
            inner.lists[i].gen = new_id;
        }

        if any_change {
            // Build and publish the new header; the single pointer update
            // in the start area is the linearization point.
            let new_header = write_header_area(store.as_ref(), &inner.lists, &inner.arena)?;
            let mut start = store.get_mutable_area(inner.start_area)?;
            start.put_i64_at(8, new_header.0);
            start.check_out(store.as_ref())?;

            let old_header = inner.header_area;
            store.delete_area(old_header)?;
            inner.header_area = new_header;
        }
        inner.version += 1;

        // The consumed snapshot's references come off; superseded parents
        // may now be reclaimable.
        for gen_id in &set.base_gens {
            self.remove_reference(&mut inner, *gen_id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Structural operations
    // ========================================================================

    /// Append `count` empty lists.
    pub fn add_indices(&self, count: usize, block_size: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let store = Arc::clone(&self.store);
        let _guard = lock_store_write(store.as_ref());
        for _ in 0..count {
            let area = write_summary_area(store.as_ref(), &[])?;
            let gen = alloc_gen_slot(&mut inner);
            inner.arena[gen] = Some(Generation {
                area,
                blocks: Vec::new(),
                parent: None,
                child: None,
                deleted_areas: Vec::new(),
                ref_count: 0,
                superseded: false,
                freed: false,
            });
            let block_size = block_size as u32;
            inner.lists.push(ListState { block_size, gen });
        }
        self.publish_header(&mut inner)?;
        Ok(())
    }

    /// Clear list `n` to empty.
    ///
    /// List numbering is stable: subsequent lists keep their positions.
    pub fn drop_index(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        assert!(n > 0 && n < inner.lists.len(), "cannot drop list {}", n);
        let store = Arc::clone(&self.store);
        let _guard = lock_store_write(store.as_ref());

        let parent_id = inner.lists[n].gen;
        let parent = inner.arena[parent_id].as_ref().expect("live generation");
        let deleted_areas: Vec<AreaId> =
            parent.blocks.iter().filter_map(|b| b.stored_area()).collect();
        let area = write_summary_area(store.as_ref(), &[])?;
        let new_id = alloc_gen_slot(&mut inner);
        inner.arena[new_id] = Some(Generation {
            area,
            blocks: Vec::new(),
            parent: Some(parent_id),
            child: None,
            deleted_areas,
            ref_count: 0,
            superseded: false,
            freed: false,
        });
        {
            let parent = inner.arena[parent_id].as_mut().expect("live generation");
            parent.superseded = true;
            parent.child = Some(new_id);
        }
        inner.lists[n].gen = new_id;
        self.publish_header(&mut inner)?;
        self.try_free(&mut inner, parent_id)?;
        Ok(())
    }

    /// Delete every area belonging to this set. Used by `DROP TABLE`
    /// once the owning table has no remaining root locks.
    pub fn free_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let store = Arc::clone(&self.store);
        let _guard = lock_store_write(store.as_ref());

        let mut areas: HashSet<AreaId> = HashSet::new();
        for slot in inner.arena.iter_mut() {
            if let Some(gen) = slot.as_mut() {
                if gen.freed {
                    continue;
                }
                areas.insert(gen.area);
                areas.extend(gen.deleted_areas.drain(..));
                areas.extend(gen.blocks.iter().filter_map(|b| b.stored_area()));
                gen.freed = true;
                gen.blocks.clear();
            }
        }
        areas.insert(inner.header_area);
        areas.insert(inner.start_area);
        for area in areas {
            store.delete_area(area)?;
        }
        Ok(())
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn publish_header(&self, inner: &mut SetStoreInner) -> Result<()> {
        let store = self.store.as_ref();
        let new_header = write_header_area(store, &inner.lists, &inner.arena)?;
        let mut start = store.get_mutable_area(inner.start_area)?;
        start.put_i64_at(8, new_header.0);
        start.check_out(store)?;
        store.delete_area(inner.header_area)?;
        inner.header_area = new_header;
        inner.version += 1;
        Ok(())
    }

    fn remove_reference(&self, inner: &mut SetStoreInner, gen_id: GenId) -> Result<()> {
        {
            let gen = inner.arena[gen_id].as_mut().expect("live generation");
            assert!(gen.ref_count > 0, "index generation refcount underflow");
            gen.ref_count -= 1;
        }
        self.try_free(inner, gen_id)
    }

    /// Free `gen_id` if it is unreferenced, superseded, and its parent
    /// chain has been freed; then cascade down the chain.
    fn try_free(&self, inner: &mut SetStoreInner, gen_id: GenId) -> Result<()> {
        let mut current = Some(gen_id);
        while let Some(id) = current {
            let (eligible, child) = {
                let gen = inner.arena[id].as_ref().expect("live generation");
                let parent_freed = match gen.parent {
                    None => true,
                    Some(p) => inner.arena[p].as_ref().map(|g| g.freed).unwrap_or(true),
                };
                (
                    !gen.freed && gen.superseded && gen.ref_count == 0 && parent_freed,
                    gen.child,
                )
            };
            if !eligible {
                break;
            }
            let (area, deleted) = {
                let gen = inner.arena[id].as_mut().expect("live generation");
                gen.freed = true;
                gen.blocks.clear();
                (gen.area, std::mem::take(&mut gen.deleted_areas))
            };
            debug!(
                "freeing index generation {}: summary {} plus {} superseded areas",
                id,
                area,
                deleted.len()
            );
            self.store.delete_area(area)?;
            for d in deleted {
                self.store.delete_area(d)?;
            }
            // The freed slot stays parked until its child is freed too, so
            // the child's parent_freed check can still see it. Its own
            // parent, now shadowed on both sides, can be recycled.
            let parent = inner.arena[id].as_ref().and_then(|g| g.parent);
            if let Some(p) = parent {
                if inner.arena[p].as_ref().map(|g| g.freed).unwrap_or(false) {
                    inner.arena[p] = None;
                    inner.free_slots.push(p);
                }
            }
            current = child;
        }
        Ok(())
    }
}

fn alloc_gen_slot(inner: &mut SetStoreInner) -> GenId {
    if let Some(id) = inner.free_slots.pop() {
        id
    } else {
        inner.arena.push(None);
        inner.arena.len() - 1
    }
}

/// Write an index-block summary area over `blocks`.
fn write_summary_area_blocks(store: &dyn Store, blocks: &[Arc<IndexBlock>]) -> Result<AreaId> {
    let mut w = store.create_area(16 + 28 * blocks.len())?;
    w.write_u32(SUMMARY_VERSION);
    w.write_u32(0);
    w.write_i64(blocks.len() as i64);
    for block in blocks {
        let area = block
            .stored_area()
            .expect("summary entries must reference stored blocks");
        let class = block.stored_class().expect("stored block has a class");
        w.write_i64(block.first());
        w.write_i64(block.last());
        w.write_i64(area.0);
        w.write_u32(((class as u32) << 24) | (block.len() as u32 & 0x00FF_FFFF));
    }
    w.finish(store)
}

fn write_summary_area(store: &dyn Store, blocks: &[Arc<IndexBlock>]) -> Result<AreaId> {
    write_summary_area_blocks(store, blocks)
}

/// Read a summary area back into a block chain.
fn read_summary_area(store: &Arc<dyn Store>, area: AreaId) -> Result<Vec<Arc<IndexBlock>>> {
    let mut view = store.get_area(area)?;
    let version = view.read_u32()?;
    if version != SUMMARY_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported index block version {} at {}",
            version, area
        )));
    }
    let _reserved = view.read_u32()?;
    let count = view.read_i64()? as usize;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let first = view.read_i64()?;
        let last = view.read_i64()?;
        let element = AreaId::new(view.read_i64()?);
        let size_and_compaction = view.read_u32()?;
        let class = (size_and_compaction >> 24) as u8;
        let len = size_and_compaction & 0x00FF_FFFF;
        blocks.push(Arc::new(IndexBlock::stored(
            Arc::clone(store),
            element,
            len,
            class,
            first,
            last,
        )));
    }
    Ok(blocks)
}

/// Write a fresh index header enumerating all lists.
fn write_header_area(
    store: &dyn Store,
    lists: &[ListState],
    arena: &[Option<Generation>],
) -> Result<AreaId> {
    let mut w = store.create_area(16 + 16 * lists.len())?;
    w.write_u32(HEADER_VERSION);
    w.write_u32(0);
    w.write_i64(lists.len() as i64);
    for list in lists {
        let gen = arena[list.gen].as_ref().expect("live generation");
        w.write_u32(LIST_TYPE);
        w.write_u32(list.block_size);
        w.write_i64(gen.area.0);
    }
    w.finish(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HeapStore;

    fn heap() -> Arc<dyn Store> {
        Arc::new(HeapStore::new())
    }

    fn insert_rows(set: &mut IndexSet, rows: &[i64]) {
        for &r in rows {
            set.list_mut(0).insert_sorted(r).unwrap();
        }
    }

    #[test]
    fn test_create_snapshot_commit() {
        let store = heap();
        let iss = IndexSetStore::create(Arc::clone(&store), 2, 64).unwrap();

        let mut set = iss.snapshot();
        insert_rows(&mut set, &[3, 1, 2]);
        iss.commit(set).unwrap();

        let set2 = iss.snapshot();
        assert_eq!(set2.list(0).to_vec().unwrap(), vec![1, 2, 3]);
        iss.release_snapshot(set2).unwrap();
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = heap();
        let iss = IndexSetStore::create(Arc::clone(&store), 1, 64).unwrap();

        let mut writer = iss.snapshot();
        insert_rows(&mut writer, &[10, 20]);
        iss.commit(writer).unwrap();

        let reader = iss.snapshot();
        assert_eq!(reader.list(0).len(), 2);

        let mut writer2 = iss.snapshot();
        insert_rows(&mut writer2, &[30]);
        iss.commit(writer2).unwrap();

        // The earlier snapshot is unaffected by the later commit.
        assert_eq!(reader.list(0).to_vec().unwrap(), vec![10, 20]);
        iss.release_snapshot(reader).unwrap();
    }

    #[test]
    #[should_panic(expected = "stale snapshot")]
    fn test_stale_commit_panics() {
        let store = heap();
        let iss = IndexSetStore::create(Arc::clone(&store), 1, 64).unwrap();

        let mut a = iss.snapshot();
        let mut b = iss.snapshot();
        insert_rows(&mut a, &[1]);
        insert_rows(&mut b, &[2]);
        iss.commit(a).unwrap();
        // b no longer descends from the published state.
        let _ = iss.commit(b);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let store = heap();
        let start = {
            let iss = IndexSetStore::create(Arc::clone(&store), 2, 16).unwrap();
            let mut set = iss.snapshot();
            for v in 0..100 {
                set.list_mut(0).insert_sorted(v).unwrap();
                set.list_mut(1).insert_sorted(99 - v).unwrap();
            }
            iss.commit(set).unwrap();
            iss.start_area()
        };

        let iss = IndexSetStore::open(Arc::clone(&store), start).unwrap();
        let set = iss.snapshot();
        assert_eq!(set.list(0).to_vec().unwrap(), (0..100).collect::<Vec<_>>());
        assert_eq!(set.list(1).len(), 100);
        iss.release_snapshot(set).unwrap();
    }

    #[test]
    fn test_superseded_areas_freed_in_chain_order() {
        let store: Arc<HeapStore> = Arc::new(HeapStore::new());
        let dyn_store: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
        let iss = IndexSetStore::create(dyn_store, 1, 8).unwrap();

        // Publish three generations while holding a snapshot of the first.
        let mut g1 = iss.snapshot();
        insert_rows(&mut g1, &[1, 2, 3]);
        iss.commit(g1).unwrap();

        let pinned = iss.snapshot();
        let count_pinned = store.area_count();

        for v in 10..30 {
            let mut s = iss.snapshot();
            insert_rows(&mut s, &[v]);
            iss.commit(s).unwrap();
        }
        // Superseded generations cannot be reclaimed below the pinned one.
        assert!(store.area_count() > count_pinned);

        iss.release_snapshot(pinned).unwrap();
        // With the pin gone the whole chain collapses; only the live
        // generation's areas, the header, and the start area remain.
        let set = iss.snapshot();
        let live_blocks = set.list(0).blocks().len();
        iss.release_snapshot(set).unwrap();
        assert_eq!(store.area_count(), live_blocks + 1 + 1 + 1);
    }

    #[test]
    fn test_add_and_drop_indices() {
        let store = heap();
        let iss = IndexSetStore::create(Arc::clone(&store), 1, 16).unwrap();
        iss.add_indices(2, 16).unwrap();
        assert_eq!(iss.list_count(), 3);

        let mut set = iss.snapshot();
        set.list_mut(2).insert_sorted(5).unwrap();
        iss.commit(set).unwrap();

        iss.drop_index(2).unwrap();
        assert_eq!(iss.list_count(), 3);
        let set = iss.snapshot();
        assert_eq!(set.list(2).len(), 0);
        iss.release_snapshot(set).unwrap();
    }
}
