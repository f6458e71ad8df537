//! MasterTable - per-table row storage and row-state lifecycle.
//!
//! A master table owns:
//! - the fixed record list mapping row index -> (status, row area)
//! - the row areas themselves (through the row codec and blob store)
//! - one [`IndexSetStore`] holding the table's persistent index lists
//! - the root-lock count that pins COMMITTED_REMOVED rows against GC
//! - the committed-journal list used for commit-time conflict checks
//!
//! # Row state machine
//! The state nibble of a slot's status byte moves along:
//! `uncommitted -> committed-added` (commit of insert),
//! `committed-added -> committed-removed` (commit of delete),
//! `uncommitted -> committed-removed` (rollback of insert).
//! `committed-removed -> deleted` is the separate allocation-map
//! transition performed by GC once the root-lock count is zero.
//! Any other transition is corruption.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::blob::BlobStore;
use crate::common::{AreaId, CommitId, DbConfig, Error, Result, RowId, TableId, Value};
use crate::index::IndexSetStore;
use crate::lock::LockingQueue;
use crate::store::{lock_store_write, Store};
use crate::table::cell_cache::DataCellCache;
use crate::table::journal::TableJournal;
use crate::table::record_list::FixedRecordList;
use crate::table::rid_list::RidList;
use crate::table::row;
use crate::table::TableDefinition;

const TABLE_MAGIC: u32 = 0x7AB1_E001;
const TABLE_VERSION: u32 = 1;

/// Status bit marking a slot as allocated (not deleted).
const IN_USE: u32 = 0x8000_0000;
/// Mask of the row-state nibble.
const STATE_MASK: u32 = 0x0000_00F0;

const STATE_UNCOMMITTED: u32 = 0x00;
const STATE_COMMITTED_ADDED: u32 = 0x10;
const STATE_COMMITTED_REMOVED: u32 = 0x20;

/// Row-state tag of an allocated slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Uncommitted,
    CommittedAdded,
    CommittedRemoved,
}

impl RowState {
    fn to_bits(self) -> u32 {
        match self {
            RowState::Uncommitted => STATE_UNCOMMITTED,
            RowState::CommittedAdded => STATE_COMMITTED_ADDED,
            RowState::CommittedRemoved => STATE_COMMITTED_REMOVED,
        }
    }

    fn from_bits(status: u32) -> Result<RowState> {
        match status & STATE_MASK {
            STATE_UNCOMMITTED => Ok(RowState::Uncommitted),
            STATE_COMMITTED_ADDED => Ok(RowState::CommittedAdded),
            STATE_COMMITTED_REMOVED => Ok(RowState::CommittedRemoved),
            other => Err(Error::Corruption(format!(
                "impossible row state bits {:#x}",
                other
            ))),
        }
    }
}

struct MasterInner {
    records: FixedRecordList,
    /// Lazily built per-column sorting aids (blind columns).
    rid_lists: HashMap<usize, RidList>,
}

/// Per-table row allocator, row-state metadata, and cell accessor.
pub struct MasterTable {
    table_id: TableId,
    def: Arc<TableDefinition>,
    store: Arc<dyn Store>,
    blobs: Arc<BlobStore>,
    cache: Arc<DataCellCache>,
    config: Arc<DbConfig>,
    index_store: IndexSetStore,
    header_area: AreaId,
    def_area: AreaId,
    inner: Mutex<MasterInner>,
    root_locks: Mutex<usize>,
    root_cond: Condvar,
    /// Rows notified for GC (committed-removed, awaiting hard delete).
    garbage: Mutex<Vec<RowId>>,
    /// Committed journals in commit-id order.
    journals: Mutex<Vec<Arc<TableJournal>>>,
    queue: LockingQueue,
}

impl MasterTable {
    /// Create a fresh table.
    pub fn create(
        store: Arc<dyn Store>,
        blobs: Arc<BlobStore>,
        cache: Arc<DataCellCache>,
        config: Arc<DbConfig>,
        table_id: TableId,
        def: TableDefinition,
    ) -> Result<MasterTable> {
        let def = Arc::new(def);
        let serialized = def.serialize();
        let def_area = {
            let _guard = lock_store_write(store.as_ref());
            let mut w = store.create_area(serialized.len())?;
            w.write_bytes(&serialized);
            w.finish(store.as_ref())?
        };

        let records = FixedRecordList::create(Arc::clone(&store))?;
        let index_store = IndexSetStore::create(
            Arc::clone(&store),
            def.index_list_count(),
            config.index_block_size,
        )?;

        let header_area = {
            let _guard = lock_store_write(store.as_ref());
            let mut w = store.create_area(40)?;
            w.write_u32(TABLE_MAGIC);
            w.write_u32(TABLE_VERSION);
            w.write_u32(table_id.0);
            w.write_i64(def_area.0);
            w.write_i64(records.header_area().0);
            w.write_i64(index_store.start_area().0);
            w.finish(store.as_ref())?
        };

        Ok(MasterTable {
            table_id,
            def,
            store,
            blobs,
            cache,
            config,
            index_store,
            header_area,
            def_area,
            inner: Mutex::new(MasterInner {
                records,
                rid_lists: HashMap::new(),
            }),
            root_locks: Mutex::new(0),
            root_cond: Condvar::new(),
            garbage: Mutex::new(Vec::new()),
            journals: Mutex::new(Vec::new()),
            queue: LockingQueue::new(),
        })
    }

    /// Open an existing table from its header area, running the
    /// state/index cross-check scan.
    pub fn open(
        store: Arc<dyn Store>,
        blobs: Arc<BlobStore>,
        cache: Arc<DataCellCache>,
        config: Arc<DbConfig>,
        header_area: AreaId,
    ) -> Result<MasterTable> {
        let mut header = store.get_area(header_area)?;
        let magic = header.read_u32()?;
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic {:08x} at {}",
                magic, header_area
            )));
        }
        let version = header.read_u32()?;
        if version != TABLE_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported table version {}",
                version
            )));
        }
        let table_id = TableId::new(header.read_u32()?);
        let def_area = AreaId::new(header.read_i64()?);
        let records_header = AreaId::new(header.read_i64()?);
        let index_start = AreaId::new(header.read_i64()?);

        let def_bytes = store.get_area(def_area)?;
        let def = Arc::new(TableDefinition::deserialize(def_bytes.as_slice())?);
        let records = FixedRecordList::open(Arc::clone(&store), records_header)?;
        let index_store = IndexSetStore::open(Arc::clone(&store), index_start)?;

        let table = MasterTable {
            table_id,
            def,
            store,
            blobs,
            cache,
            config,
            index_store,
            header_area,
            def_area,
            inner: Mutex::new(MasterInner {
                records,
                rid_lists: HashMap::new(),
            }),
            root_locks: Mutex::new(0),
            root_cond: Condvar::new(),
            garbage: Mutex::new(Vec::new()),
            journals: Mutex::new(Vec::new()),
            queue: LockingQueue::new(),
        };
        table.open_scan()?;
        Ok(table)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn def(&self) -> &Arc<TableDefinition> {
        &self.def
    }

    pub fn index_store(&self) -> &IndexSetStore {
        &self.index_store
    }

    /// The table's session-level access queue.
    pub fn locking_queue(&self) -> &LockingQueue {
        &self.queue
    }

    /// The table header area id (recorded in the conglomerate state).
    pub fn header_area(&self) -> AreaId {
        self.header_area
    }

    // ========================================================================
    // Rows
    // ========================================================================

    /// Write a new row with state UNCOMMITTED, returning its row index.
    ///
    /// Updates the per-column RID lists but does *not* touch any index
    /// set; index maintenance belongs to the transaction's snapshot.
    pub fn add_row(&self, values: &[Value]) -> Result<RowId> {
        if values.len() != self.def.arity() {
            return Err(Error::Usage(format!(
                "row arity {} does not match table '{}' ({} columns)",
                values.len(),
                self.name(),
                self.def.arity()
            )));
        }
        for (i, value) in values.iter().enumerate() {
            let col = self.def.column(i);
            if !col.column_type.accepts(value) {
                return Err(Error::Usage(format!(
                    "column '{}' of type {:?} cannot store a {} value",
                    col.name,
                    col.column_type,
                    value.type_name()
                )));
            }
        }

        let record = row::encode_row(values, &self.blobs, &self.config)?;
        let area = {
            let _guard = lock_store_write(self.store.as_ref());
            let mut w = self.store.create_area(record.len())?;
            w.write_bytes(&record);
            w.finish(self.store.as_ref())?
        };

        let mut inner = self.inner.lock();
        let MasterInner { records, rid_lists } = &mut *inner;
        let slot = records.alloc()?;
        records.set(slot, IN_USE | STATE_UNCOMMITTED, area.0)?;
        let rid = RowId::new(slot as i64);

        for (&col, list) in rid_lists.iter_mut() {
            let target = values[col].clone();
            list.insert_with(rid, |other| {
                let other_value = cell_from_records(
                    records,
                    self.store.as_ref(),
                    &self.blobs,
                    &self.cache,
                    self.table_id,
                    RowId::new(other),
                    col,
                )?;
                Ok(other_value.storage_cmp(&target))
            })?;
        }
        Ok(rid)
    }

    /// Read one cell. The row must not have been hard-deleted.
    pub fn get_cell(&self, col: usize, rid: RowId) -> Result<Value> {
        let inner = self.inner.lock();
        cell_from_records(
            &inner.records,
            self.store.as_ref(),
            &self.blobs,
            &self.cache,
            self.table_id,
            rid,
            col,
        )
    }

    /// Read a whole row.
    pub fn get_row(&self, rid: RowId) -> Result<Vec<Value>> {
        let ptr = {
            let inner = self.inner.lock();
            let (status, ptr) = inner.records.get(rid.0 as u64)?;
            if status & IN_USE == 0 {
                return Err(Error::Corruption(format!(
                    "read of deleted row {} in table '{}'",
                    rid,
                    self.name()
                )));
            }
            ptr
        };
        let area = self.store.get_area(AreaId::new(ptr))?;
        row::decode_row(area.as_slice(), &self.blobs)
    }

    /// State of an allocated row slot.
    pub fn row_state(&self, rid: RowId) -> Result<RowState> {
        let inner = self.inner.lock();
        let (status, _) = inner.records.get(rid.0 as u64)?;
        if status & IN_USE == 0 {
            return Err(Error::Corruption(format!(
                "state of deleted row {} in table '{}'",
                rid,
                self.name()
            )));
        }
        RowState::from_bits(status)
    }

    /// Move a row's state nibble, asserting the expected prior state.
    ///
    /// Returns the old state. A transition outside the state machine is
    /// corruption: the conglomerate must stop accepting writes.
    pub fn write_record_state(&self, rid: RowId, new_state: RowState) -> Result<RowState> {
        let mut inner = self.inner.lock();
        let (status, _ptr) = inner.records.get(rid.0 as u64)?;
        if status & IN_USE == 0 {
            return Err(Error::Corruption(format!(
                "state write to deleted row {} in table '{}'",
                rid,
                self.name()
            )));
        }
        let old = RowState::from_bits(status)?;
        let legal = matches!(
            (old, new_state),
            (RowState::Uncommitted, RowState::CommittedAdded)
                | (RowState::CommittedAdded, RowState::CommittedRemoved)
                | (RowState::Uncommitted, RowState::CommittedRemoved)
        );
        if !legal {
            return Err(Error::Corruption(format!(
                "illegal row state transition {:?} -> {:?} for {} in table '{}'",
                old,
                new_state,
                rid,
                self.name()
            )));
        }
        let new_status = (status & !STATE_MASK) | new_state.to_bits();
        inner.records.set_status(rid.0 as u64, new_status)?;
        Ok(old)
    }

    /// Rows in column-value order for a blind column, built lazily and
    /// maintained by `add_row`.
    pub fn rid_order(&self, col: usize) -> Result<Vec<i64>> {
        let mut inner = self.inner.lock();
        if !inner.rid_lists.contains_key(&col) {
            let mut list = RidList::new();
            let used = inner.records.used();
            let MasterInner { records, .. } = &mut *inner;
            for slot in 0..used {
                let (status, _) = records.get(slot)?;
                if status & IN_USE == 0 {
                    continue;
                }
                let rid = RowId::new(slot as i64);
                let target = cell_from_records(
                    records,
                    self.store.as_ref(),
                    &self.blobs,
                    &self.cache,
                    self.table_id,
                    rid,
                    col,
                )?;
                list.insert_with(rid, |other| {
                    let other_value = cell_from_records(
                        records,
                        self.store.as_ref(),
                        &self.blobs,
                        &self.cache,
                        self.table_id,
                        RowId::new(other),
                        col,
                    )?;
                    Ok(other_value.storage_cmp(&target))
                })?;
            }
            inner.rid_lists.insert(col, list);
        }
        Ok(inner.rid_lists[&col].rows().to_vec())
    }

    // ========================================================================
    // Root locks and garbage collection
    // ========================================================================

    /// Pin the table against GC of COMMITTED_REMOVED rows.
    pub fn add_root_lock(&self) {
        *self.root_locks.lock() += 1;
    }

    /// Release one root lock; the last release runs pending GC.
    pub fn remove_root_lock(&self) {
        let run_gc = {
            let mut count = self.root_locks.lock();
            assert!(*count > 0, "root lock count underflow");
            *count -= 1;
            *count == 0
        };
        self.root_cond.notify_all();
        if run_gc {
            if let Err(e) = self.collect_garbage() {
                error!("garbage collection failed on table '{}': {}", self.name(), e);
            }
        }
    }

    pub fn root_lock_count(&self) -> usize {
        *self.root_locks.lock()
    }

    /// Block until no snapshot pins this table (DROP TABLE path).
    pub fn wait_for_no_root_locks(&self) {
        let mut count = self.root_locks.lock();
        while *count > 0 {
            self.root_cond.wait(&mut count);
        }
    }

    /// Queue a committed-removed row for hard deletion.
    pub fn notify_garbage(&self, rid: RowId) {
        self.garbage.lock().push(rid);
    }

    /// Hard-delete queued rows. Must only run with zero root locks.
    fn collect_garbage(&self) -> Result<()> {
        let pending: Vec<RowId> = std::mem::take(&mut *self.garbage.lock());
        if pending.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(self.root_lock_count(), 0);
        let mut reclaimed = 0usize;
        let mut inner = self.inner.lock();
        for rid in pending {
            let (status, ptr) = inner.records.get(rid.0 as u64)?;
            if status & IN_USE == 0 {
                continue; // already reclaimed
            }
            if RowState::from_bits(status)? != RowState::CommittedRemoved {
                error!(
                    "GC notified for {} in '{}' but state is {:?}; leaving it",
                    rid,
                    self.name(),
                    RowState::from_bits(status)?
                );
                continue;
            }
            self.hard_delete_locked(&mut inner, rid, ptr)?;
            reclaimed += 1;
        }
        if reclaimed > 0 {
            debug!("reclaimed {} rows in table '{}'", reclaimed, self.name());
        }
        Ok(())
    }

    fn hard_delete_locked(&self, inner: &mut MasterInner, rid: RowId, ptr: i64) -> Result<()> {
        let area = self.store.get_area(AreaId::new(ptr))?;
        let refs = row::blob_refs(area.as_slice())?;
        let _guard = lock_store_write(self.store.as_ref());
        // Free the slot before its areas: a checkpoint torn between the
        // two can only leak space, never leave a live slot pointing at
        // freed areas.
        inner.records.free(rid.0 as u64)?;
        for r in refs {
            self.blobs.free(&r)?;
        }
        self.store.delete_area(AreaId::new(ptr))?;
        self.cache.remove_row(self.table_id, rid, self.def.arity());
        for list in inner.rid_lists.values_mut() {
            list.remove(rid);
        }
        Ok(())
    }

    // ========================================================================
    // Committed journal list
    // ========================================================================

    /// Append a committed journal. Journals arrive in commit-id order.
    pub fn append_journal(&self, journal: Arc<TableJournal>) {
        let commit_id = journal.commit_id().expect("journal has its commit id");
        let mut journals = self.journals.lock();
        if let Some(last) = journals.last() {
            assert!(
                last.commit_id().unwrap() < commit_id,
                "journals must be appended in commit order"
            );
        }
        journals.push(journal);
    }

    /// Every committed journal with `commit_id >= since`, in order.
    pub fn journals_since(&self, since: CommitId) -> Vec<Arc<TableJournal>> {
        self.journals
            .lock()
            .iter()
            .filter(|j| j.commit_id().unwrap() >= since)
            .cloned()
            .collect()
    }

    /// Discard journals no open transaction can still need.
    pub fn discard_journals_before(&self, min_start: CommitId) {
        let mut journals = self.journals.lock();
        journals.retain(|j| j.commit_id().unwrap() >= min_start);
    }

    // ========================================================================
    // Opening scan
    // ========================================================================

    /// Cross-check every row slot against the persisted master index and
    /// repair discrepancies. All repairs are logged.
    fn open_scan(&self) -> Result<()> {
        let snapshot = self.index_store.snapshot();
        let indexed: HashSet<i64> = snapshot.list(0).to_vec()?.into_iter().collect();
        self.index_store.release_snapshot(snapshot)?;

        let mut inner = self.inner.lock();
        let used = inner.records.used();
        for slot in 0..used {
            let (status, ptr) = inner.records.get(slot)?;
            let rid = slot as i64;
            let is_indexed = indexed.contains(&rid);

            if status & IN_USE == 0 {
                if is_indexed {
                    warn!(
                        "open scan: row {} of '{}' deleted but indexed; rewriting to committed-added",
                        rid,
                        self.name()
                    );
                    inner.records.mark_used(slot, IN_USE | STATE_COMMITTED_ADDED, ptr)?;
                }
                continue;
            }

            match RowState::from_bits(status)? {
                RowState::CommittedAdded if !is_indexed => {
                    warn!(
                        "open scan: row {} of '{}' committed-added but not indexed; rewriting to committed-removed",
                        rid,
                        self.name()
                    );
                    inner
                        .records
                        .set_status(slot, (status & !STATE_MASK) | STATE_COMMITTED_REMOVED)?;
                    self.garbage.lock().push(RowId::new(rid));
                }
                RowState::CommittedRemoved | RowState::Uncommitted if is_indexed => {
                    warn!(
                        "open scan: row {} of '{}' state {:#x} but indexed; rewriting to committed-added",
                        rid,
                        self.name(),
                        status & STATE_MASK
                    );
                    inner
                        .records
                        .set_status(slot, (status & !STATE_MASK) | STATE_COMMITTED_ADDED)?;
                }
                RowState::Uncommitted => {
                    // An insert whose transaction never finished.
                    warn!(
                        "open scan: rolling back uncommitted row {} of '{}'",
                        rid,
                        self.name()
                    );
                    inner
                        .records
                        .set_status(slot, (status & !STATE_MASK) | STATE_COMMITTED_REMOVED)?;
                    self.garbage.lock().push(RowId::new(rid));
                }
                RowState::CommittedRemoved => {
                    // Pending GC from before shutdown.
                    self.garbage.lock().push(RowId::new(rid));
                }
                RowState::CommittedAdded => {}
            }
        }
        drop(inner);

        if self.root_lock_count() == 0 {
            self.collect_garbage()?;
        }
        Ok(())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Rewrite every live row area (COMPACT TABLE). The caller holds the
    /// table's write lock on the session queue.
    pub fn compact(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let _guard = lock_store_write(self.store.as_ref());
        let used = inner.records.used();
        let mut moved = 0usize;
        for slot in 0..used {
            let (status, ptr) = inner.records.get(slot)?;
            if status & IN_USE == 0 {
                continue;
            }
            let area = self.store.get_area(AreaId::new(ptr))?;
            let bytes = area.as_slice().to_vec();
            let mut w = self.store.create_area(bytes.len())?;
            w.write_bytes(&bytes);
            let new_area = w.finish(self.store.as_ref())?;
            inner.records.set(slot, status, new_area.0)?;
            self.store.delete_area(AreaId::new(ptr))?;
            moved += 1;
        }
        debug!("compacted {} rows in table '{}'", moved, self.name());
        Ok(moved)
    }

    /// Free every area owned by this table (DROP TABLE). The caller has
    /// already waited for the root-lock count to reach zero.
    pub fn drop_contents(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let _guard = lock_store_write(self.store.as_ref());
        let used = inner.records.used();
        for slot in 0..used {
            let (status, ptr) = inner.records.get(slot)?;
            if status & IN_USE == 0 {
                continue;
            }
            let area = self.store.get_area(AreaId::new(ptr))?;
            for r in row::blob_refs(area.as_slice())? {
                self.blobs.free(&r)?;
            }
            self.store.delete_area(AreaId::new(ptr))?;
        }
        for area in inner.records.all_areas() {
            self.store.delete_area(area)?;
        }
        self.index_store.free_all()?;
        self.store.delete_area(self.def_area)?;
        self.store.delete_area(self.header_area)?;
        self.cache.clear_table(self.table_id);
        inner.rid_lists.clear();
        Ok(())
    }
}

/// Shared cell fetch used with the inner lock held.
fn cell_from_records(
    records: &FixedRecordList,
    store: &dyn Store,
    blobs: &BlobStore,
    cache: &DataCellCache,
    table_id: TableId,
    rid: RowId,
    col: usize,
) -> Result<Value> {
    if let Some(hit) = cache.get(table_id, rid, col as u32) {
        return Ok(hit);
    }
    let (status, ptr) = records.get(rid.0 as u64)?;
    if status & IN_USE == 0 {
        return Err(Error::Corruption(format!(
            "cell read of deleted row {}",
            rid
        )));
    }
    let area = store.get_area(AreaId::new(ptr))?;
    let value = row::decode_cell(area.as_slice(), col, blobs)?;
    cache.put(table_id, rid, col as u32, &value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ValueType;
    use crate::table::definition::ColumnDefinition;
    use crate::table::mutable::index_insert_row;

    fn fixtures() -> (Arc<dyn Store>, Arc<BlobStore>, Arc<DataCellCache>, Arc<DbConfig>) {
        let store: Arc<dyn Store> = Arc::new(crate::store::HeapStore::new());
        let blobs = Arc::new(BlobStore::new(Arc::clone(&store)));
        let cache = Arc::new(DataCellCache::new(1 << 20, 8192));
        let config = Arc::new(DbConfig::heap());
        (store, blobs, cache, config)
    }

    fn person_def() -> TableDefinition {
        TableDefinition::new(
            "person",
            vec![
                ColumnDefinition::new("id", ValueType::Integer).sorted_index(),
                ColumnDefinition::new("name", ValueType::Text),
            ],
        )
        .unwrap()
    }

    fn new_table() -> MasterTable {
        let (store, blobs, cache, config) = fixtures();
        MasterTable::create(store, blobs, cache, config, TableId::new(1), person_def()).unwrap()
    }

    #[test]
    fn test_add_row_and_read_cells() {
        let table = new_table();
        let rid = table
            .add_row(&[Value::Integer(1), Value::Text("a".into())])
            .unwrap();
        assert_eq!(table.get_cell(0, rid).unwrap(), Value::Integer(1));
        assert_eq!(table.get_cell(1, rid).unwrap(), Value::Text("a".into()));
        assert_eq!(table.row_state(rid).unwrap(), RowState::Uncommitted);
        assert_eq!(
            table.get_row(rid).unwrap(),
            vec![Value::Integer(1), Value::Text("a".into())]
        );
    }

    #[test]
    fn test_arity_and_type_checked() {
        let table = new_table();
        assert!(table.add_row(&[Value::Integer(1)]).is_err());
        assert!(table
            .add_row(&[Value::Text("x".into()), Value::Text("a".into())])
            .is_err());
    }

    #[test]
    fn test_state_machine() {
        let table = new_table();
        let rid = table
            .add_row(&[Value::Integer(1), Value::Text("a".into())])
            .unwrap();

        let old = table
            .write_record_state(rid, RowState::CommittedAdded)
            .unwrap();
        assert_eq!(old, RowState::Uncommitted);
        let old = table
            .write_record_state(rid, RowState::CommittedRemoved)
            .unwrap();
        assert_eq!(old, RowState::CommittedAdded);

        // Removed -> added is outside the machine.
        let err = table.write_record_state(rid, RowState::CommittedAdded);
        assert!(matches!(err, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_gc_requires_zero_root_locks() {
        let table = new_table();
        let rid = table
            .add_row(&[Value::Integer(1), Value::Text("a".into())])
            .unwrap();
        table.write_record_state(rid, RowState::CommittedAdded).unwrap();
        table.add_root_lock();
        table.write_record_state(rid, RowState::CommittedRemoved).unwrap();
        table.notify_garbage(rid);

        // Pinned: the row survives.
        assert_eq!(table.row_state(rid).unwrap(), RowState::CommittedRemoved);
        table.remove_root_lock();
        // Unpinned: the slot is reclaimed.
        assert!(table.row_state(rid).is_err());
    }

    #[test]
    fn test_journal_retention_order() {
        let table = new_table();
        for id in [2u64, 5, 9] {
            let mut j = TableJournal::new(table.table_id());
            j.set_commit_id(CommitId::new(id)).unwrap();
            table.append_journal(Arc::new(j));
        }
        let since = table.journals_since(CommitId::new(5));
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].commit_id().unwrap(), CommitId::new(5));
        assert_eq!(since[1].commit_id().unwrap(), CommitId::new(9));

        table.discard_journals_before(CommitId::new(6));
        assert_eq!(table.journals_since(CommitId::new(0)).len(), 1);
    }

    #[test]
    fn test_open_scan_repairs() {
        let (store, blobs, cache, config) = fixtures();
        let header = {
            let table = MasterTable::create(
                Arc::clone(&store),
                Arc::clone(&blobs),
                Arc::clone(&cache),
                Arc::clone(&config),
                TableId::new(1),
                person_def(),
            )
            .unwrap();
            // Row 0: properly committed and indexed.
            let r0 = table
                .add_row(&[Value::Integer(1), Value::Text("a".into())])
                .unwrap();
            table.write_record_state(r0, RowState::CommittedAdded).unwrap();
            let mut set = table.index_store().snapshot();
            index_insert_row(&table, &mut set, r0).unwrap();
            table.index_store().commit(set).unwrap();
            // Row 1: state says committed-added but never indexed (torn commit).
            let r1 = table
                .add_row(&[Value::Integer(2), Value::Text("b".into())])
                .unwrap();
            table.write_record_state(r1, RowState::CommittedAdded).unwrap();
            table.header_area()
        };

        let table = MasterTable::open(store, blobs, cache, config, header).unwrap();
        // The torn row was demoted and reclaimed; the good row survives.
        assert_eq!(table.row_state(RowId::new(0)).unwrap(), RowState::CommittedAdded);
        assert!(table.row_state(RowId::new(1)).is_err());
    }

    #[test]
    fn test_compact_preserves_rows() {
        let table = new_table();
        let rid = table
            .add_row(&[Value::Integer(7), Value::Text("keep".into())])
            .unwrap();
        table.cache.remove_row(table.table_id(), rid, 2);
        assert_eq!(table.compact().unwrap(), 1);
        table.cache.remove_row(table.table_id(), rid, 2);
        assert_eq!(table.get_cell(1, rid).unwrap(), Value::Text("keep".into()));
    }

    #[test]
    fn test_rid_order() {
        let table = new_table();
        for (id, name) in [(1, "zeta"), (2, "alpha"), (3, "mid")] {
            table
                .add_row(&[Value::Integer(id), Value::Text(name.into())])
                .unwrap();
        }
        // Column 1 (name) is blind; RID order mirrors value order.
        assert_eq!(table.rid_order(1).unwrap(), vec![1, 2, 0]);
        // New rows keep the list current.
        table
            .add_row(&[Value::Integer(4), Value::Text("beta".into())])
            .unwrap();
        assert_eq!(table.rid_order(1).unwrap(), vec![1, 3, 2, 0]);
    }
}
