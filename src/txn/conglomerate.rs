//! The table conglomerate: the set of master tables backed by one store
//! plus the global commit machinery.
//!
//! The conglomerate owns the commit counter, the open-transactions list,
//! and the persistent *state area* (version tag plus table roster)
//! published through fixed slot 0 of the store header. Commit validation
//! and publication run under the single commit lock; the journal merge
//! rebuilds each transaction's changes onto a fresh index snapshot so
//! publication never tears concurrently committed state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::blob::BlobStore;
use crate::common::{
    AreaId, CommitId, DbConfig, Error, Result, RowId, StorageSystem, TableId, Value, ValueType,
};
use crate::expr::{Expression, FunctionRegistry, Operator};
use crate::index::IndexSet;
use crate::lock::{CancelToken, LockType};
use crate::store::{lock_store_write, FileStore, HeapStore, Store, STATE_SLOT};
use crate::table::cell_cache::DataCellCache;
use crate::table::{
    index_insert_row, index_remove_row, ColumnDefinition, MasterTable, MutableTable, RowState,
    TableDefinition, TableJournal,
};
use crate::txn::constraints::{self, CommitTable, WorkMap};
use crate::txn::Transaction;

/// The one accepted `database.version` literal.
pub const DATABASE_VERSION: &str = "1.4";

/// Name of the system variables table.
pub const DATABASE_VARS_TABLE: &str = "DatabaseVars";

const STATE_MAGIC: u32 = 0xC091_07DB;
const STATE_VERSION: u32 = 1;

struct CommitState {
    current_commit_id: CommitId,
}

struct TableRegistry {
    by_id: HashMap<u32, Arc<MasterTable>>,
    /// Folded name -> table id.
    by_name: HashMap<String, u32>,
    next_table_id: u32,
    state_area: AreaId,
}

struct OpenTransactions {
    next_txn_id: u64,
    /// (transaction id, start commit id).
    open: Vec<(u64, CommitId)>,
}

/// Owner of all master tables and the commit machinery.
pub struct Conglomerate {
    store: Arc<dyn Store>,
    blobs: Arc<BlobStore>,
    cache: Arc<DataCellCache>,
    config: Arc<DbConfig>,
    registry: Arc<FunctionRegistry>,
    /// The conglomerate commit lock.
    commit: Mutex<CommitState>,
    tables: RwLock<TableRegistry>,
    txns: Mutex<OpenTransactions>,
    /// Back-reference handed to transactions.
    self_ref: Weak<Conglomerate>,
}

impl Conglomerate {
    // ========================================================================
    // Creation / opening
    // ========================================================================

    fn build_store(config: &DbConfig, create: bool) -> Result<Arc<dyn Store>> {
        Ok(match config.storage_system {
            StorageSystem::HeapOnly => Arc::new(HeapStore::new()),
            StorageSystem::FileBacked => {
                if create {
                    Arc::new(FileStore::create(config)?)
                } else {
                    Arc::new(FileStore::open(config)?)
                }
            }
        })
    }

    fn assemble(store: Arc<dyn Store>, config: DbConfig, state_area: AreaId) -> Arc<Conglomerate> {
        let config = Arc::new(config);
        let blobs = Arc::new(BlobStore::new(Arc::clone(&store)));
        let cache = Arc::new(DataCellCache::new(
            config.data_cache_size,
            config.max_cache_entry_size,
        ));
        Arc::new_cyclic(|self_ref| Conglomerate {
            store,
            blobs,
            cache,
            config,
            registry: Arc::new(FunctionRegistry::with_builtins()),
            commit: Mutex::new(CommitState {
                current_commit_id: CommitId::new(1),
            }),
            tables: RwLock::new(TableRegistry {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                next_table_id: 1,
                state_area,
            }),
            txns: Mutex::new(OpenTransactions {
                next_txn_id: 1,
                open: Vec::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Create a fresh conglomerate (and its `DatabaseVars` table).
    pub fn create(config: DbConfig) -> Result<Arc<Conglomerate>> {
        config.validate()?;
        if config.read_only {
            return Err(Error::ReadOnly);
        }
        let store = Self::build_store(&config, true)?;
        let cong = Self::assemble(store, config, AreaId::NULL);
        cong.persist_state()?;

        let vars_def = TableDefinition::new(
            DATABASE_VARS_TABLE,
            vec![
                ColumnDefinition::new("var", ValueType::Text).not_null().sorted_index(),
                ColumnDefinition::new("value", ValueType::Text).not_null(),
            ],
        )?;
        cong.create_table(vars_def)?;

        let mut txn = cong.begin();
        txn.insert(
            DATABASE_VARS_TABLE,
            &[
                Value::Text("database.version".into()),
                Value::Text(DATABASE_VERSION.into()),
            ],
        )?;
        txn.commit()?;
        info!("created conglomerate, database version {}", DATABASE_VERSION);
        Ok(cong)
    }

    /// Open an existing conglomerate, verifying the version tag.
    pub fn open(config: DbConfig) -> Result<Arc<Conglomerate>> {
        config.validate()?;
        let store = Self::build_store(&config, false)?;
        let state_area = store.get_fixed_slot(STATE_SLOT)?;
        if state_area.is_null() {
            return Err(Error::Corruption("missing conglomerate state area".into()));
        }

        let mut state = store.get_area(state_area)?;
        let magic = state.read_u32()?;
        if magic != STATE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad conglomerate state magic {:08x}",
                magic
            )));
        }
        let version = state.read_u32()?;
        if version != STATE_VERSION {
            // Legacy formats are refused, never migrated.
            return Err(Error::VersionMismatch {
                found: format!("state format {}", version),
                expected: format!("state format {}", STATE_VERSION),
            });
        }
        let next_table_id = state.read_u32()?;
        let table_count = state.read_u32()? as usize;
        let mut roster = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            let table_id = state.read_u32()?;
            let name = state.read_string()?;
            let header = AreaId::new(state.read_i64()?);
            roster.push((table_id, name, header));
        }

        let cong = Self::assemble(store, config, state_area);
        {
            let mut tables = cong.tables.write();
            tables.next_table_id = next_table_id;
            for (table_id, name, header) in roster {
                let master = Arc::new(MasterTable::open(
                    Arc::clone(&cong.store),
                    Arc::clone(&cong.blobs),
                    Arc::clone(&cong.cache),
                    Arc::clone(&cong.config),
                    header,
                )?);
                debug!("opened table '{}' ({})", name, master.table_id());
                let folded = cong.config.fold_identifier(&name);
                tables.by_name.insert(folded, table_id);
                tables.by_id.insert(table_id, master);
            }
        }
        cong.check_database_version()?;
        Ok(cong)
    }

    /// Compare the persisted `database.version` row against the accepted
    /// literal.
    fn check_database_version(&self) -> Result<()> {
        let mut txn = self.begin();
        let predicate = Expression::binary(
            Expression::var("var"),
            Operator::Eq,
            Expression::literal(Value::Text("database.version".into())),
        );
        let rows = txn.select(DATABASE_VARS_TABLE, Some(&predicate))?;
        let found = match rows.first() {
            Some(rid) => match txn.get_cell(DATABASE_VARS_TABLE, 1, *rid)? {
                Value::Text(s) => s,
                other => {
                    return Err(Error::Corruption(format!(
                        "database.version is {}",
                        other.type_name()
                    )))
                }
            },
            None => String::new(),
        };
        txn.rollback();
        if found != DATABASE_VERSION {
            return Err(Error::VersionMismatch {
                found,
                expected: DATABASE_VERSION.into(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &Arc<DbConfig> {
        &self.config
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Look up a table by (possibly case-folded) name.
    pub fn table_by_name(&self, name: &str) -> Result<Arc<MasterTable>> {
        let folded = self.config.fold_identifier(name);
        let tables = self.tables.read();
        let id = tables
            .by_name
            .get(&folded)
            .ok_or_else(|| Error::Usage(format!("no such table '{}'", name)))?;
        Ok(Arc::clone(&tables.by_id[id]))
    }

    /// All table names, unordered.
    pub fn table_names(&self) -> Vec<String> {
        self.tables
            .read()
            .by_id
            .values()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Masters whose definitions declare a foreign key referencing
    /// `table` (used by referential-action checks).
    pub(crate) fn referencing_tables(&self, table: &str) -> Vec<Arc<MasterTable>> {
        let folded = self.config.fold_identifier(table);
        self.tables
            .read()
            .by_id
            .values()
            .filter(|m| {
                m.def().foreign_keys().any(|fk| {
                    matches!(fk, crate::table::Constraint::ForeignKey { ref_table, .. }
                        if self.config.fold_identifier(ref_table) == folded)
                })
            })
            .cloned()
            .collect()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a snapshot transaction.
    pub fn begin(&self) -> Transaction {
        let cong = self.self_ref.upgrade().expect("conglomerate is alive");
        let start_commit_id = self.commit.lock().current_commit_id;
        let txn_id = {
            let mut txns = self.txns.lock();
            let id = txns.next_txn_id;
            txns.next_txn_id += 1;
            txns.open.push((id, start_commit_id));
            id
        };
        Transaction::new(cong, txn_id, start_commit_id)
    }

    /// Commit a transaction's table views: validation, constraint
    /// checks, then atomic publication. On any failure the transaction
    /// is fully rolled back. Either way, snapshots and root locks are
    /// released and retired journals discarded.
    pub(crate) fn commit_transaction(
        &self,
        txn_id: u64,
        start_commit_id: CommitId,
        tables: Vec<MutableTable>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        struct Part {
            master: Arc<MasterTable>,
            read_set: Option<IndexSet>,
            journal: Option<TableJournal>,
            selected: bool,
        }

        let mut parts: Vec<Part> = tables
            .into_iter()
            .map(|t| {
                let (master, set, journal, selected) = t.into_parts();
                Part {
                    master,
                    read_set: Some(set),
                    journal: Some(journal),
                    selected,
                }
            })
            .collect();

        let mut work: WorkMap = HashMap::new();
        let outcome = (|| -> Result<()> {
            let mut commit_state = self.commit.lock();
            let has_writes = parts
                .iter()
                .any(|p| p.journal.as_ref().unwrap().has_modifications());
            if !has_writes {
                // Nothing to publish; a pure-read commit cannot conflict.
                return Ok(());
            }
            if self.config.read_only {
                return Err(Error::ReadOnly);
            }

            // Validation against journals committed since this
            // transaction's snapshot.
            let since = start_commit_id.next();
            for part in &parts {
                let interleaved = part.master.journals_since(since);
                if interleaved.is_empty() {
                    continue;
                }
                let modified = interleaved.iter().any(|j| j.has_modifications());
                if part.selected && modified && self.config.transaction_error_on_dirty_select {
                    return Err(Error::TransactionConflict(format!(
                        "table '{}' was modified by a concurrent commit",
                        part.master.name()
                    )));
                }
                let mine: HashSet<i64> = part
                    .journal
                    .as_ref()
                    .unwrap()
                    .removed_rows()
                    .iter()
                    .map(|r| r.0)
                    .collect();
                if mine.is_empty() {
                    continue;
                }
                for journal in &interleaved {
                    for removed in journal.removed_rows() {
                        if mine.contains(&removed.0) {
                            return Err(Error::RowConflict {
                                table: part.master.name().to_string(),
                                row: removed.0,
                            });
                        }
                    }
                }
            }
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }

            // Journal merge: rebuild each journal onto a fresh snapshot
            // of the *current* published state, so publication carries
            // concurrent commits forward.
            for part in &mut parts {
                let journal = part.journal.take().unwrap();
                if !journal.has_modifications() {
                    part.journal = Some(journal);
                    continue;
                }
                let mut set = part.master.index_store().snapshot();
                for entry in journal.entries() {
                    if entry.op.is_add() {
                        index_insert_row(&part.master, &mut set, entry.row)?;
                    } else {
                        index_remove_row(&part.master, &mut set, entry.row)?;
                    }
                }
                work.insert(
                    part.master.table_id().0,
                    CommitTable {
                        master: Arc::clone(&part.master),
                        set,
                        journal,
                        checked: 0,
                    },
                );
            }

            // Field, unique, and referential checks; referential actions
            // may pull further tables into the work map.
            constraints::check_and_apply(self, &mut work, &self.registry)?;

            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }

            // Point of no return: publish.
            let commit_id = commit_state.current_commit_id.next();
            commit_state.current_commit_id = commit_id;
            for table in work.values_mut() {
                if table.journal.is_empty() {
                    continue; // pulled in for FK lookups only
                }
                table.journal.set_commit_id(commit_id)?;
                for entry in table.journal.entries() {
                    if entry.op.is_add() {
                        table
                            .master
                            .write_record_state(entry.row, RowState::CommittedAdded)?;
                    } else {
                        table
                            .master
                            .write_record_state(entry.row, RowState::CommittedRemoved)?;
                        table.master.notify_garbage(entry.row);
                    }
                }
            }
            for (_, table) in std::mem::take(&mut work) {
                if table.journal.is_empty() {
                    table.master.index_store().release_snapshot(table.set)?;
                    continue;
                }
                table.master.index_store().commit(table.set)?;
                table.master.append_journal(Arc::new(table.journal));
            }
            self.store.checkpoint(self.config.sync_on_commit())?;
            debug!("transaction {} committed as {}", txn_id, commit_id);
            Ok(())
        })();

        if outcome.is_err() {
            // Roll back adds still parked in the parts...
            for part in &parts {
                if let Some(journal) = &part.journal {
                    rollback_journal(&part.master, journal);
                }
            }
            // ...and everything the work map accumulated (including
            // referential-action rows), releasing its snapshots.
            for (_, table) in work.drain() {
                rollback_journal(&table.master, &table.journal);
                if let Err(e) = table.master.index_store().release_snapshot(table.set) {
                    warn!("failed to release a working snapshot: {}", e);
                }
            }
        }

        for part in &mut parts {
            if let Some(set) = part.read_set.take() {
                if let Err(e) = part.master.index_store().release_snapshot(set) {
                    warn!("failed to release a read snapshot: {}", e);
                }
            }
            part.master.remove_root_lock();
        }
        self.close_transaction(txn_id);
        outcome
    }

    /// Roll back a transaction: inserted rows become committed-removed
    /// (logically never existed) and are handed to GC.
    pub(crate) fn rollback_transaction(&self, txn_id: u64, tables: Vec<MutableTable>) {
        for table in tables {
            let (master, set, journal, _) = table.into_parts();
            rollback_journal(&master, &journal);
            if let Err(e) = master.index_store().release_snapshot(set) {
                warn!("failed to release a read snapshot: {}", e);
            }
            master.remove_root_lock();
        }
        self.close_transaction(txn_id);
    }

    /// Drop a transaction from the open list and retire journals no
    /// open transaction can still need (invariant: a journal with commit
    /// id c is kept until every open transaction started at or past c).
    fn close_transaction(&self, txn_id: u64) {
        let min_start = {
            let mut txns = self.txns.lock();
            txns.open.retain(|(id, _)| *id != txn_id);
            txns.open.iter().map(|(_, start)| *start).min()
        };
        let horizon = match min_start {
            Some(start) => start,
            None => self.commit.lock().current_commit_id,
        };
        for master in self.tables.read().by_id.values() {
            master.discard_journals_before(horizon.next());
        }
    }

    // ========================================================================
    // DDL
    // ========================================================================

    /// Create a table from a definition.
    pub fn create_table(&self, def: TableDefinition) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let folded = self.config.fold_identifier(def.name());
        let mut tables = self.tables.write();
        if tables.by_name.contains_key(&folded) {
            return Err(Error::Usage(format!(
                "table '{}' already exists",
                def.name()
            )));
        }
        let table_id = TableId::new(tables.next_table_id);
        tables.next_table_id += 1;
        let master = Arc::new(MasterTable::create(
            Arc::clone(&self.store),
            Arc::clone(&self.blobs),
            Arc::clone(&self.cache),
            Arc::clone(&self.config),
            table_id,
            def,
        )?);
        info!("created table '{}' ({})", master.name(), table_id);
        tables.by_name.insert(folded, table_id.0);
        tables.by_id.insert(table_id.0, master);
        drop(tables);
        self.persist_state()
    }

    /// Drop a table: waits for its root-lock count to reach zero, then
    /// frees every area it owns.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let master = self.table_by_name(name)?;
        // Unregister first so no new snapshot can pin it.
        {
            let folded = self.config.fold_identifier(name);
            let mut tables = self.tables.write();
            tables.by_name.remove(&folded);
            tables.by_id.remove(&master.table_id().0);
        }
        master.wait_for_no_root_locks();
        master.drop_contents()?;
        info!("dropped table '{}'", name);
        self.persist_state()
    }

    /// Rewrite a table's row areas (COMPACT TABLE). Takes the table's
    /// session write lock so no session reads a half-moved table.
    pub fn compact_table(&self, name: &str) -> Result<usize> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let master = self.table_by_name(name)?;
        let _lock = master.locking_queue().lock_write(None)?;
        let moved = master.compact()?;
        self.store.checkpoint(self.config.sync_on_commit())?;
        Ok(moved)
    }

    /// Replace a table's definition: builds a new master table, copies
    /// the committed rows across, swaps the roster entry, and frees the
    /// old table.
    pub fn alter_table(&self, name: &str, new_def: TableDefinition) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let old = self.table_by_name(name)?;
        // Sessions serialize DDL through the table's queue; the write
        // lock excludes sessions that route their access through it.
        let _session_lock = old.locking_queue().lock_write(None)?;
        // Hold the commit lock across copy and swap: no commit may slip
        // in mid-rewrite.
        let commit_guard = self.commit.lock();

        let new_id = {
            let mut tables = self.tables.write();
            let id = TableId::new(tables.next_table_id);
            tables.next_table_id += 1;
            id
        };
        let new_master = Arc::new(MasterTable::create(
            Arc::clone(&self.store),
            Arc::clone(&self.blobs),
            Arc::clone(&self.cache),
            Arc::clone(&self.config),
            new_id,
            new_def,
        )?);

        // Logical rewrite of the committed rows.
        let snapshot = old.index_store().snapshot();
        let mut new_set = new_master.index_store().snapshot();
        let copy = (|| -> Result<()> {
            for row in snapshot.list(0).to_vec()? {
                let values = old.get_row(RowId::new(row))?;
                let new_rid = new_master.add_row(&values)?;
                new_master.write_record_state(new_rid, RowState::CommittedAdded)?;
                index_insert_row(&new_master, &mut new_set, new_rid)?;
            }
            Ok(())
        })();
        old.index_store().release_snapshot(snapshot)?;
        copy?;
        new_master.index_store().commit(new_set)?;

        // Swap the roster entry; the old table dies once unpinned.
        {
            let folded = self.config.fold_identifier(name);
            let new_folded = self.config.fold_identifier(new_master.name());
            let mut tables = self.tables.write();
            tables.by_name.remove(&folded);
            tables.by_id.remove(&old.table_id().0);
            tables.by_name.insert(new_folded, new_id.0);
            tables.by_id.insert(new_id.0, new_master);
        }
        // Release the commit lock before waiting: pinning transactions
        // need it to finish.
        drop(commit_guard);
        old.wait_for_no_root_locks();
        old.drop_contents()?;
        info!("altered table '{}'", name);
        self.persist_state()
    }

    /// Rebuild a column's index preference via the alter path.
    pub fn add_column_index(&self, table: &str, column: &str) -> Result<()> {
        self.change_index(table, column, true)
    }

    /// Remove a column's sorted index via the alter path.
    pub fn drop_column_index(&self, table: &str, column: &str) -> Result<()> {
        self.change_index(table, column, false)
    }

    fn change_index(&self, table: &str, column: &str, sorted: bool) -> Result<()> {
        let master = self.table_by_name(table)?;
        let def = master.def();
        let col = def
            .column_index(column)
            .ok_or_else(|| Error::Usage(format!("no column '{}' in '{}'", column, table)))?;
        let mut columns: Vec<ColumnDefinition> = def.columns().to_vec();
        columns[col].index = if sorted {
            crate::table::IndexPreference::Sorted
        } else {
            crate::table::IndexPreference::None
        };
        let mut new_def = TableDefinition::new(def.name(), columns)?;
        for constraint in def.constraints() {
            new_def = new_def.with_constraint(constraint.clone())?;
        }
        self.alter_table(table, new_def)
    }

    // ========================================================================
    // State persistence
    // ========================================================================

    /// Rewrite the state area and publish it through fixed slot 0.
    fn persist_state(&self) -> Result<()> {
        let mut tables = self.tables.write();
        let mut payload = Vec::new();
        payload.extend_from_slice(&STATE_MAGIC.to_be_bytes());
        payload.extend_from_slice(&STATE_VERSION.to_be_bytes());
        payload.extend_from_slice(&tables.next_table_id.to_be_bytes());
        payload.extend_from_slice(&(tables.by_id.len() as u32).to_be_bytes());
        let mut roster: Vec<(&u32, &Arc<MasterTable>)> = tables.by_id.iter().collect();
        roster.sort_by_key(|(id, _)| **id);
        for (id, master) in roster {
            payload.extend_from_slice(&id.to_be_bytes());
            let name = master.name();
            payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(&master.header_area().0.to_be_bytes());
        }

        let _guard = lock_store_write(self.store.as_ref());
        let mut w = self.store.create_area(payload.len())?;
        w.write_bytes(&payload);
        let new_area = w.finish(self.store.as_ref())?;
        self.store.set_fixed_slot(STATE_SLOT, new_area)?;
        let old = tables.state_area;
        tables.state_area = new_area;
        if !old.is_null() {
            self.store.delete_area(old)?;
        }
        drop(tables);
        self.store.checkpoint(self.config.sync_on_commit())
    }

    /// Acquire a session-level table lock through the table's queue.
    pub fn lock_table(
        &self,
        name: &str,
        ty: LockType,
        cancel: Option<&CancelToken>,
    ) -> Result<TableLock> {
        let master = self.table_by_name(name)?;
        let id = match ty {
            LockType::Read => master.locking_queue().lock_read(cancel)?.into_raw(),
            LockType::Write => master.locking_queue().lock_write(cancel)?.into_raw(),
        };
        Ok(TableLock { master, id })
    }
}

/// A held session lock on one table (releases on drop).
pub struct TableLock {
    master: Arc<MasterTable>,
    id: u64,
}

impl Drop for TableLock {
    fn drop(&mut self) {
        self.master.locking_queue().release_raw(self.id);
    }
}

/// Reverse a journal against its master: every added row is marked
/// committed-removed (it logically never existed) and handed to GC.
fn rollback_journal(master: &MasterTable, journal: &TableJournal) {
    for rid in journal.added_rows() {
        match master.write_record_state(rid, RowState::CommittedRemoved) {
            Ok(_) => master.notify_garbage(rid),
            Err(e) => warn!(
                "rollback of {} in '{}' failed: {}",
                rid,
                master.name(),
                e
            ),
        }
    }
}
