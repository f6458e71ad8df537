//! Snapshot transactions.
//!
//! A transaction records the commit id it started at and lazily opens a
//! [`MutableTable`] view (snapshot + private journal + one root lock)
//! for each table it touches. Reads never block writers and writers
//! never block readers; write-write conflicts surface at commit.
//!
//! A transaction is single-session state and is not `Sync`; concurrency
//! happens between transactions, through the conglomerate.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::common::{CommitId, Error, Result, RowId, Value};
use crate::expr::Expression;
use crate::lock::CancelToken;
use crate::table::MutableTable;
use crate::txn::Conglomerate;

/// An open snapshot transaction.
pub struct Transaction {
    cong: Arc<Conglomerate>,
    txn_id: u64,
    start_commit_id: CommitId,
    /// Views keyed by table id, opened on first touch.
    tables: HashMap<u32, MutableTable>,
    closed: bool,
}

impl Transaction {
    pub(crate) fn new(cong: Arc<Conglomerate>, txn_id: u64, start_commit_id: CommitId) -> Self {
        Self {
            cong,
            txn_id,
            start_commit_id,
            tables: HashMap::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.txn_id
    }

    /// The commit id this transaction's snapshots were taken at.
    pub fn start_commit_id(&self) -> CommitId {
        self.start_commit_id
    }

    /// Open (or reuse) the mutable view of a table. The first touch
    /// takes an index snapshot and a root lock.
    fn view(&mut self, table: &str) -> Result<&mut MutableTable> {
        let master = self.cong.table_by_name(table)?;
        let id = master.table_id().0;
        if !self.tables.contains_key(&id) {
            master.add_root_lock();
            let set = master.index_store().snapshot();
            self.tables.insert(id, MutableTable::new(master, set));
        }
        Ok(self.tables.get_mut(&id).expect("view just inserted"))
    }

    fn check_writable(&self) -> Result<()> {
        if self.cong.config().read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Work
    // ========================================================================

    /// Insert a row, returning its row index.
    pub fn insert(&mut self, table: &str, values: &[Value]) -> Result<RowId> {
        self.check_writable()?;
        self.view(table)?.insert(values)
    }

    /// Delete specific rows. Returns the number deleted.
    pub fn delete_rows(&mut self, table: &str, rows: &[RowId]) -> Result<usize> {
        self.check_writable()?;
        let view = self.view(table)?;
        for &rid in rows {
            view.delete(rid)?;
        }
        Ok(rows.len())
    }

    /// Delete every row matching `predicate`.
    pub fn delete_where(&mut self, table: &str, predicate: &Expression) -> Result<usize> {
        self.check_writable()?;
        let registry = Arc::clone(self.cong.functions());
        let view = self.view(table)?;
        let rows = view.select_where(Some(predicate), &registry)?;
        for &rid in &rows {
            view.delete(rid)?;
        }
        Ok(rows.len())
    }

    /// Replace one row, returning the replacement's row index.
    pub fn update_row(&mut self, table: &str, rid: RowId, values: &[Value]) -> Result<RowId> {
        self.check_writable()?;
        self.view(table)?.update(rid, values)
    }

    /// Replace every row matching `predicate` with `values`.
    pub fn update_where(
        &mut self,
        table: &str,
        predicate: &Expression,
        values: &[Value],
    ) -> Result<usize> {
        self.check_writable()?;
        let registry = Arc::clone(self.cong.functions());
        let view = self.view(table)?;
        let rows = view.select_where(Some(predicate), &registry)?;
        for &rid in &rows {
            view.update(rid, values)?;
        }
        Ok(rows.len())
    }

    // ========================================================================
    // Reads (snapshot + own writes)
    // ========================================================================

    /// Rows matching `predicate` (all rows when `None`).
    pub fn select(&mut self, table: &str, predicate: Option<&Expression>) -> Result<Vec<RowId>> {
        let registry = Arc::clone(self.cong.functions());
        self.view(table)?.select_where(predicate, &registry)
    }

    /// Number of visible rows.
    pub fn row_count(&mut self, table: &str) -> Result<usize> {
        let view = self.view(table)?;
        view.mark_selected();
        Ok(view.row_count())
    }

    /// One cell of a visible row.
    pub fn get_cell(&mut self, table: &str, col: usize, rid: RowId) -> Result<Value> {
        self.view(table)?.get_cell(col, rid)
    }

    /// A whole visible row.
    pub fn get_row(&mut self, table: &str, rid: RowId) -> Result<Vec<Value>> {
        self.view(table)?.get_row(rid)
    }

    /// Visible rows in column-value order.
    pub fn select_ordered_by(&mut self, table: &str, column: &str) -> Result<Vec<RowId>> {
        let view = self.view(table)?;
        view.mark_selected();
        let col = view
            .master()
            .def()
            .column_index(column)
            .ok_or_else(|| Error::Usage(format!("no column '{}' in '{}'", column, table)))?;
        view.rows_ordered_by(col)
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Validate and publish. Consumes the transaction either way; on
    /// failure everything is rolled back and the error says why.
    pub fn commit(self) -> Result<()> {
        self.finish(None)
    }

    /// Commit with a cancellation token; cancellation before publication
    /// rolls back, afterwards it is a no-op.
    pub fn commit_with_cancel(self, cancel: &CancelToken) -> Result<()> {
        self.finish(Some(cancel))
    }

    fn finish(mut self, cancel: Option<&CancelToken>) -> Result<()> {
        self.closed = true;
        let tables: Vec<MutableTable> = self.tables.drain().map(|(_, t)| t).collect();
        self.cong
            .commit_transaction(self.txn_id, self.start_commit_id, tables, cancel)
    }

    /// Abandon all changes.
    pub fn rollback(mut self) {
        self.closed = true;
        let tables: Vec<MutableTable> = self.tables.drain().map(|(_, t)| t).collect();
        self.cong.rollback_transaction(self.txn_id, tables);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.closed {
            warn!("transaction {} dropped without commit or rollback", self.txn_id);
            let tables: Vec<MutableTable> = self.tables.drain().map(|(_, t)| t).collect();
            self.cong.rollback_transaction(self.txn_id, tables);
        }
    }
}
