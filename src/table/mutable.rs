//! The mutable table view a transaction works through.
//!
//! A [`MutableTable`] overlays one table's published [`IndexSet`]
//! snapshot with a private [`TableJournal`]: inserts and deletes are
//! appended to the journal and applied to the ephemeral index copy, so
//! the transaction reads its own writes while concurrent transactions
//! see nothing until commit.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::{Error, Result, RowId, Value};
use crate::expr::{Evaluator, Expression, FunctionRegistry, VariableResolver};
use crate::index::IndexSet;
use crate::table::journal::{JournalOp, TableJournal};
use crate::table::MasterTable;

/// Snapshot + journal view of one table inside a transaction.
pub struct MutableTable {
    master: Arc<MasterTable>,
    set: IndexSet,
    journal: TableJournal,
    selected: bool,
}

impl MutableTable {
    pub(crate) fn new(master: Arc<MasterTable>, set: IndexSet) -> Self {
        let journal = TableJournal::new(master.table_id());
        Self {
            master,
            set,
            journal,
            selected: false,
        }
    }

    pub fn master(&self) -> &Arc<MasterTable> {
        &self.master
    }

    pub(crate) fn journal(&self) -> &TableJournal {
        &self.journal
    }

    pub(crate) fn was_selected(&self) -> bool {
        self.selected
    }

    pub(crate) fn into_parts(self) -> (Arc<MasterTable>, IndexSet, TableJournal, bool) {
        (self.master, self.set, self.journal, self.selected)
    }

    /// Number of rows visible to this transaction.
    pub fn row_count(&self) -> usize {
        self.set.list(0).len()
    }

    /// All visible row ids, in row order.
    pub fn all_rows(&self) -> Result<Vec<RowId>> {
        Ok(self
            .set
            .list(0)
            .to_vec()?
            .into_iter()
            .map(RowId::new)
            .collect())
    }

    /// Whether `rid` is visible to this transaction.
    pub fn contains(&self, rid: RowId) -> Result<bool> {
        self.set.list(0).contains_sorted(rid.0)
    }

    /// Read one cell of a visible row.
    pub fn get_cell(&self, col: usize, rid: RowId) -> Result<Value> {
        self.master.get_cell(col, rid)
    }

    /// Read a whole visible row.
    pub fn get_row(&self, rid: RowId) -> Result<Vec<Value>> {
        self.master.get_row(rid)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Insert a row: master storage, journal entry, ephemeral indexes.
    pub fn insert(&mut self, values: &[Value]) -> Result<RowId> {
        let rid = self.master.add_row(values)?;
        self.journal.append(JournalOp::TableAdd, rid);
        index_insert_row(&self.master, &mut self.set, rid)?;
        Ok(rid)
    }

    /// Delete a visible row.
    pub fn delete(&mut self, rid: RowId) -> Result<()> {
        if !self.contains(rid)? {
            return Err(Error::Usage(format!(
                "{} is not visible in table '{}'",
                rid,
                self.master.name()
            )));
        }
        self.journal.append(JournalOp::TableRemove, rid);
        index_remove_row(&self.master, &mut self.set, rid)?;
        Ok(())
    }

    /// Update a visible row: delete-then-insert under the update opcodes
    /// so commit treats it as one logical operation.
    pub fn update(&mut self, rid: RowId, values: &[Value]) -> Result<RowId> {
        if !self.contains(rid)? {
            return Err(Error::Usage(format!(
                "{} is not visible in table '{}'",
                rid,
                self.master.name()
            )));
        }
        self.journal.append(JournalOp::TableUpdateRemove, rid);
        index_remove_row(&self.master, &mut self.set, rid)?;
        let new_rid = self.master.add_row(values)?;
        self.journal.append(JournalOp::TableUpdateAdd, new_rid);
        index_insert_row(&self.master, &mut self.set, new_rid)?;
        Ok(new_rid)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Record that this transaction selected from the table (dirty-select
    /// strictness keys off this).
    pub fn mark_selected(&mut self) {
        self.selected = true;
    }

    /// Rows matching a predicate (all rows when `None`).
    pub fn select_where(
        &mut self,
        predicate: Option<&Expression>,
        registry: &FunctionRegistry,
    ) -> Result<Vec<RowId>> {
        self.selected = true;
        let rows = self.all_rows()?;
        let Some(expr) = predicate else { return Ok(rows) };

        let mut evaluator = Evaluator::new(registry);
        let mut out = Vec::new();
        for rid in rows {
            let resolver = RowResolver {
                master: &self.master,
                rid,
            };
            if evaluator.evaluate_predicate(expr, &resolver, None)? == Some(true) {
                out.push(rid);
            }
        }
        Ok(out)
    }

    /// Visible rows whose `col` equals `value`, via the column's sorted
    /// list when one exists.
    pub fn lookup_eq(&self, col: usize, value: &Value) -> Result<Vec<RowId>> {
        let assignments = self.master.def().index_assignments();
        if let Some(Some(list_no)) = assignments.get(col) {
            let list = self.set.list(*list_no);
            let lo = list.lower_bound_by(|row| {
                Ok(self
                    .master
                    .get_cell(col, RowId::new(row))?
                    .storage_cmp(value))
            })?;
            let mut out = Vec::new();
            let mut pos = lo;
            while pos < list.len() {
                let row = list.get(pos)?;
                if self.master.get_cell(col, RowId::new(row))?.storage_cmp(value)
                    != Ordering::Equal
                {
                    break;
                }
                out.push(RowId::new(row));
                pos += 1;
            }
            return Ok(out);
        }
        // Blind column: scan.
        let mut out = Vec::new();
        for rid in self.all_rows()? {
            if self.master.get_cell(col, rid)?.storage_cmp(value) == Ordering::Equal {
                out.push(rid);
            }
        }
        Ok(out)
    }

    /// Visible rows in `col`-value order. Sorted columns walk their
    /// index list; blind columns use the master's RID list as the
    /// ordering aid, filtered to visibility.
    pub fn rows_ordered_by(&self, col: usize) -> Result<Vec<RowId>> {
        let assignments = self.master.def().index_assignments();
        if let Some(Some(list_no)) = assignments.get(col) {
            return Ok(self
                .set
                .list(*list_no)
                .to_vec()?
                .into_iter()
                .map(RowId::new)
                .collect());
        }
        let mut out = Vec::new();
        for row in self.master.rid_order(col)? {
            if self.set.list(0).contains_sorted(row)? {
                out.push(RowId::new(row));
            }
        }
        Ok(out)
    }
}

/// Resolves column names to cells of one row.
pub struct RowResolver<'a> {
    pub master: &'a MasterTable,
    pub rid: RowId,
}

impl VariableResolver for RowResolver<'_> {
    fn resolve(&self, name: &str) -> Result<Value> {
        let col = self
            .master
            .def()
            .column_index(name)
            .ok_or_else(|| {
                Error::Usage(format!(
                    "no column '{}' in table '{}'",
                    name,
                    self.master.name()
                ))
            })?;
        self.master.get_cell(col, self.rid)
    }
}

/// Apply a row insert to an ephemeral index set: the master list plus
/// every sorted column list, ordered by cell value.
pub(crate) fn index_insert_row(
    master: &MasterTable,
    set: &mut IndexSet,
    rid: RowId,
) -> Result<()> {
    set.list_mut(0).insert_sorted(rid.0)?;
    let assignments = master.def().index_assignments();
    for (col, assignment) in assignments.iter().enumerate() {
        let Some(list_no) = assignment else { continue };
        let target = master.get_cell(col, rid)?;
        set.list_mut(*list_no).insert_by(rid.0, |other| {
            Ok(master
                .get_cell(col, RowId::new(other))?
                .storage_cmp(&target))
        })?;
    }
    Ok(())
}

/// Undo of [`index_insert_row`] for a row leaving the visible set.
pub(crate) fn index_remove_row(
    master: &MasterTable,
    set: &mut IndexSet,
    rid: RowId,
) -> Result<()> {
    if !set.list_mut(0).remove_sorted(rid.0)? {
        return Err(Error::Corruption(format!(
            "{} missing from the master list of '{}'",
            rid,
            master.name()
        )));
    }
    let assignments = master.def().index_assignments();
    for (col, assignment) in assignments.iter().enumerate() {
        let Some(list_no) = assignment else { continue };
        let target = master.get_cell(col, rid)?;
        let removed = set.list_mut(*list_no).remove_by(rid.0, |other| {
            Ok(master
                .get_cell(col, RowId::new(other))?
                .storage_cmp(&target))
        })?;
        if !removed {
            return Err(Error::Corruption(format!(
                "{} missing from index list {} of '{}'",
                rid,
                list_no,
                master.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::common::{DbConfig, TableId, ValueType};
    use crate::expr::Operator;
    use crate::store::{HeapStore, Store};
    use crate::table::cell_cache::DataCellCache;
    use crate::table::definition::{ColumnDefinition, TableDefinition};

    fn table() -> Arc<MasterTable> {
        let store: Arc<dyn Store> = Arc::new(HeapStore::new());
        let blobs = Arc::new(BlobStore::new(Arc::clone(&store)));
        let cache = Arc::new(DataCellCache::new(1 << 20, 8192));
        let config = Arc::new(DbConfig::heap());
        let def = TableDefinition::new(
            "person",
            vec![
                ColumnDefinition::new("id", ValueType::Integer).sorted_index(),
                ColumnDefinition::new("name", ValueType::Text),
            ],
        )
        .unwrap();
        Arc::new(MasterTable::create(store, blobs, cache, config, TableId::new(1), def).unwrap())
    }

    fn view(master: &Arc<MasterTable>) -> MutableTable {
        MutableTable::new(Arc::clone(master), master.index_store().snapshot())
    }

    #[test]
    fn test_insert_visible_to_self_only() {
        let master = table();
        let mut tx_view = view(&master);
        let rid = tx_view
            .insert(&[Value::Integer(1), Value::Text("a".into())])
            .unwrap();
        assert_eq!(tx_view.row_count(), 1);
        assert!(tx_view.contains(rid).unwrap());

        // A second snapshot view sees nothing.
        let other = view(&master);
        assert_eq!(other.row_count(), 0);

        let (m, set, _, _) = tx_view.into_parts();
        m.index_store().release_snapshot(set).unwrap();
        let (m, set, _, _) = other.into_parts();
        m.index_store().release_snapshot(set).unwrap();
    }

    #[test]
    fn test_update_is_remove_plus_add() {
        let master = table();
        let mut v = view(&master);
        let rid = v
            .insert(&[Value::Integer(1), Value::Text("a".into())])
            .unwrap();
        let new_rid = v
            .update(rid, &[Value::Integer(1), Value::Text("b".into())])
            .unwrap();
        assert_ne!(rid, new_rid);
        assert!(!v.contains(rid).unwrap());
        assert_eq!(v.get_cell(1, new_rid).unwrap(), Value::Text("b".into()));
        v.journal().check_update_pairs().unwrap();

        let (m, set, _, _) = v.into_parts();
        m.index_store().release_snapshot(set).unwrap();
    }

    #[test]
    fn test_delete_invisible_row_fails() {
        let master = table();
        let mut v = view(&master);
        assert!(v.delete(RowId::new(99)).is_err());
        let (m, set, _, _) = v.into_parts();
        m.index_store().release_snapshot(set).unwrap();
    }

    #[test]
    fn test_select_where() {
        let master = table();
        let mut v = view(&master);
        for (id, name) in [(1, "a"), (2, "b"), (3, "a")] {
            v.insert(&[Value::Integer(id), Value::Text(name.into())])
                .unwrap();
        }
        let registry = FunctionRegistry::with_builtins();
        let predicate = Expression::binary(
            Expression::var("name"),
            Operator::Eq,
            Expression::literal(Value::Text("a".into())),
        );
        let hits = v.select_where(Some(&predicate), &registry).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(v.was_selected());

        let (m, set, _, _) = v.into_parts();
        m.index_store().release_snapshot(set).unwrap();
    }

    #[test]
    fn test_lookup_eq_uses_index() {
        let master = table();
        let mut v = view(&master);
        for id in [5, 3, 9, 3] {
            v.insert(&[Value::Integer(id), Value::Text("x".into())])
                .unwrap();
        }
        let hits = v.lookup_eq(0, &Value::Integer(3)).unwrap();
        assert_eq!(hits.len(), 2);
        let misses = v.lookup_eq(0, &Value::Integer(7)).unwrap();
        assert!(misses.is_empty());

        let (m, set, _, _) = v.into_parts();
        m.index_store().release_snapshot(set).unwrap();
    }

    #[test]
    fn test_rows_ordered_by_sorted_column() {
        let master = table();
        let mut v = view(&master);
        for id in [5, 3, 9] {
            v.insert(&[Value::Integer(id), Value::Text("x".into())])
                .unwrap();
        }
        let ordered = v.rows_ordered_by(0).unwrap();
        let values: Vec<Value> = ordered
            .iter()
            .map(|r| v.get_cell(0, *r).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![Value::Integer(3), Value::Integer(5), Value::Integer(9)]
        );

        let (m, set, _, _) = v.into_parts();
        m.index_store().release_snapshot(set).unwrap();
    }
}
