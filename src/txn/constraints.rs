//! Commit-time constraint checking.
//!
//! Runs under the conglomerate commit lock against the commit's working
//! state (fresh index snapshots with the transaction's journals
//! replayed). Checks are chunk-driven: each table's journal carries a
//! cursor of already-checked entries, and referential actions append new
//! entries (possibly to other tables), which are then checked in later
//! rounds until the work map is stable. Deferred NO ACTION keys are
//! re-verified once everything has settled.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{Error, Result, RowId, Value};
use crate::expr::{Evaluator, FunctionRegistry, NoColumns};
use crate::index::IndexSet;
use crate::table::{
    index_insert_row, index_remove_row, Constraint, FkAction, FkTiming, JournalOp, MasterTable,
    RowResolver, TableJournal,
};
use crate::txn::Conglomerate;

/// One table's working state during commit.
pub(crate) struct CommitTable {
    pub master: Arc<MasterTable>,
    pub set: IndexSet,
    pub journal: TableJournal,
    /// Journal entries before this cursor have been checked.
    pub checked: usize,
}

/// Working tables keyed by table id.
pub(crate) type WorkMap = HashMap<u32, CommitTable>;

/// Bound on check/action rounds; a cycle of cascading actions that
/// never converges trips this.
const MAX_ROUNDS: usize = 10_000;

struct DeferredNoAction {
    referenced: String,
    constraint: String,
    referencing_id: u32,
    fk_cols: Vec<usize>,
    key: Vec<Value>,
}

/// Run all commit-time constraint checks, executing referential actions
/// into the work map as needed.
pub(crate) fn check_and_apply(
    cong: &Conglomerate,
    work: &mut WorkMap,
    registry: &FunctionRegistry,
) -> Result<()> {
    let mut deferred: Vec<DeferredNoAction> = Vec::new();
    let mut rounds = 0usize;

    loop {
        let Some(table_id) = work
            .iter()
            .find(|(_, t)| t.checked < t.journal.len())
            .map(|(id, _)| *id)
        else {
            break;
        };
        rounds += 1;
        if rounds > MAX_ROUNDS {
            return Err(Error::Usage(
                "referential actions did not converge (cyclic cascade?)".into(),
            ));
        }

        let (master, chunk) = {
            let entry = work.get_mut(&table_id).unwrap();
            let from = entry.checked;
            entry.checked = entry.journal.len();
            (
                Arc::clone(&entry.master),
                entry.journal.entries()[from..].to_vec(),
            )
        };

        let adds: Vec<RowId> = chunk.iter().filter(|e| e.op.is_add()).map(|e| e.row).collect();
        let removes: Vec<(JournalOp, RowId)> = chunk
            .iter()
            .filter(|e| e.op.is_remove())
            .map(|e| (e.op, e.row))
            .collect();

        check_field_constraints(&master, &adds, registry)?;
        check_unique(&work[&table_id], &adds)?;
        check_fk_inserts(cong, work, &master, &adds)?;
        apply_referential_actions(cong, work, &master, &removes, &mut deferred)?;
    }

    // Deferred NO ACTION: the match set must be empty once all actions
    // (including the transaction's own deletions) have been applied.
    for d in deferred {
        let entry = &work[&d.referencing_id];
        let matched = rows_matching(entry, &d.fk_cols, &d.key)?;
        if !matched.is_empty() {
            return Err(Error::ForeignKeyViolation(format!(
                "'{}': {} row(s) still reference the removed key in '{}'",
                d.constraint,
                matched.len(),
                d.referenced
            )));
        }
    }
    Ok(())
}

/// NOT NULL and CHECK constraints over newly added rows.
fn check_field_constraints(
    master: &MasterTable,
    adds: &[RowId],
    registry: &FunctionRegistry,
) -> Result<()> {
    if adds.is_empty() {
        return Ok(());
    }
    let def = master.def();
    for &rid in adds {
        for (col, column) in def.columns().iter().enumerate() {
            if column.not_null && master.get_cell(col, rid)?.is_null() {
                return Err(Error::NotNullViolation(column.name.clone()));
            }
        }
        for constraint in def.constraints() {
            if let Constraint::Check { name, expr } = constraint {
                let resolver = RowResolver { master, rid };
                let mut evaluator = Evaluator::new(registry);
                // NULL results pass, per SQL check semantics.
                if evaluator.evaluate_predicate(expr, &resolver, None)? == Some(false) {
                    return Err(Error::CheckViolation(format!(
                        "'{}' failed for a row in table '{}'",
                        name,
                        master.name()
                    )));
                }
            }
        }
    }
    Ok(())
}

/// UNIQUE and PRIMARY KEY constraints over newly added rows, evaluated
/// against the working index set.
fn check_unique(table: &CommitTable, adds: &[RowId]) -> Result<()> {
    if adds.is_empty() {
        return Ok(());
    }
    let def = table.master.def();
    for constraint in def.constraints() {
        let (name, columns, is_pk) = match constraint {
            Constraint::Unique { name, columns } => (name, columns, false),
            Constraint::PrimaryKey { name, columns } => (name, columns, true),
            _ => continue,
        };
        let cols: Vec<usize> = columns
            .iter()
            .map(|c| def.column_index(c).expect("validated at definition time"))
            .collect();
        for &rid in adds {
            let mut key = Vec::with_capacity(cols.len());
            let mut has_null = false;
            for &col in &cols {
                let v = table.master.get_cell(col, rid)?;
                has_null |= v.is_null();
                key.push(v);
            }
            if has_null {
                if is_pk {
                    return Err(Error::NotNullViolation(format!(
                        "primary key '{}' of table '{}'",
                        name,
                        table.master.name()
                    )));
                }
                continue; // nulls never collide under UNIQUE
            }
            let matched = rows_matching(table, &cols, &key)?;
            if matched.iter().any(|m| *m != rid) {
                return Err(Error::UniqueViolation(format!(
                    "'{}' on table '{}'",
                    name,
                    table.master.name()
                )));
            }
        }
    }
    Ok(())
}

/// FOREIGN KEY existence checks for newly added rows.
fn check_fk_inserts(
    cong: &Conglomerate,
    work: &mut WorkMap,
    master: &Arc<MasterTable>,
    adds: &[RowId],
) -> Result<()> {
    if adds.is_empty() {
        return Ok(());
    }
    let def = Arc::clone(master.def());
    for constraint in def.foreign_keys() {
        let Constraint::ForeignKey {
            name,
            columns,
            ref_table,
            ref_columns,
            ..
        } = constraint
        else {
            continue;
        };
        let cols: Vec<usize> = columns
            .iter()
            .map(|c| def.column_index(c).expect("validated at definition time"))
            .collect();
        let ref_master = cong.table_by_name(ref_table)?;
        ensure_work(work, &ref_master);
        let ref_def = ref_master.def();
        let ref_cols: Vec<usize> = ref_columns
            .iter()
            .map(|c| {
                ref_def.column_index(c).ok_or_else(|| {
                    Error::Usage(format!(
                        "foreign key '{}' references unknown column '{}'",
                        name, c
                    ))
                })
            })
            .collect::<Result<_>>()?;

        for &rid in adds {
            let mut key = Vec::with_capacity(cols.len());
            let mut has_null = false;
            for &col in &cols {
                let v = master.get_cell(col, rid)?;
                has_null |= v.is_null();
                key.push(v);
            }
            if has_null {
                continue; // a null in the key satisfies the constraint
            }
            let referenced = &work[&ref_master.table_id().0];
            if rows_matching(referenced, &ref_cols, &key)?.is_empty() {
                return Err(Error::ForeignKeyViolation(format!(
                    "'{}': no matching key in '{}'",
                    name, ref_table
                )));
            }
        }
    }
    Ok(())
}

/// Apply ON DELETE / ON UPDATE rules for rows removed from `master`.
fn apply_referential_actions(
    cong: &Conglomerate,
    work: &mut WorkMap,
    master: &Arc<MasterTable>,
    removes: &[(JournalOp, RowId)],
    deferred: &mut Vec<DeferredNoAction>,
) -> Result<()> {
    if removes.is_empty() {
        return Ok(());
    }
    // Pair each update's removed row with its replacement, for cascade
    // updates that must carry the new key.
    let replacements = update_pairs(&work[&master.table_id().0].journal);
    let referencing = cong.referencing_tables(master.name());

    for &(op, removed) in removes {
        let original = master.get_row(removed)?;
        for r_master in &referencing {
            let r_def = Arc::clone(r_master.def());
            for constraint in r_def.foreign_keys() {
                let Constraint::ForeignKey {
                    name,
                    columns,
                    ref_table,
                    ref_columns,
                    on_delete,
                    on_update,
                    timing,
                } = constraint
                else {
                    continue;
                };
                if cong.config().fold_identifier(ref_table)
                    != cong.config().fold_identifier(master.name())
                {
                    continue;
                }
                let ref_cols: Vec<usize> = ref_columns
                    .iter()
                    .map(|c| {
                        master.def().column_index(c).ok_or_else(|| {
                            Error::Usage(format!(
                                "foreign key '{}' references unknown column '{}'",
                                name, c
                            ))
                        })
                    })
                    .collect::<Result<_>>()?;
                let mut key = Vec::with_capacity(ref_cols.len());
                let mut has_null = false;
                for &col in &ref_cols {
                    let v = original[col].clone();
                    has_null |= v.is_null();
                    key.push(v);
                }
                if has_null {
                    continue; // null keys are never referenced
                }
                let fk_cols: Vec<usize> = columns
                    .iter()
                    .map(|c| r_def.column_index(c).expect("validated at definition time"))
                    .collect();

                ensure_work(work, r_master);
                let r_id = r_master.table_id().0;
                let matched = rows_matching(&work[&r_id], &fk_cols, &key)?;
                if matched.is_empty() {
                    continue;
                }

                let is_update = op == JournalOp::TableUpdateRemove;
                let action = if is_update { *on_update } else { *on_delete };
                match action {
                    FkAction::NoAction => match timing {
                        FkTiming::InitiallyImmediate => {
                            return Err(Error::ForeignKeyViolation(format!(
                                "'{}': {} row(s) in '{}' reference the removed key",
                                name,
                                matched.len(),
                                r_master.name()
                            )));
                        }
                        FkTiming::InitiallyDeferred => {
                            deferred.push(DeferredNoAction {
                                referenced: master.name().to_string(),
                                constraint: name.clone(),
                                referencing_id: r_id,
                                fk_cols: fk_cols.clone(),
                                key: key.clone(),
                            });
                        }
                    },
                    FkAction::Cascade => {
                        if is_update {
                            // Carry the replacement row's key values.
                            let replacement = replacements.get(&removed.0).ok_or_else(|| {
                                Error::Corruption(
                                    "update remove without a replacement row".into(),
                                )
                            })?;
                            let new_key: Vec<Value> = {
                                let replacement_row = master.get_row(RowId::new(*replacement))?;
                                ref_cols.iter().map(|&c| replacement_row[c].clone()).collect()
                            };
                            for m in matched {
                                rewrite_row(work, r_id, m, &fk_cols, |i| new_key[i].clone())?;
                            }
                        } else {
                            let entry = work.get_mut(&r_id).unwrap();
                            let r = Arc::clone(&entry.master);
                            for m in matched {
                                entry.journal.append(JournalOp::TableRemove, m);
                                index_remove_row(&r, &mut entry.set, m)?;
                            }
                        }
                    }
                    FkAction::SetNull => {
                        for m in matched {
                            rewrite_row(work, r_id, m, &fk_cols, |_| Value::Null)?;
                        }
                    }
                    FkAction::SetDefault => {
                        let defaults: Vec<Value> = fk_cols
                            .iter()
                            .map(|&c| {
                                let column = r_def.column(c);
                                let expr = column.default.as_ref().ok_or_else(|| {
                                    Error::Usage(format!(
                                        "column '{}' has no default for SET DEFAULT",
                                        column.name
                                    ))
                                })?;
                                let mut evaluator = Evaluator::new(cong.functions());
                                evaluator.evaluate(expr, &NoColumns, None)
                            })
                            .collect::<Result<_>>()?;
                        for m in matched {
                            rewrite_row(work, r_id, m, &fk_cols, |i| defaults[i].clone())?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Replace `fk_cols` of row `rid` in working table `table_id` with
/// values from `new_value(position_in_fk_cols)`, as an update pair.
fn rewrite_row(
    work: &mut WorkMap,
    table_id: u32,
    rid: RowId,
    fk_cols: &[usize],
    new_value: impl Fn(usize) -> Value,
) -> Result<()> {
    let entry = work.get_mut(&table_id).unwrap();
    let master = Arc::clone(&entry.master);
    let mut values = master.get_row(rid)?;
    for (i, &col) in fk_cols.iter().enumerate() {
        values[col] = new_value(i);
    }
    entry.journal.append(JournalOp::TableUpdateRemove, rid);
    index_remove_row(&master, &mut entry.set, rid)?;
    let new_rid = master.add_row(&values)?;
    entry.journal.append(JournalOp::TableUpdateAdd, new_rid);
    index_insert_row(&master, &mut entry.set, new_rid)?;
    Ok(())
}

/// Map each update-removed row to its replacement row, pairing the nth
/// `TableUpdateRemove` with the nth `TableUpdateAdd`.
fn update_pairs(journal: &TableJournal) -> HashMap<i64, i64> {
    let mut pending: Vec<i64> = Vec::new();
    let mut out = HashMap::new();
    for entry in journal.entries() {
        match entry.op {
            JournalOp::TableUpdateRemove => pending.push(entry.row.0),
            JournalOp::TableUpdateAdd => {
                if !pending.is_empty() {
                    out.insert(pending.remove(0), entry.row.0);
                }
            }
            _ => {}
        }
    }
    out
}

/// Make sure `master` has a working entry (fresh snapshot, empty
/// journal) in the work map.
fn ensure_work(work: &mut WorkMap, master: &Arc<MasterTable>) {
    let id = master.table_id().0;
    work.entry(id).or_insert_with(|| CommitTable {
        master: Arc::clone(master),
        set: master.index_store().snapshot(),
        journal: TableJournal::new(master.table_id()),
        checked: 0,
    });
}

/// Rows of a working table whose `cols` tuple equals `key`, using the
/// first column's sorted list when one exists.
fn rows_matching(table: &CommitTable, cols: &[usize], key: &[Value]) -> Result<Vec<RowId>> {
    debug_assert_eq!(cols.len(), key.len());
    let master = &table.master;
    let assignments = master.def().index_assignments();

    let row_matches = |rid: RowId| -> Result<bool> {
        for (i, &col) in cols.iter().enumerate() {
            if master.get_cell(col, rid)?.storage_cmp(&key[i]) != std::cmp::Ordering::Equal {
                return Ok(false);
            }
        }
        Ok(true)
    };

    let mut out = Vec::new();
    if let Some(Some(list_no)) = assignments.get(cols[0]) {
        let list = table.set.list(*list_no);
        let first_col = cols[0];
        let target = &key[0];
        let lo = list.lower_bound_by(|row| {
            Ok(master
                .get_cell(first_col, RowId::new(row))?
                .storage_cmp(target))
        })?;
        let mut pos = lo;
        while pos < list.len() {
            let row = RowId::new(list.get(pos)?);
            if master.get_cell(first_col, row)?.storage_cmp(target)
                != std::cmp::Ordering::Equal
            {
                break;
            }
            if row_matches(row)? {
                out.push(row);
            }
            pos += 1;
        }
    } else {
        for row in table.set.list(0).to_vec()? {
            let rid = RowId::new(row);
            if row_matches(rid)? {
                out.push(rid);
            }
        }
    }
    Ok(out)
}
