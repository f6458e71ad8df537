//! Table definitions: typed columns, indexing preferences, constraints.
//!
//! A definition is immutable after creation; `ALTER` builds a new
//! [`MasterTable`](crate::table::MasterTable) from a new definition and
//! logically rewrites the rows. Definitions persist inside a store area
//! using the same explicit binary style as the expression codec.

use crate::common::value::{read_slice, read_u32, read_u8};
use crate::common::{Error, Result, ValueType};
use crate::expr::Expression;

/// Per-column indexing preference.
///
/// `Sorted` columns get a persistent sorted list in the table's index
/// set; `Blind` columns are scanned (with an in-memory RID list as a
/// sorting aid); `None` columns are plain storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPreference {
    None,
    Sorted,
    Blind,
}

/// One typed column.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ValueType,
    pub not_null: bool,
    pub default: Option<Expression>,
    pub index: IndexPreference,
}

impl ColumnDefinition {
    pub fn new(name: &str, column_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            not_null: false,
            default: None,
            index: IndexPreference::None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn with_default(mut self, default: Expression) -> Self {
        self.default = Some(default);
        self
    }

    pub fn sorted_index(mut self) -> Self {
        self.index = IndexPreference::Sorted;
        self
    }

    pub fn blind_index(mut self) -> Self {
        self.index = IndexPreference::Blind;
        self
    }
}

/// Referential action on delete/update of a referenced key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FkAction {
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
}

/// When a NO ACTION foreign key is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FkTiming {
    InitiallyImmediate,
    InitiallyDeferred,
}

/// A table-level constraint.
#[derive(Debug, Clone)]
pub enum Constraint {
    Unique {
        name: String,
        columns: Vec<String>,
    },
    PrimaryKey {
        name: String,
        columns: Vec<String>,
    },
    Check {
        name: String,
        expr: Expression,
    },
    ForeignKey {
        name: String,
        columns: Vec<String>,
        ref_table: String,
        ref_columns: Vec<String>,
        on_delete: FkAction,
        on_update: FkAction,
        timing: FkTiming,
    },
}

impl Constraint {
    pub fn name(&self) -> &str {
        match self {
            Constraint::Unique { name, .. }
            | Constraint::PrimaryKey { name, .. }
            | Constraint::Check { name, .. }
            | Constraint::ForeignKey { name, .. } => name,
        }
    }
}

/// An ordered list of typed columns plus constraints.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    name: String,
    columns: Vec<ColumnDefinition>,
    constraints: Vec<Constraint>,
}

impl TableDefinition {
    pub fn new(name: &str, columns: Vec<ColumnDefinition>) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::Usage(format!("table '{}' has no columns", name)));
        }
        for (i, a) in columns.iter().enumerate() {
            for b in &columns[i + 1..] {
                if a.name == b.name {
                    return Err(Error::Usage(format!(
                        "duplicate column '{}' in table '{}'",
                        a.name, name
                    )));
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            columns,
            constraints: Vec::new(),
        })
    }

    /// Builder-style constraint attachment.
    pub fn with_constraint(mut self, constraint: Constraint) -> Result<Self> {
        let check_columns = |cols: &[String]| -> Result<()> {
            for col in cols {
                if self.column_index(col).is_none() {
                    return Err(Error::Usage(format!(
                        "constraint references unknown column '{}'",
                        col
                    )));
                }
            }
            Ok(())
        };
        match &constraint {
            Constraint::Unique { columns, .. } | Constraint::PrimaryKey { columns, .. } => {
                check_columns(columns)?
            }
            Constraint::ForeignKey { columns, .. } => check_columns(columns)?,
            Constraint::Check { .. } => {}
        }
        self.constraints.push(constraint);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, index: usize) -> &ColumnDefinition {
        &self.columns[index]
    }

    /// Index-list assignment per column: `Some(n)` maps the column to
    /// list `n` of the table's index set (list 0 is the master list).
    pub fn index_assignments(&self) -> Vec<Option<usize>> {
        let mut next = 1usize;
        self.columns
            .iter()
            .map(|c| {
                if c.index == IndexPreference::Sorted {
                    let n = next;
                    next += 1;
                    Some(n)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Total number of index lists (master list plus sorted columns).
    pub fn index_list_count(&self) -> usize {
        1 + self
            .columns
            .iter()
            .filter(|c| c.index == IndexPreference::Sorted)
            .count()
    }

    /// The foreign keys declared on this table.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints
            .iter()
            .filter(|c| matches!(c, Constraint::ForeignKey { .. }))
    }

    // ------------------------------------------------------------------
    // Binary codec
    // ------------------------------------------------------------------

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(1u8); // format version
        write_string(&mut out, &self.name);
        out.extend_from_slice(&(self.columns.len() as u32).to_be_bytes());
        for col in &self.columns {
            write_string(&mut out, &col.name);
            out.push(col.column_type.to_tag());
            let mut flags = 0u8;
            if col.not_null {
                flags |= 0x01;
            }
            if col.default.is_some() {
                flags |= 0x02;
            }
            flags |= match col.index {
                IndexPreference::None => 0,
                IndexPreference::Sorted => 0x10,
                IndexPreference::Blind => 0x20,
            };
            out.push(flags);
            if let Some(default) = &col.default {
                write_bytes(&mut out, &default.encode());
            }
        }
        out.extend_from_slice(&(self.constraints.len() as u32).to_be_bytes());
        for constraint in &self.constraints {
            match constraint {
                Constraint::Unique { name, columns } => {
                    out.push(1);
                    write_string(&mut out, name);
                    write_strings(&mut out, columns);
                }
                Constraint::PrimaryKey { name, columns } => {
                    out.push(2);
                    write_string(&mut out, name);
                    write_strings(&mut out, columns);
                }
                Constraint::Check { name, expr } => {
                    out.push(3);
                    write_string(&mut out, name);
                    write_bytes(&mut out, &expr.encode());
                }
                Constraint::ForeignKey {
                    name,
                    columns,
                    ref_table,
                    ref_columns,
                    on_delete,
                    on_update,
                    timing,
                } => {
                    out.push(4);
                    write_string(&mut out, name);
                    write_strings(&mut out, columns);
                    write_string(&mut out, ref_table);
                    write_strings(&mut out, ref_columns);
                    out.push(fk_action_code(*on_delete));
                    out.push(fk_action_code(*on_update));
                    out.push(match timing {
                        FkTiming::InitiallyImmediate => 1,
                        FkTiming::InitiallyDeferred => 2,
                    });
                }
            }
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<TableDefinition> {
        let mut pos = 0usize;
        let version = read_u8(bytes, &mut pos)?;
        if version != 1 {
            return Err(Error::Corruption(format!(
                "unsupported table definition version {}",
                version
            )));
        }
        let name = read_string(bytes, &mut pos)?;
        let col_count = read_u32(bytes, &mut pos)? as usize;
        let mut columns = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let cname = read_string(bytes, &mut pos)?;
            let column_type = ValueType::from_tag(read_u8(bytes, &mut pos)?)?;
            let flags = read_u8(bytes, &mut pos)?;
            let default = if flags & 0x02 != 0 {
                let raw = read_bytes(bytes, &mut pos)?;
                Some(Expression::decode(&raw)?)
            } else {
                None
            };
            let index = match flags & 0x30 {
                0x10 => IndexPreference::Sorted,
                0x20 => IndexPreference::Blind,
                _ => IndexPreference::None,
            };
            columns.push(ColumnDefinition {
                name: cname,
                column_type,
                not_null: flags & 0x01 != 0,
                default,
                index,
            });
        }
        let mut def = TableDefinition::new(&name, columns)?;
        let constraint_count = read_u32(bytes, &mut pos)? as usize;
        for _ in 0..constraint_count {
            let tag = read_u8(bytes, &mut pos)?;
            let constraint = match tag {
                1 => Constraint::Unique {
                    name: read_string(bytes, &mut pos)?,
                    columns: read_strings(bytes, &mut pos)?,
                },
                2 => Constraint::PrimaryKey {
                    name: read_string(bytes, &mut pos)?,
                    columns: read_strings(bytes, &mut pos)?,
                },
                3 => {
                    let name = read_string(bytes, &mut pos)?;
                    let raw = read_bytes(bytes, &mut pos)?;
                    Constraint::Check {
                        name,
                        expr: Expression::decode(&raw)?,
                    }
                }
                4 => Constraint::ForeignKey {
                    name: read_string(bytes, &mut pos)?,
                    columns: read_strings(bytes, &mut pos)?,
                    ref_table: read_string(bytes, &mut pos)?,
                    ref_columns: read_strings(bytes, &mut pos)?,
                    on_delete: fk_action_from(read_u8(bytes, &mut pos)?)?,
                    on_update: fk_action_from(read_u8(bytes, &mut pos)?)?,
                    timing: match read_u8(bytes, &mut pos)? {
                        1 => FkTiming::InitiallyImmediate,
                        2 => FkTiming::InitiallyDeferred,
                        t => {
                            return Err(Error::Corruption(format!("bad fk timing {}", t)))
                        }
                    },
                },
                _ => {
                    return Err(Error::Corruption(format!(
                        "unknown constraint tag {}",
                        tag
                    )))
                }
            };
            def = def.with_constraint(constraint)?;
        }
        Ok(def)
    }
}

fn fk_action_code(a: FkAction) -> u8 {
    match a {
        FkAction::NoAction => 1,
        FkAction::Cascade => 2,
        FkAction::SetNull => 3,
        FkAction::SetDefault => 4,
    }
}

fn fk_action_from(code: u8) -> Result<FkAction> {
    Ok(match code {
        1 => FkAction::NoAction,
        2 => FkAction::Cascade,
        3 => FkAction::SetNull,
        4 => FkAction::SetDefault,
        _ => return Err(Error::Corruption(format!("bad fk action {}", code))),
    })
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_be_bytes());
    out.extend_from_slice(b);
}

fn write_strings(out: &mut Vec<u8>, ss: &[String]) {
    out.extend_from_slice(&(ss.len() as u32).to_be_bytes());
    for s in ss {
        write_string(out, s);
    }
}

fn read_string(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_u32(bytes, pos)? as usize;
    let raw = read_slice(bytes, pos, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::Corruption("invalid utf-8 in table definition".into()))
}

fn read_bytes(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = read_u32(bytes, pos)? as usize;
    Ok(read_slice(bytes, pos, len)?.to_vec())
}

fn read_strings(bytes: &[u8], pos: &mut usize) -> Result<Vec<String>> {
    let count = read_u32(bytes, pos)? as usize;
    let mut out = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        out.push(read_string(bytes, pos)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use crate::expr::Operator;

    fn sample() -> TableDefinition {
        TableDefinition::new(
            "person",
            vec![
                ColumnDefinition::new("id", ValueType::Integer)
                    .not_null()
                    .sorted_index(),
                ColumnDefinition::new("name", ValueType::Text).not_null(),
                ColumnDefinition::new("age", ValueType::Integer)
                    .with_default(Expression::literal(Value::Integer(0))),
            ],
        )
        .unwrap()
        .with_constraint(Constraint::PrimaryKey {
            name: "pk_person".into(),
            columns: vec!["id".into()],
        })
        .unwrap()
        .with_constraint(Constraint::Check {
            name: "ck_age".into(),
            expr: Expression::binary(
                Expression::var("age"),
                Operator::Ge,
                Expression::literal(Value::Integer(0)),
            ),
        })
        .unwrap()
    }

    #[test]
    fn test_index_assignments() {
        let def = sample();
        assert_eq!(def.index_assignments(), vec![Some(1), None, None]);
        assert_eq!(def.index_list_count(), 2);
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = TableDefinition::new(
            "t",
            vec![
                ColumnDefinition::new("a", ValueType::Integer),
                ColumnDefinition::new("a", ValueType::Text),
            ],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_constraint_unknown_column_rejected() {
        let def = TableDefinition::new("t", vec![ColumnDefinition::new("a", ValueType::Integer)])
            .unwrap();
        let err = def.with_constraint(Constraint::Unique {
            name: "u".into(),
            columns: vec!["missing".into()],
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let def = sample();
        let back = TableDefinition::deserialize(&def.serialize()).unwrap();
        assert_eq!(back.name(), "person");
        assert_eq!(back.arity(), 3);
        assert_eq!(back.constraints().len(), 2);
        assert_eq!(back.column(0).index, IndexPreference::Sorted);
        assert!(back.column(2).default.is_some());
        assert_eq!(back.index_assignments(), def.index_assignments());
    }

    #[test]
    fn test_fk_roundtrip() {
        let def = TableDefinition::new(
            "child",
            vec![ColumnDefinition::new("pid", ValueType::Integer).sorted_index()],
        )
        .unwrap()
        .with_constraint(Constraint::ForeignKey {
            name: "fk_child_parent".into(),
            columns: vec!["pid".into()],
            ref_table: "parent".into(),
            ref_columns: vec!["id".into()],
            on_delete: FkAction::Cascade,
            on_update: FkAction::NoAction,
            timing: FkTiming::InitiallyImmediate,
        })
        .unwrap();
        let back = TableDefinition::deserialize(&def.serialize()).unwrap();
        match &back.constraints()[0] {
            Constraint::ForeignKey {
                on_delete, timing, ..
            } => {
                assert_eq!(*on_delete, FkAction::Cascade);
                assert_eq!(*timing, FkTiming::InitiallyImmediate);
            }
            other => panic!("unexpected constraint {:?}", other),
        }
    }
}
