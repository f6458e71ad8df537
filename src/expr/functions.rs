//! The function registry.
//!
//! Functions resolve through an explicit mapping from name to an
//! implementation handle plus a declared arity, populated at startup.
//! Scalar functions receive their evaluated arguments; aggregate
//! functions fold over a [`GroupResolver`] and take a column-name
//! literal as their argument (the planner builds such programs).

use std::collections::HashMap;

use crate::common::{Error, Result, Value};
use crate::expr::evaluator::GroupResolver;

/// Handler for a scalar function.
pub type ScalarHandler = fn(&[Value]) -> Result<Value>;

/// Handler for an aggregate function. The second argument is the column
/// the aggregate folds over, or `None` for `count(*)`-style aggregates.
pub type AggregateHandler = fn(&dyn GroupResolver, Option<&str>) -> Result<Value>;

/// What kind of function a registry entry is.
#[derive(Clone, Copy)]
pub enum FunctionKind {
    Scalar(ScalarHandler),
    Aggregate(AggregateHandler),
}

/// A registered function with its declared signature.
#[derive(Clone)]
pub struct FunctionDef {
    pub name: String,
    pub min_args: usize,
    pub max_args: usize,
    pub kind: FunctionKind,
}

/// Name → implementation mapping, populated at startup.
pub struct FunctionRegistry {
    map: HashMap<String, FunctionDef>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// A registry holding the built-in functions.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        let defs = [
            FunctionDef {
                name: "upper".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Scalar(fn_upper),
            },
            FunctionDef {
                name: "lower".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Scalar(fn_lower),
            },
            FunctionDef {
                name: "length".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Scalar(fn_length),
            },
            FunctionDef {
                name: "abs".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Scalar(fn_abs),
            },
            FunctionDef {
                name: "coalesce".into(),
                min_args: 1,
                max_args: usize::MAX,
                kind: FunctionKind::Scalar(fn_coalesce),
            },
            FunctionDef {
                name: "count".into(),
                min_args: 0,
                max_args: 1,
                kind: FunctionKind::Aggregate(agg_count),
            },
            FunctionDef {
                name: "sum".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Aggregate(agg_sum),
            },
            FunctionDef {
                name: "avg".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Aggregate(agg_avg),
            },
            FunctionDef {
                name: "min".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Aggregate(agg_min),
            },
            FunctionDef {
                name: "max".into(),
                min_args: 1,
                max_args: 1,
                kind: FunctionKind::Aggregate(agg_max),
            },
        ];
        for def in defs {
            reg.register(def).expect("builtins are unique");
        }
        reg
    }

    /// Register a function. Duplicate names are a usage error.
    pub fn register(&mut self, def: FunctionDef) -> Result<()> {
        let key = def.name.to_ascii_lowercase();
        if self.map.contains_key(&key) {
            return Err(Error::Usage(format!("function '{}' already registered", key)));
        }
        self.map.insert(key, def);
        Ok(())
    }

    /// Look up a function by (case-insensitive) name.
    pub fn lookup(&self, name: &str) -> Option<&FunctionDef> {
        self.map.get(&name.to_ascii_lowercase())
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ============================================================================
// Scalar builtins
// ============================================================================

fn text_arg<'a>(args: &'a [Value], fname: &str) -> Result<Option<&'a str>> {
    match &args[0] {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(Error::Usage(format!(
            "{}() expects text, got {}",
            fname,
            other.type_name()
        ))),
    }
}

fn fn_upper(args: &[Value]) -> Result<Value> {
    Ok(match text_arg(args, "upper")? {
        None => Value::Null,
        Some(s) => Value::Text(s.to_uppercase()),
    })
}

fn fn_lower(args: &[Value]) -> Result<Value> {
    Ok(match text_arg(args, "lower")? {
        None => Value::Null,
        Some(s) => Value::Text(s.to_lowercase()),
    })
}

fn fn_length(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Null => Value::Null,
        Value::Text(s) => Value::Integer(s.chars().count() as i64),
        Value::Binary(b) => Value::Integer(b.len() as i64),
        other => {
            return Err(Error::Usage(format!(
                "length() expects text or binary, got {}",
                other.type_name()
            )))
        }
    })
}

fn fn_abs(args: &[Value]) -> Result<Value> {
    Ok(match &args[0] {
        Value::Null => Value::Null,
        Value::Integer(i) => Value::Integer(i.checked_abs().ok_or_else(|| {
            Error::Usage("numeric overflow in abs()".into())
        })?),
        Value::Float(f) => Value::Float(f.abs()),
        other => {
            return Err(Error::Usage(format!(
                "abs() expects a number, got {}",
                other.type_name()
            )))
        }
    })
}

fn fn_coalesce(args: &[Value]) -> Result<Value> {
    for v in args {
        if !v.is_null() {
            return Ok(v.clone());
        }
    }
    Ok(Value::Null)
}

// ============================================================================
// Aggregate builtins
// ============================================================================

fn agg_count(group: &dyn GroupResolver, column: Option<&str>) -> Result<Value> {
    let n = match column {
        None => group.group_len(),
        Some(col) => {
            let mut n = 0usize;
            for i in 0..group.group_len() {
                if !group.group_value(i, col)?.is_null() {
                    n += 1;
                }
            }
            n
        }
    };
    Ok(Value::Integer(n as i64))
}

/// Numeric fold used by sum/avg. Returns (sum, non-null count).
fn numeric_fold(group: &dyn GroupResolver, column: &str) -> Result<(f64, i64, bool, usize)> {
    let mut sum_f = 0f64;
    let mut sum_i = 0i64;
    let mut all_int = true;
    let mut count = 0usize;
    for i in 0..group.group_len() {
        match group.group_value(i, column)? {
            Value::Null => {}
            Value::Integer(v) => {
                sum_i = sum_i
                    .checked_add(v)
                    .ok_or_else(|| Error::Usage("numeric overflow in aggregate".into()))?;
                sum_f += v as f64;
                count += 1;
            }
            Value::Float(v) => {
                all_int = false;
                sum_f += v;
                count += 1;
            }
            other => {
                return Err(Error::Usage(format!(
                    "aggregate over non-numeric value {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok((sum_f, sum_i, all_int, count))
}

fn agg_sum(group: &dyn GroupResolver, column: Option<&str>) -> Result<Value> {
    let column = column.ok_or_else(|| Error::Usage("sum() needs a column".into()))?;
    let (sum_f, sum_i, all_int, count) = numeric_fold(group, column)?;
    Ok(if count == 0 {
        Value::Null
    } else if all_int {
        Value::Integer(sum_i)
    } else {
        Value::Float(sum_f)
    })
}

fn agg_avg(group: &dyn GroupResolver, column: Option<&str>) -> Result<Value> {
    let column = column.ok_or_else(|| Error::Usage("avg() needs a column".into()))?;
    let (sum_f, _, _, count) = numeric_fold(group, column)?;
    Ok(if count == 0 {
        Value::Null
    } else {
        Value::Float(sum_f / count as f64)
    })
}

fn extreme(
    group: &dyn GroupResolver,
    column: Option<&str>,
    want_max: bool,
) -> Result<Value> {
    let column = column.ok_or_else(|| Error::Usage("min()/max() need a column".into()))?;
    let mut best: Option<Value> = None;
    for i in 0..group.group_len() {
        let v = group.group_value(i, column)?;
        if v.is_null() {
            continue;
        }
        best = Some(match best {
            None => v,
            Some(b) => {
                let keep_new = if want_max {
                    v.storage_cmp(&b) == std::cmp::Ordering::Greater
                } else {
                    v.storage_cmp(&b) == std::cmp::Ordering::Less
                };
                if keep_new {
                    v
                } else {
                    b
                }
            }
        });
    }
    Ok(best.unwrap_or(Value::Null))
}

fn agg_min(group: &dyn GroupResolver, column: Option<&str>) -> Result<Value> {
    extreme(group, column, false)
}

fn agg_max(group: &dyn GroupResolver, column: Option<&str>) -> Result<Value> {
    extreme(group, column, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGroup {
        rows: Vec<Vec<(String, Value)>>,
    }

    impl GroupResolver for FixedGroup {
        fn group_len(&self) -> usize {
            self.rows.len()
        }

        fn group_value(&self, index: usize, column: &str) -> Result<Value> {
            self.rows[index]
                .iter()
                .find(|(n, _)| n == column)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::Usage(format!("no column '{}'", column)))
        }
    }

    fn group() -> FixedGroup {
        FixedGroup {
            rows: vec![
                vec![("x".into(), Value::Integer(10))],
                vec![("x".into(), Value::Null)],
                vec![("x".into(), Value::Integer(4))],
            ],
        }
    }

    #[test]
    fn test_scalars() {
        assert_eq!(
            fn_upper(&[Value::Text("ab".into())]).unwrap(),
            Value::Text("AB".into())
        );
        assert_eq!(fn_length(&[Value::Text("héllo".into())]).unwrap(), Value::Integer(5));
        assert_eq!(fn_abs(&[Value::Integer(-3)]).unwrap(), Value::Integer(3));
        assert_eq!(
            fn_coalesce(&[Value::Null, Value::Integer(2)]).unwrap(),
            Value::Integer(2)
        );
        assert_eq!(fn_upper(&[Value::Null]).unwrap(), Value::Null);
    }

    #[test]
    fn test_aggregates_skip_nulls() {
        let g = group();
        assert_eq!(agg_count(&g, None).unwrap(), Value::Integer(3));
        assert_eq!(agg_count(&g, Some("x")).unwrap(), Value::Integer(2));
        assert_eq!(agg_sum(&g, Some("x")).unwrap(), Value::Integer(14));
        assert_eq!(agg_avg(&g, Some("x")).unwrap(), Value::Float(7.0));
        assert_eq!(agg_min(&g, Some("x")).unwrap(), Value::Integer(4));
        assert_eq!(agg_max(&g, Some("x")).unwrap(), Value::Integer(10));
    }

    #[test]
    fn test_registry_lookup_and_duplicates() {
        let mut reg = FunctionRegistry::with_builtins();
        assert!(reg.lookup("UPPER").is_some());
        assert!(reg.lookup("nope").is_none());
        let dup = FunctionDef {
            name: "upper".into(),
            min_args: 1,
            max_args: 1,
            kind: FunctionKind::Scalar(fn_upper),
        };
        assert!(reg.register(dup).is_err());
    }
}
