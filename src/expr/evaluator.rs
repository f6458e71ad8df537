//! The expression stack machine.
//!
//! Evaluation walks a post-order node sequence, pushing values and
//! applying operators. The stack is instance-local, so one evaluator per
//! thread is reentrant. Single-node and three-node programs short-circuit
//! without touching the stack.
//!
//! Null handling is three-valued: arithmetic and comparisons propagate
//! NULL, and AND/OR/NOT follow Kleene logic.

use std::cmp::Ordering;

use crate::common::{Error, Result, Value};
use crate::expr::functions::{FunctionKind, FunctionRegistry};
use crate::expr::program::{ComparisonOp, ExprNode, Expression, Operator};

/// Maps a variable reference to a cell value for the current row.
pub trait VariableResolver {
    fn resolve(&self, name: &str) -> Result<Value>;

    /// Resolve a reference into an enclosing query level.
    fn resolve_correlated(&self, level: u32, name: &str) -> Result<Value> {
        let _ = level;
        Err(Error::Usage(format!(
            "no correlated context for '{}'",
            name
        )))
    }
}

/// Provides per-group iteration for aggregate functions.
pub trait GroupResolver {
    fn group_len(&self) -> usize;
    fn group_value(&self, index: usize, column: &str) -> Result<Value>;
}

/// A resolver with no columns, for evaluating constant expressions.
pub struct NoColumns;

impl VariableResolver for NoColumns {
    fn resolve(&self, name: &str) -> Result<Value> {
        Err(Error::Usage(format!("unresolved column '{}'", name)))
    }
}

/// Stack machine over expression programs.
pub struct Evaluator<'a> {
    registry: &'a FunctionRegistry,
    stack: Vec<Value>,
}

impl<'a> Evaluator<'a> {
    pub fn new(registry: &'a FunctionRegistry) -> Self {
        Self {
            registry,
            stack: Vec::new(),
        }
    }

    /// Evaluate `expr` against a row.
    pub fn evaluate(
        &mut self,
        expr: &Expression,
        vars: &dyn VariableResolver,
        group: Option<&dyn GroupResolver>,
    ) -> Result<Value> {
        let nodes = expr.nodes();

        // Trivial short circuits: a bare value, or value-value-op.
        if nodes.len() == 1 {
            if let Some(v) = self.try_leaf(&nodes[0], vars)? {
                return Ok(v);
            }
        } else if nodes.len() == 3 {
            if let ExprNode::Op(op) = &nodes[2] {
                if op.arity() == 2 {
                    let a = self.try_leaf(&nodes[0], vars)?;
                    let b = self.try_leaf(&nodes[1], vars)?;
                    if let (Some(a), Some(b)) = (a, b) {
                        return apply_binary(*op, a, b);
                    }
                }
            }
        }

        self.stack.clear();
        for node in nodes {
            match node {
                ExprNode::Literal(v) => self.stack.push(v.clone()),
                ExprNode::Var(name) => self.stack.push(vars.resolve(name)?),
                ExprNode::Correlated { level, name } => {
                    self.stack.push(vars.resolve_correlated(*level, name)?)
                }
                ExprNode::Op(op) => {
                    if op.arity() == 1 {
                        let a = self.pop()?;
                        self.stack.push(apply_unary(*op, a)?);
                    } else {
                        let b = self.pop()?;
                        let a = self.pop()?;
                        self.stack.push(apply_binary(*op, a, b)?);
                    }
                }
                ExprNode::Function { name, argc } => {
                    let def = self
                        .registry
                        .lookup(name)
                        .ok_or_else(|| Error::Usage(format!("unknown function '{}'", name)))?;
                    let argc = *argc as usize;
                    if argc < def.min_args || argc > def.max_args {
                        return Err(Error::Usage(format!(
                            "function '{}' called with {} arguments",
                            name, argc
                        )));
                    }
                    let mut args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        args.push(self.pop()?);
                    }
                    args.reverse();
                    let out = match def.kind {
                        FunctionKind::Scalar(handler) => handler(&args)?,
                        FunctionKind::Aggregate(handler) => {
                            let group = group.ok_or_else(|| {
                                Error::Usage(format!(
                                    "aggregate '{}' evaluated outside a group context",
                                    name
                                ))
                            })?;
                            let column = match args.first() {
                                None => None,
                                Some(Value::Text(col)) => Some(col.as_str()),
                                Some(other) => {
                                    return Err(Error::Usage(format!(
                                        "aggregate '{}' expects a column-name literal, got {}",
                                        name,
                                        other.type_name()
                                    )))
                                }
                            };
                            handler(group, column)?
                        }
                    };
                    self.stack.push(out);
                }
            }
        }
        let out = self.pop()?;
        debug_assert!(self.stack.is_empty(), "expression left stack residue");
        Ok(out)
    }

    /// Evaluate a predicate to SQL three-valued boolean.
    pub fn evaluate_predicate(
        &mut self,
        expr: &Expression,
        vars: &dyn VariableResolver,
        group: Option<&dyn GroupResolver>,
    ) -> Result<Option<bool>> {
        match self.evaluate(expr, vars, group)? {
            Value::Null => Ok(None),
            Value::Boolean(b) => Ok(Some(b)),
            other => Err(Error::Usage(format!(
                "predicate evaluated to {}, not boolean",
                other.type_name()
            ))),
        }
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Usage("expression stack underflow".into()))
    }

    /// Resolve a leaf node without the stack. Returns `None` for
    /// non-leaf nodes.
    fn try_leaf(&self, node: &ExprNode, vars: &dyn VariableResolver) -> Result<Option<Value>> {
        Ok(match node {
            ExprNode::Literal(v) => Some(v.clone()),
            ExprNode::Var(name) => Some(vars.resolve(name)?),
            ExprNode::Correlated { level, name } => {
                Some(vars.resolve_correlated(*level, name)?)
            }
            _ => None,
        })
    }
}

// ============================================================================
// Operator semantics
// ============================================================================

fn apply_unary(op: Operator, a: Value) -> Result<Value> {
    match op {
        Operator::Not => Ok(match bool3(&a, "NOT")? {
            None => Value::Null,
            Some(b) => Value::Boolean(!b),
        }),
        other => Err(Error::Usage(format!("{:?} is not a unary operator", other))),
    }
}

fn apply_binary(op: Operator, a: Value, b: Value) -> Result<Value> {
    match op {
        Operator::Add | Operator::Sub | Operator::Mul | Operator::Div => arith(op, a, b),
        Operator::Concat => concat(a, b),
        Operator::Eq => cmp3(ComparisonOp::Eq, a, b),
        Operator::Ne => cmp3(ComparisonOp::Ne, a, b),
        Operator::Gt => cmp3(ComparisonOp::Gt, a, b),
        Operator::Lt => cmp3(ComparisonOp::Lt, a, b),
        Operator::Ge => cmp3(ComparisonOp::Ge, a, b),
        Operator::Le => cmp3(ComparisonOp::Le, a, b),
        Operator::Is => Ok(Value::Boolean(a.storage_cmp(&b) == Ordering::Equal)),
        Operator::IsNot => Ok(Value::Boolean(a.storage_cmp(&b) != Ordering::Equal)),
        Operator::Like => like3(a, b, false),
        Operator::NotLike => like3(a, b, true),
        Operator::Regex => regex3(a, b),
        Operator::And => kleene_and(a, b),
        Operator::Or => kleene_or(a, b),
        Operator::In => membership(a, b, false),
        Operator::NotIn => membership(a, b, true),
        Operator::Any(c) => quantified(c, a, b, true),
        Operator::All(c) => quantified(c, a, b, false),
        Operator::Not => Err(Error::Usage("NOT is unary".into())),
    }
}

fn arith(op: Operator, a: Value, b: Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    let overflow = || Error::Usage("numeric overflow".into());
    match (&a, &b) {
        (Value::Integer(x), Value::Integer(y)) => {
            let (x, y) = (*x, *y);
            Ok(Value::Integer(match op {
                Operator::Add => x.checked_add(y).ok_or_else(overflow)?,
                Operator::Sub => x.checked_sub(y).ok_or_else(overflow)?,
                Operator::Mul => x.checked_mul(y).ok_or_else(overflow)?,
                Operator::Div => {
                    if y == 0 {
                        return Err(Error::Usage("division by zero".into()));
                    }
                    x.checked_div(y).ok_or_else(overflow)?
                }
                _ => unreachable!(),
            }))
        }
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let x = as_f64(&a);
            let y = as_f64(&b);
            Ok(Value::Float(match op {
                Operator::Add => x + y,
                Operator::Sub => x - y,
                Operator::Mul => x * y,
                Operator::Div => {
                    if y == 0.0 {
                        return Err(Error::Usage("division by zero".into()));
                    }
                    x / y
                }
                _ => unreachable!(),
            }))
        }
        _ => Err(Error::Usage(format!(
            "cannot apply arithmetic to {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => unreachable!("checked by caller"),
    }
}

fn concat(a: Value, b: Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (a, b) {
        (Value::Text(mut x), Value::Text(y)) => {
            x.push_str(&y);
            Ok(Value::Text(x))
        }
        (a, b) => Err(Error::Usage(format!(
            "cannot concatenate {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Three-valued comparison. NULL operands yield NULL; comparing values
/// of unrelated types is a usage error.
fn cmp3(op: ComparisonOp, a: Value, b: Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    let numeric = matches!(a, Value::Integer(_) | Value::Float(_))
        && matches!(b, Value::Integer(_) | Value::Float(_));
    let comparable = numeric
        || std::mem::discriminant(&a) == std::mem::discriminant(&b);
    if !comparable {
        return Err(Error::Usage(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        )));
    }
    Ok(Value::Boolean(cmp_satisfies(a.storage_cmp(&b), op)))
}

fn cmp_satisfies(ord: Ordering, op: ComparisonOp) -> bool {
    match op {
        ComparisonOp::Eq => ord == Ordering::Equal,
        ComparisonOp::Ne => ord != Ordering::Equal,
        ComparisonOp::Gt => ord == Ordering::Greater,
        ComparisonOp::Lt => ord == Ordering::Less,
        ComparisonOp::Ge => ord != Ordering::Less,
        ComparisonOp::Le => ord != Ordering::Greater,
    }
}

fn bool3(v: &Value, what: &str) -> Result<Option<bool>> {
    match v {
        Value::Null => Ok(None),
        Value::Boolean(b) => Ok(Some(*b)),
        other => Err(Error::Usage(format!(
            "{} applied to {}",
            what,
            other.type_name()
        ))),
    }
}

fn kleene_and(a: Value, b: Value) -> Result<Value> {
    let a = bool3(&a, "AND")?;
    let b = bool3(&b, "AND")?;
    Ok(match (a, b) {
        (Some(false), _) | (_, Some(false)) => Value::Boolean(false),
        (Some(true), Some(true)) => Value::Boolean(true),
        _ => Value::Null,
    })
}

fn kleene_or(a: Value, b: Value) -> Result<Value> {
    let a = bool3(&a, "OR")?;
    let b = bool3(&b, "OR")?;
    Ok(match (a, b) {
        (Some(true), _) | (_, Some(true)) => Value::Boolean(true),
        (Some(false), Some(false)) => Value::Boolean(false),
        _ => Value::Null,
    })
}

fn like3(a: Value, b: Value, negate: bool) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (&a, &b) {
        (Value::Text(s), Value::Text(p)) => {
            let hit = like_match(s, p);
            Ok(Value::Boolean(hit != negate))
        }
        _ => Err(Error::Usage(format!(
            "LIKE applied to {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn regex3(a: Value, b: Value) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (&a, &b) {
        (Value::Text(s), Value::Text(p)) => {
            let re = regex::Regex::new(p)
                .map_err(|e| Error::Usage(format!("invalid regex pattern: {}", e)))?;
            Ok(Value::Boolean(re.is_match(s)))
        }
        _ => Err(Error::Usage(format!(
            "REGEX applied to {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// `a IN (set)` with three-valued semantics: true on a match, NULL if no
/// match but a NULL was seen, false otherwise.
fn membership(a: Value, b: Value, negate: bool) -> Result<Value> {
    let Value::Array(set) = b else {
        return Err(Error::Usage(format!(
            "IN expects an array operand, got {}",
            b.type_name()
        )));
    };
    if a.is_null() {
        return Ok(Value::Null);
    }
    let mut saw_null = false;
    for member in &set {
        match cmp3(ComparisonOp::Eq, a.clone(), member.clone())? {
            Value::Boolean(true) => return Ok(Value::Boolean(!negate)),
            Value::Null => saw_null = true,
            _ => {}
        }
    }
    Ok(if saw_null {
        Value::Null
    } else {
        Value::Boolean(negate)
    })
}

/// `a <op> ANY (set)` / `a <op> ALL (set)`.
fn quantified(op: ComparisonOp, a: Value, b: Value, any: bool) -> Result<Value> {
    let Value::Array(set) = b else {
        return Err(Error::Usage(format!(
            "ANY/ALL expect an array operand, got {}",
            b.type_name()
        )));
    };
    let mut saw_null = a.is_null();
    for member in &set {
        match cmp3(op, a.clone(), member.clone())? {
            Value::Boolean(hit) => {
                if any && hit {
                    return Ok(Value::Boolean(true));
                }
                if !any && !hit {
                    return Ok(Value::Boolean(false));
                }
            }
            Value::Null => saw_null = true,
            _ => unreachable!("cmp3 yields boolean or null"),
        }
    }
    Ok(if saw_null {
        Value::Null
    } else {
        Value::Boolean(!any)
    })
}

/// SQL LIKE match: `%` any sequence, `_` any single character, `\`
/// escapes the next pattern character.
pub(crate) fn like_match(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        let step = if pi < p.len() {
            match p[pi] {
                '%' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() => {
                    if t[ti] == p[pi + 1] {
                        Some(2)
                    } else {
                        None
                    }
                }
                '_' => Some(1),
                c => {
                    if t[ti] == c {
                        Some(1)
                    } else {
                        None
                    }
                }
            }
        } else {
            None
        };

        match step {
            Some(advance) => {
                ti += 1;
                pi += advance;
            }
            None => match star {
                Some((sp, st)) => {
                    // Let the last % swallow one more character.
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}
