//! Expression programs.
//!
//! An expression is a post-order sequence of nodes evaluated by the
//! stack machine in [`crate::expr::Evaluator`]. Programs cross module
//! boundaries (check constraints persist inside table definitions), so
//! they carry an explicit tag-length-value binary encoding over the
//! closed set of node kinds rather than relying on any ambient
//! serializer.

use crate::common::value::{read_slice, read_u32, read_u8};
use crate::common::{Error, Result, Value};

/// Comparison operator embedded in quantified (`ANY`/`ALL`) operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl ComparisonOp {
    fn code(self) -> u8 {
        match self {
            ComparisonOp::Eq => 1,
            ComparisonOp::Ne => 2,
            ComparisonOp::Gt => 3,
            ComparisonOp::Lt => 4,
            ComparisonOp::Ge => 5,
            ComparisonOp::Le => 6,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => ComparisonOp::Eq,
            2 => ComparisonOp::Ne,
            3 => ComparisonOp::Gt,
            4 => ComparisonOp::Lt,
            5 => ComparisonOp::Ge,
            6 => ComparisonOp::Le,
            _ => return Err(Error::Corruption(format!("bad comparison code {}", code))),
        })
    }
}

/// Operators understood by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    // Comparison
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Is,
    IsNot,
    // Pattern
    Like,
    NotLike,
    Regex,
    // Logical (Kleene)
    And,
    Or,
    Not,
    // Set
    In,
    NotIn,
    Any(ComparisonOp),
    All(ComparisonOp),
}

impl Operator {
    /// Number of operands popped from the stack.
    pub fn arity(&self) -> usize {
        match self {
            Operator::Not => 1,
            _ => 2,
        }
    }

    fn codes(self) -> (u8, u8) {
        match self {
            Operator::Add => (1, 0),
            Operator::Sub => (2, 0),
            Operator::Mul => (3, 0),
            Operator::Div => (4, 0),
            Operator::Concat => (5, 0),
            Operator::Eq => (6, 0),
            Operator::Ne => (7, 0),
            Operator::Gt => (8, 0),
            Operator::Lt => (9, 0),
            Operator::Ge => (10, 0),
            Operator::Le => (11, 0),
            Operator::Is => (12, 0),
            Operator::IsNot => (13, 0),
            Operator::Like => (14, 0),
            Operator::NotLike => (15, 0),
            Operator::Regex => (16, 0),
            Operator::And => (17, 0),
            Operator::Or => (18, 0),
            Operator::Not => (19, 0),
            Operator::In => (20, 0),
            Operator::NotIn => (21, 0),
            Operator::Any(c) => (22, c.code()),
            Operator::All(c) => (23, c.code()),
        }
    }

    fn from_codes(code: u8, sub: u8) -> Result<Self> {
        Ok(match code {
            1 => Operator::Add,
            2 => Operator::Sub,
            3 => Operator::Mul,
            4 => Operator::Div,
            5 => Operator::Concat,
            6 => Operator::Eq,
            7 => Operator::Ne,
            8 => Operator::Gt,
            9 => Operator::Lt,
            10 => Operator::Ge,
            11 => Operator::Le,
            12 => Operator::Is,
            13 => Operator::IsNot,
            14 => Operator::Like,
            15 => Operator::NotLike,
            16 => Operator::Regex,
            17 => Operator::And,
            18 => Operator::Or,
            19 => Operator::Not,
            20 => Operator::In,
            21 => Operator::NotIn,
            22 => Operator::Any(ComparisonOp::from_code(sub)?),
            23 => Operator::All(ComparisonOp::from_code(sub)?),
            _ => return Err(Error::Corruption(format!("bad operator code {}", code))),
        })
    }
}

/// One node of a post-order expression program.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    /// A constant value.
    Literal(Value),
    /// Reference to a column of the current row, resolved by name.
    Var(String),
    /// Reference into an enclosing query level.
    Correlated { level: u32, name: String },
    /// Function call over the preceding `argc` stack entries.
    Function { name: String, argc: u32 },
    /// Operator over the preceding `arity()` stack entries.
    Op(Operator),
}

// TLV node tags.
const NODE_LITERAL: u8 = 1;
const NODE_VAR: u8 = 2;
const NODE_CORRELATED: u8 = 3;
const NODE_FUNCTION: u8 = 4;
const NODE_OP: u8 = 5;

/// A validated post-order expression program.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    nodes: Vec<ExprNode>,
}

impl Expression {
    /// Build an expression from a node sequence, validating stack
    /// discipline (every operator has its operands, one result remains).
    pub fn from_nodes(nodes: Vec<ExprNode>) -> Result<Expression> {
        let mut depth: usize = 0;
        for node in &nodes {
            let (pops, pushes) = match node {
                ExprNode::Literal(_) | ExprNode::Var(_) | ExprNode::Correlated { .. } => (0, 1),
                ExprNode::Function { argc, .. } => (*argc as usize, 1),
                ExprNode::Op(op) => (op.arity(), 1),
            };
            if depth < pops {
                return Err(Error::Usage(format!(
                    "malformed expression: {:?} needs {} operands, {} available",
                    node, pops, depth
                )));
            }
            depth = depth - pops + pushes;
        }
        if depth != 1 {
            return Err(Error::Usage(format!(
                "malformed expression: {} values left on the stack",
                depth
            )));
        }
        Ok(Expression { nodes })
    }

    /// The node sequence, in post order.
    pub fn nodes(&self) -> &[ExprNode] {
        &self.nodes
    }

    // ------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------

    /// A constant expression.
    pub fn literal(v: Value) -> Expression {
        Expression {
            nodes: vec![ExprNode::Literal(v)],
        }
    }

    /// A column reference.
    pub fn var(name: &str) -> Expression {
        Expression {
            nodes: vec![ExprNode::Var(name.to_string())],
        }
    }

    /// `lhs op rhs` in post order.
    pub fn binary(lhs: Expression, op: Operator, rhs: Expression) -> Expression {
        debug_assert_eq!(op.arity(), 2);
        let mut nodes = lhs.nodes;
        nodes.extend(rhs.nodes);
        nodes.push(ExprNode::Op(op));
        Expression { nodes }
    }

    /// `op operand` in post order.
    pub fn unary(op: Operator, operand: Expression) -> Expression {
        debug_assert_eq!(op.arity(), 1);
        let mut nodes = operand.nodes;
        nodes.push(ExprNode::Op(op));
        Expression { nodes }
    }

    /// A function call.
    pub fn function(name: &str, args: Vec<Expression>) -> Expression {
        let argc = args.len() as u32;
        let mut nodes = Vec::new();
        for arg in args {
            nodes.extend(arg.nodes);
        }
        nodes.push(ExprNode::Function {
            name: name.to_string(),
            argc,
        });
        Expression { nodes }
    }

    // ------------------------------------------------------------------
    // Binary codec
    // ------------------------------------------------------------------

    /// Encode to the TLV binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.nodes.len() as u32).to_be_bytes());
        for node in &self.nodes {
            let mut payload = Vec::new();
            let tag = match node {
                ExprNode::Literal(v) => {
                    v.encode(&mut payload);
                    NODE_LITERAL
                }
                ExprNode::Var(name) => {
                    payload.extend_from_slice(name.as_bytes());
                    NODE_VAR
                }
                ExprNode::Correlated { level, name } => {
                    payload.extend_from_slice(&level.to_be_bytes());
                    payload.extend_from_slice(name.as_bytes());
                    NODE_CORRELATED
                }
                ExprNode::Function { name, argc } => {
                    payload.extend_from_slice(&argc.to_be_bytes());
                    payload.extend_from_slice(name.as_bytes());
                    NODE_FUNCTION
                }
                ExprNode::Op(op) => {
                    let (code, sub) = op.codes();
                    payload.push(code);
                    payload.push(sub);
                    NODE_OP
                }
            };
            out.push(tag);
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }

    /// Decode an expression produced by [`Expression::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Expression> {
        let mut pos = 0usize;
        let count = read_u32(bytes, &mut pos)? as usize;
        let mut nodes = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let tag = read_u8(bytes, &mut pos)?;
            let len = read_u32(bytes, &mut pos)? as usize;
            let payload = read_slice(bytes, &mut pos, len)?;
            let node = match tag {
                NODE_LITERAL => {
                    let mut p = 0usize;
                    ExprNode::Literal(Value::decode(payload, &mut p)?)
                }
                NODE_VAR => ExprNode::Var(utf8(payload)?),
                NODE_CORRELATED => {
                    let mut p = 0usize;
                    let level = read_u32(payload, &mut p)?;
                    ExprNode::Correlated {
                        level,
                        name: utf8(&payload[p..])?,
                    }
                }
                NODE_FUNCTION => {
                    let mut p = 0usize;
                    let argc = read_u32(payload, &mut p)?;
                    ExprNode::Function {
                        argc,
                        name: utf8(&payload[p..])?,
                    }
                }
                NODE_OP => {
                    if payload.len() != 2 {
                        return Err(Error::Corruption("bad operator payload".into()));
                    }
                    ExprNode::Op(Operator::from_codes(payload[0], payload[1])?)
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "unknown expression node tag {}",
                        tag
                    )))
                }
            };
            nodes.push(node);
        }
        Expression::from_nodes(nodes)
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Corruption("invalid utf-8 in expression".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Expression {
        // (id = 1) AND (name LIKE 'a%')
        Expression::binary(
            Expression::binary(
                Expression::var("id"),
                Operator::Eq,
                Expression::literal(Value::Integer(1)),
            ),
            Operator::And,
            Expression::binary(
                Expression::var("name"),
                Operator::Like,
                Expression::literal(Value::Text("a%".into())),
            ),
        )
    }

    #[test]
    fn test_builder_produces_post_order() {
        let expr = sample();
        assert_eq!(expr.nodes().len(), 7);
        assert!(matches!(expr.nodes()[2], ExprNode::Op(Operator::Eq)));
        assert!(matches!(expr.nodes()[6], ExprNode::Op(Operator::And)));
    }

    #[test]
    fn test_validation_rejects_starved_operator() {
        let err = Expression::from_nodes(vec![
            ExprNode::Literal(Value::Integer(1)),
            ExprNode::Op(Operator::Add),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_validation_rejects_dangling_values() {
        let err = Expression::from_nodes(vec![
            ExprNode::Literal(Value::Integer(1)),
            ExprNode::Literal(Value::Integer(2)),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_codec_roundtrip() {
        let expr = sample();
        let decoded = Expression::decode(&expr.encode()).unwrap();
        assert_eq!(decoded, expr);
    }

    #[test]
    fn test_codec_roundtrip_exotic_nodes() {
        let expr = Expression::from_nodes(vec![
            ExprNode::Correlated {
                level: 2,
                name: "outer_id".into(),
            },
            ExprNode::Literal(Value::Array(vec![Value::Integer(1), Value::Integer(2)])),
            ExprNode::Op(Operator::Any(ComparisonOp::Ge)),
            ExprNode::Function {
                name: "upper".into(),
                argc: 1,
            },
        ])
        .unwrap();
        let decoded = Expression::decode(&expr.encode()).unwrap();
        assert_eq!(decoded, expr);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Expression::decode(&[0, 0, 0, 1, 99, 0, 0, 0, 0]).is_err());
    }
}
