//! Row-level expression evaluation.
//!
//! Expression programs are post-order node sequences with a stable
//! binary codec; the evaluator is a per-instance stack machine with
//! three-valued null semantics. Functions resolve through an explicit
//! registry populated at startup.

mod evaluator;
mod functions;
mod program;

pub use evaluator::{Evaluator, GroupResolver, NoColumns, VariableResolver};
pub use functions::{
    AggregateHandler, FunctionDef, FunctionKind, FunctionRegistry, ScalarHandler,
};
pub use program::{ComparisonOp, ExprNode, Expression, Operator};
