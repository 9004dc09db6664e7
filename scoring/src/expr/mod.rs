//! Expression language for prompt rendering, `skip`/`map` predicates and
//! output formulas.
//!
//! ```text
//! source ──parse──▶ Expr ──check(ShapeEnv)──▶ Shape      (once, at load)
//!                    │
//!                    └──evaluate(Scope)──▶ serde_json::Value   (per invocation)
//! ```
//!
//! The language is a closed, loop-free subset in the JMESPath style: paths
//! (`input.email`, `tasks[0].scores[1]`), raw strings (`'..'`), JSON
//! literals (`` `0.66` ``), list construction, the functions `add`,
//! `subtract`, `multiply`, `divide`, `join`, `length`, `sum`, `not_null`,
//! and infix arithmetic / comparison / boolean operators. Evaluation cost is
//! proportional to expression size.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod validate;

use std::fmt;

use serde_json::Value;
use thiserror::Error;

pub use ast::{Arity, BinaryOp, Expr, Function, Root, UnaryOp};
pub use eval::{evaluate, Scope};
pub use parser::parse;
pub use validate::{check, Shape, ShapeEnv, TaskSlot};

/// Rejections raised while parsing or statically checking an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unknown variable '{name}' at offset {pos} (expected input, tasks or item)")]
    UnknownVariable { name: String, pos: usize },

    #[error("{function}() takes {expected} argument(s), got {found}")]
    Arity {
        function: &'static str,
        expected: Arity,
        found: usize,
    },

    #[error("{path} has no field '{field}'")]
    UnknownField { path: String, field: String },

    #[error("index {index} out of bounds for {path} (length {len})")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("tasks[{index}] cannot be read here: {reason}")]
    TaskUnavailable { index: usize, reason: String },

    #[error("'item' is only bound inside a mapped task")]
    ItemOutsideMap,

    #[error("{operation} expects {expected}, found {found}")]
    TypeMismatch {
        operation: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Failures while evaluating a checked expression against concrete values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("{operation} expects {expected}, found {found}")]
    TypeMismatch {
        operation: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NonFinite,

    #[error("'item' is not bound")]
    NoItem,
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    expr: Expr,
}

impl CompiledExpr {
    pub fn parse(source: impl Into<String>) -> Result<Self, ExprError> {
        let source = source.into();
        let expr = parse(&source)?;
        Ok(Self { source, expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn check(&self, env: &ShapeEnv) -> Result<Shape, ExprError> {
        check(&self.expr, env)
    }

    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<Value, EvalError> {
        evaluate(&self.expr, scope)
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
