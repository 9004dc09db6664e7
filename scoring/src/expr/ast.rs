//! Tagged expression tree.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

/// Named roots an expression can start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    /// The invocation input object.
    Input,
    /// Outputs of the tasks that ran (skipped tasks are absent).
    Tasks,
    /// Current element while rendering a mapped task.
    Item,
}

impl Root {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "input" => Some(Self::Input),
            "tasks" => Some(Self::Tasks),
            "item" => Some(Self::Item),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Tasks => "tasks",
            Self::Item => "item",
        }
    }
}

/// Built-in functions. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Add,
    Subtract,
    Multiply,
    Divide,
    Join,
    Length,
    Sum,
    NotNull,
}

/// Accepted argument counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Self::Exact(k) => n == k,
            Self::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(k) => write!(f, "{k}"),
            Self::AtLeast(k) => write!(f, "at least {k}"),
        }
    }
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "add" => Some(Self::Add),
            "subtract" => Some(Self::Subtract),
            "multiply" => Some(Self::Multiply),
            "divide" => Some(Self::Divide),
            "join" => Some(Self::Join),
            "length" => Some(Self::Length),
            "sum" => Some(Self::Sum),
            "not_null" => Some(Self::NotNull),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
            Self::Join => "join",
            Self::Length => "length",
            Self::Sum => "sum",
            Self::NotNull => "not_null",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            Self::Add | Self::Subtract | Self::Multiply | Self::Divide | Self::Join => {
                Arity::Exact(2)
            }
            Self::Length | Self::Sum => Arity::Exact(1),
            Self::NotNull => Arity::AtLeast(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(Root),
    Field(Box<Expr>, String),
    Index(Box<Expr>, usize),
    List(Vec<Expr>),
    Call(Function, Vec<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
}

impl Expr {
    /// Indices `i` appearing as `tasks[i]`.
    pub fn task_references(&self) -> BTreeSet<usize> {
        let mut refs = BTreeSet::new();
        self.collect_task_refs(&mut refs);
        refs
    }

    fn collect_task_refs(&self, refs: &mut BTreeSet<usize>) {
        match self {
            Expr::Index(inner, i) => {
                if matches!(inner.as_ref(), Expr::Var(Root::Tasks)) {
                    refs.insert(*i);
                } else {
                    inner.collect_task_refs(refs);
                }
            }
            Expr::Literal(_) | Expr::Var(_) => {}
            Expr::Field(inner, _) | Expr::Unary(_, inner) => inner.collect_task_refs(refs),
            Expr::List(items) | Expr::Call(_, items) => {
                for item in items {
                    item.collect_task_refs(refs);
                }
            }
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_task_refs(refs);
                rhs.collect_task_refs(refs);
            }
        }
    }

    /// Whether the bare `tasks` array is read anywhere (not just indexed).
    pub fn reads_all_tasks(&self) -> bool {
        match self {
            Expr::Var(Root::Tasks) => true,
            Expr::Index(inner, _) => match inner.as_ref() {
                Expr::Var(Root::Tasks) => false,
                other => other.reads_all_tasks(),
            },
            Expr::Literal(_) | Expr::Var(_) => false,
            Expr::Field(inner, _) | Expr::Unary(_, inner) => inner.reads_all_tasks(),
            Expr::List(items) | Expr::Call(_, items) => items.iter().any(Expr::reads_all_tasks),
            Expr::Binary(_, lhs, rhs) => lhs.reads_all_tasks() || rhs.reads_all_tasks(),
        }
    }
}
