//! Pure evaluator over `serde_json::Value`.
//!
//! Paths borrow from the scope where possible; only computed values
//! (arithmetic results, joined strings, list literals) allocate.

use std::borrow::Cow;

use serde_json::Value;

use super::ast::{BinaryOp, Expr, Function, Root, UnaryOp};
use super::EvalError;

/// Values an expression can read.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub input: &'a Value,
    pub tasks: &'a Value,
    pub item: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn new(input: &'a Value, tasks: &'a Value) -> Self {
        Self {
            input,
            tasks,
            item: None,
        }
    }

    pub fn with_item(self, item: &'a Value) -> Self {
        Self {
            item: Some(item),
            ..self
        }
    }
}

/// Evaluate `expr` in `scope`.
pub fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<Value, EvalError> {
    eval(expr, scope).map(Cow::into_owned)
}

fn eval<'a>(expr: &Expr, scope: &Scope<'a>) -> Result<Cow<'a, Value>, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(Cow::Owned(value.clone())),
        Expr::Var(Root::Input) => Ok(Cow::Borrowed(scope.input)),
        Expr::Var(Root::Tasks) => Ok(Cow::Borrowed(scope.tasks)),
        Expr::Var(Root::Item) => scope.item.map(Cow::Borrowed).ok_or(EvalError::NoItem),
        Expr::Field(inner, name) => match eval(inner, scope)? {
            Cow::Borrowed(value) => field(value, name).map(Cow::Borrowed),
            Cow::Owned(value) => field(&value, name).map(|v| Cow::Owned(v.clone())),
        },
        Expr::Index(inner, i) => match eval(inner, scope)? {
            Cow::Borrowed(value) => index(value, *i).map(Cow::Borrowed),
            Cow::Owned(value) => index(&value, *i).map(|v| Cow::Owned(v.clone())),
        },
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(|values| Cow::Owned(Value::Array(values))),
        Expr::Call(function, args) => call(*function, args, scope).map(Cow::Owned),
        Expr::Binary(op, lhs, rhs) => binary(*op, lhs, rhs, scope).map(Cow::Owned),
        Expr::Unary(UnaryOp::Neg, operand) => {
            let value = eval(operand, scope)?;
            number(-as_number(&value, "-")?).map(Cow::Owned)
        }
        Expr::Unary(UnaryOp::Not, operand) => {
            let value = eval(operand, scope)?;
            Ok(Cow::Owned(Value::Bool(!as_bool(&value, "!")?)))
        }
    }
}

fn field<'v>(value: &'v Value, name: &str) -> Result<&'v Value, EvalError> {
    match value {
        Value::Object(map) => map
            .get(name)
            .ok_or_else(|| EvalError::MissingField(name.to_string())),
        other => Err(EvalError::TypeMismatch {
            operation: format!(".{name}"),
            expected: "object",
            found: type_name(other),
        }),
    }
}

fn index(value: &Value, i: usize) -> Result<&Value, EvalError> {
    match value {
        Value::Array(items) => items.get(i).ok_or(EvalError::IndexOutOfBounds {
            index: i,
            len: items.len(),
        }),
        other => Err(EvalError::TypeMismatch {
            operation: format!("[{i}]"),
            expected: "array",
            found: type_name(other),
        }),
    }
}

fn call(function: Function, args: &[Expr], scope: &Scope<'_>) -> Result<Value, EvalError> {
    let name = function.name();
    match function {
        Function::Add | Function::Subtract | Function::Multiply | Function::Divide => {
            let a = as_number(&*eval(&args[0], scope)?, name)?;
            let b = as_number(&*eval(&args[1], scope)?, name)?;
            let op = match function {
                Function::Add => BinaryOp::Add,
                Function::Subtract => BinaryOp::Sub,
                Function::Multiply => BinaryOp::Mul,
                _ => BinaryOp::Div,
            };
            arithmetic(op, a, b)
        }
        Function::Join => {
            let sep = eval(&args[0], scope)?;
            let sep = sep.as_str().ok_or_else(|| EvalError::TypeMismatch {
                operation: name.to_string(),
                expected: "string",
                found: type_name(&sep),
            })?;
            let list = eval(&args[1], scope)?;
            let items = as_array(&list, name)?;
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.push(item.as_str().ok_or_else(|| EvalError::TypeMismatch {
                    operation: name.to_string(),
                    expected: "string",
                    found: type_name(item),
                })?);
            }
            Ok(Value::String(parts.join(sep)))
        }
        Function::Length => {
            let value = eval(&args[0], scope)?;
            let len = match &*value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(EvalError::TypeMismatch {
                        operation: name.to_string(),
                        expected: "string, array or object",
                        found: type_name(other),
                    })
                }
            };
            Ok(Value::from(len))
        }
        Function::Sum => {
            let list = eval(&args[0], scope)?;
            let total = as_array(&list, name)?
                .iter()
                .map(|item| as_number(item, name))
                .sum::<Result<f64, _>>()?;
            number(total)
        }
        Function::NotNull => {
            for arg in args {
                let value = eval(arg, scope)?;
                if !value.is_null() {
                    return Ok(value.into_owned());
                }
            }
            Ok(Value::Null)
        }
    }
}

fn binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, scope: &Scope<'_>) -> Result<Value, EvalError> {
    let symbol = op.symbol();
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            let a = as_number(&*eval(lhs, scope)?, symbol)?;
            let b = as_number(&*eval(rhs, scope)?, symbol)?;
            arithmetic(op, a, b)
        }
        BinaryOp::And => {
            // short-circuit
            if !as_bool(&*eval(lhs, scope)?, symbol)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&*eval(rhs, scope)?, symbol)?))
        }
        BinaryOp::Or => {
            if as_bool(&*eval(lhs, scope)?, symbol)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&*eval(rhs, scope)?, symbol)?))
        }
        BinaryOp::Eq | BinaryOp::Ne => {
            let a = eval(lhs, scope)?;
            let b = eval(rhs, scope)?;
            let equal = match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            };
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let a = as_number(&*eval(lhs, scope)?, symbol)?;
            let b = as_number(&*eval(rhs, scope)?, symbol)?;
            let result = match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            };
            Ok(Value::Bool(result))
        }
    }
}

fn arithmetic(op: BinaryOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
    };
    number(result)
}

fn number(n: f64) -> Result<Value, EvalError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or(EvalError::NonFinite)
}

fn as_number(value: &Value, operation: &str) -> Result<f64, EvalError> {
    value.as_f64().ok_or_else(|| EvalError::TypeMismatch {
        operation: operation.to_string(),
        expected: "number",
        found: type_name(value),
    })
}

fn as_bool(value: &Value, operation: &str) -> Result<bool, EvalError> {
    value.as_bool().ok_or_else(|| EvalError::TypeMismatch {
        operation: operation.to_string(),
        expected: "boolean",
        found: type_name(value),
    })
}

fn as_array<'v>(value: &'v Value, operation: &str) -> Result<&'v Vec<Value>, EvalError> {
    value.as_array().ok_or_else(|| EvalError::TypeMismatch {
        operation: operation.to_string(),
        expected: "array",
        found: type_name(value),
    })
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
