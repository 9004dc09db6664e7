//! Load-time shape checking.
//!
//! Every expression is checked once against the shapes it will see at
//! runtime: the input object (from the input schema), the outputs of the
//! tasks it is allowed to read, and `item` inside mapped tasks. Anything that
//! could only fail as a bad path (unknown field, index past a fixed-length
//! array, task that may be skipped) is rejected here so it never turns into
//! a silent zero at runtime.

use std::collections::BTreeMap;

use serde_json::Value;

use super::ast::{BinaryOp, Expr, Function, Root, UnaryOp};
use super::ExprError;

/// Statically known structure of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Nothing known; all accesses deferred to runtime.
    Any,
    Number,
    String,
    Bool,
    Null,
    /// Object with known fields. `open` objects accept unlisted fields.
    Object {
        fields: BTreeMap<String, Shape>,
        open: bool,
    },
    /// Homogeneous array; `len` is known for fixed-length arrays.
    Array {
        element: Box<Shape>,
        len: Option<usize>,
    },
    /// Fixed-length array with per-position shapes.
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(element: Shape, len: Option<usize>) -> Self {
        Self::Array {
            element: Box::new(element),
            len,
        }
    }

    /// Output shape of an ensemble task: `{ "scores": [n numbers] }`.
    pub fn task_output(categories: usize) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "scores".to_string(),
            Shape::array(Shape::Number, Some(categories)),
        );
        Shape::Object {
            fields,
            open: false,
        }
    }

    /// Shape of a literal value.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => Shape::Null,
            Value::Bool(_) => Shape::Bool,
            Value::Number(_) => Shape::Number,
            Value::String(_) => Shape::String,
            Value::Array(items) => Shape::Tuple(items.iter().map(Shape::of_value).collect()),
            Value::Object(map) => Shape::Object {
                fields: map
                    .iter()
                    .map(|(k, v)| (k.clone(), Shape::of_value(v)))
                    .collect(),
                open: false,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Shape::Any => "any",
            Shape::Number => "number",
            Shape::String => "string",
            Shape::Bool => "boolean",
            Shape::Null => "null",
            Shape::Object { .. } => "object",
            Shape::Array { .. } | Shape::Tuple(_) => "array",
        }
    }

    fn may_be_number(&self) -> bool {
        matches!(self, Shape::Any | Shape::Number)
    }

    fn may_be_bool(&self) -> bool {
        matches!(self, Shape::Any | Shape::Bool)
    }

    fn may_be_array(&self) -> bool {
        matches!(self, Shape::Any | Shape::Array { .. } | Shape::Tuple(_))
    }

    /// Shape of the elements if this is an array of unknown position.
    pub fn element(&self) -> Shape {
        match self {
            Shape::Array { element, .. } => element.as_ref().clone(),
            Shape::Tuple(items) => match items.split_first() {
                Some((first, rest)) if rest.iter().all(|s| s == first) => first.clone(),
                _ => Shape::Any,
            },
            _ => Shape::Any,
        }
    }
}

/// What `tasks[i]` may refer to from a given expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskSlot {
    Available(Shape),
    /// Present in the function but not readable here; the reason is reported.
    Unavailable(String),
}

/// Shapes visible to one expression.
#[derive(Debug, Clone)]
pub struct ShapeEnv {
    pub input: Shape,
    pub tasks: Vec<TaskSlot>,
    pub item: Option<Shape>,
}

impl ShapeEnv {
    pub fn new(input: Shape) -> Self {
        Self {
            input,
            tasks: Vec::new(),
            item: None,
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskSlot>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_item(mut self, item: Shape) -> Self {
        self.item = Some(item);
        self
    }
}

/// Check `expr` against `env`, returning its inferred shape.
pub fn check(expr: &Expr, env: &ShapeEnv) -> Result<Shape, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(Shape::of_value(value)),
        Expr::Var(Root::Input) => Ok(env.input.clone()),
        Expr::Var(Root::Item) => env.item.clone().ok_or(ExprError::ItemOutsideMap),
        Expr::Var(Root::Tasks) => Ok(Shape::array(Shape::Any, None)),
        Expr::Field(inner, name) => {
            let shape = check(inner, env)?;
            field_shape(&shape, name, inner)
        }
        Expr::Index(inner, i) => {
            if matches!(inner.as_ref(), Expr::Var(Root::Tasks)) {
                return task_shape(env, *i);
            }
            let shape = check(inner, env)?;
            index_shape(&shape, *i, inner)
        }
        Expr::List(items) => items
            .iter()
            .map(|item| check(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Shape::Tuple),
        Expr::Call(function, args) => check_call(*function, args, env),
        Expr::Binary(op, lhs, rhs) => {
            let l = check(lhs, env)?;
            let r = check(rhs, env)?;
            if op.is_arithmetic() {
                require(l.may_be_number(), op.symbol(), "number", &l)?;
                require(r.may_be_number(), op.symbol(), "number", &r)?;
                Ok(Shape::Number)
            } else if op.is_logical() {
                require(l.may_be_bool(), op.symbol(), "boolean", &l)?;
                require(r.may_be_bool(), op.symbol(), "boolean", &r)?;
                Ok(Shape::Bool)
            } else {
                if !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    require(l.may_be_number(), op.symbol(), "number", &l)?;
                    require(r.may_be_number(), op.symbol(), "number", &r)?;
                }
                Ok(Shape::Bool)
            }
        }
        Expr::Unary(UnaryOp::Neg, operand) => {
            let shape = check(operand, env)?;
            require(shape.may_be_number(), "-", "number", &shape)?;
            Ok(Shape::Number)
        }
        Expr::Unary(UnaryOp::Not, operand) => {
            let shape = check(operand, env)?;
            require(shape.may_be_bool(), "!", "boolean", &shape)?;
            Ok(Shape::Bool)
        }
    }
}

fn require(
    ok: bool,
    operation: &str,
    expected: &'static str,
    found: &Shape,
) -> Result<(), ExprError> {
    if ok {
        Ok(())
    } else {
        Err(ExprError::TypeMismatch {
            operation: operation.to_string(),
            expected,
            found: found.name(),
        })
    }
}

fn task_shape(env: &ShapeEnv, i: usize) -> Result<Shape, ExprError> {
    match env.tasks.get(i) {
        Some(TaskSlot::Available(shape)) => Ok(shape.clone()),
        Some(TaskSlot::Unavailable(reason)) => Err(ExprError::TaskUnavailable {
            index: i,
            reason: reason.clone(),
        }),
        None => Err(ExprError::IndexOutOfBounds {
            path: "tasks".to_string(),
            index: i,
            len: env.tasks.len(),
        }),
    }
}

fn field_shape(shape: &Shape, name: &str, owner: &Expr) -> Result<Shape, ExprError> {
    match shape {
        Shape::Any => Ok(Shape::Any),
        Shape::Object { fields, open } => match fields.get(name) {
            Some(field) => Ok(field.clone()),
            None if *open => Ok(Shape::Any),
            None => Err(ExprError::UnknownField {
                path: describe(owner),
                field: name.to_string(),
            }),
        },
        other => Err(ExprError::TypeMismatch {
            operation: format!(".{name}"),
            expected: "object",
            found: other.name(),
        }),
    }
}

fn index_shape(shape: &Shape, i: usize, owner: &Expr) -> Result<Shape, ExprError> {
    let out_of_bounds = |len| ExprError::IndexOutOfBounds {
        path: describe(owner),
        index: i,
        len,
    };
    match shape {
        Shape::Any => Ok(Shape::Any),
        Shape::Array { element, len } => match len {
            Some(n) if i >= *n => Err(out_of_bounds(*n)),
            _ => Ok(element.as_ref().clone()),
        },
        Shape::Tuple(items) => items.get(i).cloned().ok_or_else(|| out_of_bounds(items.len())),
        other => Err(ExprError::TypeMismatch {
            operation: format!("[{i}]"),
            expected: "array",
            found: other.name(),
        }),
    }
}

fn check_call(function: Function, args: &[Expr], env: &ShapeEnv) -> Result<Shape, ExprError> {
    let shapes = args
        .iter()
        .map(|arg| check(arg, env))
        .collect::<Result<Vec<_>, _>>()?;
    let name = function.name();
    match function {
        Function::Add | Function::Subtract | Function::Multiply | Function::Divide => {
            for shape in &shapes {
                require(shape.may_be_number(), name, "number", shape)?;
            }
            Ok(Shape::Number)
        }
        Function::Join => {
            require(
                matches!(shapes[0], Shape::Any | Shape::String),
                name,
                "string",
                &shapes[0],
            )?;
            require(shapes[1].may_be_array(), name, "array", &shapes[1])?;
            Ok(Shape::String)
        }
        Function::Length => {
            require(
                matches!(
                    shapes[0],
                    Shape::Any
                        | Shape::String
                        | Shape::Object { .. }
                        | Shape::Array { .. }
                        | Shape::Tuple(_)
                ),
                name,
                "string, array or object",
                &shapes[0],
            )?;
            Ok(Shape::Number)
        }
        Function::Sum => {
            require(shapes[0].may_be_array(), name, "array", &shapes[0])?;
            Ok(Shape::Number)
        }
        Function::NotNull => Ok(Shape::Any),
    }
}

/// Short source-like rendering of a path, for error messages.
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Var(root) => root.name().to_string(),
        Expr::Field(inner, name) => format!("{}.{name}", describe(inner)),
        Expr::Index(inner, i) => format!("{}[{i}]", describe(inner)),
        Expr::Call(function, _) => format!("{}(..)", function.name()),
        Expr::Literal(_) => "literal".to_string(),
        Expr::List(_) => "[..]".to_string(),
        Expr::Binary(op, _, _) => format!("(.. {} ..)", op.symbol()),
        Expr::Unary(_, _) => "(..)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;

    fn email_input() -> Shape {
        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), Shape::String);
        fields.insert("context".to_string(), Shape::String);
        Shape::Object {
            fields,
            open: false,
        }
    }

    fn env_with_one_task() -> ShapeEnv {
        ShapeEnv::new(email_input())
            .with_tasks(vec![TaskSlot::Available(Shape::task_output(4))])
    }

    fn check_src(src: &str, env: &ShapeEnv) -> Result<Shape, ExprError> {
        check(&parse(src).unwrap(), env)
    }

    #[test]
    fn formula_within_bounds_is_number() {
        let shape = check_src(
            "tasks[0].scores[0] + 0.66 * tasks[0].scores[1] + 0.33 * tasks[0].scores[2]",
            &env_with_one_task(),
        )
        .unwrap();
        assert_eq!(shape, Shape::Number);
    }

    #[test]
    fn category_index_past_responses_rejected() {
        let err = check_src("tasks[0].scores[4]", &env_with_one_task()).unwrap_err();
        assert!(matches!(
            err,
            ExprError::IndexOutOfBounds { index: 4, len: 4, ref path } if path == "tasks[0].scores"
        ));
    }

    #[test]
    fn task_index_past_tasks_rejected() {
        let err = check_src("tasks[1].scores[0]", &env_with_one_task()).unwrap_err();
        assert!(matches!(err, ExprError::IndexOutOfBounds { index: 1, len: 1, .. }));
    }

    #[test]
    fn unknown_input_field_rejected() {
        let err = check_src("input.subject", &env_with_one_task()).unwrap_err();
        assert!(matches!(err, ExprError::UnknownField { ref field, .. } if field == "subject"));
    }

    #[test]
    fn unavailable_task_reports_reason() {
        let env = ShapeEnv::new(email_input())
            .with_tasks(vec![TaskSlot::Unavailable("task may be skipped".into())]);
        let err = check_src("tasks[0].scores[0]", &env).unwrap_err();
        assert!(err.to_string().contains("may be skipped"));
    }

    #[test]
    fn join_requires_string_separator() {
        let env = env_with_one_task();
        assert_eq!(
            check_src("join(', ', [input.email, input.context])", &env).unwrap(),
            Shape::String
        );
        assert!(check_src("join(1, [input.email])", &env).is_err());
    }

    #[test]
    fn arithmetic_on_strings_rejected() {
        let err = check_src("add(input.email, 1)", &env_with_one_task()).unwrap_err();
        assert!(matches!(err, ExprError::TypeMismatch { expected: "number", found: "string", .. }));
    }

    #[test]
    fn item_only_inside_map() {
        let env = env_with_one_task();
        assert!(matches!(check_src("item", &env), Err(ExprError::ItemOutsideMap)));
        let mapped = env.with_item(Shape::String);
        assert_eq!(check_src("item", &mapped).unwrap(), Shape::String);
    }

    #[test]
    fn open_objects_defer_unknown_fields() {
        let env = ShapeEnv::new(Shape::Object {
            fields: BTreeMap::new(),
            open: true,
        });
        assert_eq!(check_src("input.anything.deeper[3]", &env).unwrap(), Shape::Any);
    }

    #[test]
    fn skip_predicate_shapes() {
        let env = env_with_one_task();
        assert_eq!(
            check_src("length(input.email) > 200 && !(input.context == '')", &env).unwrap(),
            Shape::Bool
        );
        assert!(check_src("!input.email", &env).is_err());
    }

    #[test]
    fn mapped_task_elements_checked_by_shape() {
        let env = ShapeEnv::new(email_input()).with_tasks(vec![TaskSlot::Available(
            Shape::array(Shape::task_output(2), None),
        )]);
        assert_eq!(check_src("tasks[0][5].scores[1]", &env).unwrap(), Shape::Number);
        assert!(check_src("tasks[0][5].scores[2]", &env).is_err());
    }
}
