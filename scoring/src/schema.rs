//! Input schema checking.
//!
//! Supports the JSON-schema subset function definitions actually use:
//! `type` (single or list), `properties`, `required`, `items`, `enum` and
//! `additionalProperties` (boolean). The schema is compiled once at load
//! time; validation returns the first violation with its JSON path.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{ConfigError, ConfigResult};
use crate::expr::Shape;

/// An input value that does not satisfy the function's schema.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{path}: {message}")]
pub struct SchemaViolation {
    /// JSON path of the offending value, rooted at `input`.
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl JsonType {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }
}

/// Compiled schema node.
#[derive(Debug, Clone, Default)]
struct Node {
    types: Vec<JsonType>,
    properties: BTreeMap<String, Node>,
    required: Vec<String>,
    additional: bool,
    items: Option<Box<Node>>,
    allowed: Option<Vec<Value>>,
}

impl Node {
    fn compile(schema: &Value, path: &str) -> ConfigResult<Self> {
        let obj = match schema {
            Value::Object(obj) => obj,
            Value::Bool(true) | Value::Null => {
                return Ok(Self {
                    additional: true,
                    ..Self::default()
                })
            }
            other => {
                return Err(ConfigError::Schema(format!(
                    "{path}: schema must be an object, found {other}"
                )))
            }
        };

        let types = match obj.get("type") {
            None => Vec::new(),
            Some(Value::String(name)) => vec![parse_type(name, path)?],
            Some(Value::Array(names)) => names
                .iter()
                .map(|v| match v {
                    Value::String(name) => parse_type(name, path),
                    other => Err(ConfigError::Schema(format!(
                        "{path}: type entries must be strings, found {other}"
                    ))),
                })
                .collect::<ConfigResult<_>>()?,
            Some(other) => {
                return Err(ConfigError::Schema(format!(
                    "{path}: 'type' must be a string or list, found {other}"
                )))
            }
        };

        let mut properties = BTreeMap::new();
        if let Some(props) = obj.get("properties") {
            let props = props.as_object().ok_or_else(|| {
                ConfigError::Schema(format!("{path}: 'properties' must be an object"))
            })?;
            for (name, sub) in props {
                properties.insert(name.clone(), Node::compile(sub, &format!("{path}.{name}"))?);
            }
        }

        let required = match obj.get("required") {
            None => Vec::new(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        ConfigError::Schema(format!("{path}: 'required' entries must be strings"))
                    })
                })
                .collect::<ConfigResult<_>>()?,
            Some(_) => {
                return Err(ConfigError::Schema(format!(
                    "{path}: 'required' must be a list"
                )))
            }
        };

        let additional = match obj.get("additionalProperties") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(ConfigError::Schema(format!(
                    "{path}: only boolean 'additionalProperties' is supported"
                )))
            }
        };

        let items = obj
            .get("items")
            .map(|sub| Node::compile(sub, &format!("{path}[]")).map(Box::new))
            .transpose()?;

        let allowed = match obj.get("enum") {
            None => None,
            Some(Value::Array(values)) if !values.is_empty() => Some(values.clone()),
            Some(_) => {
                return Err(ConfigError::Schema(format!(
                    "{path}: 'enum' must be a non-empty list"
                )))
            }
        };

        Ok(Self {
            types,
            properties,
            required,
            additional,
            items,
            allowed,
        })
    }

    fn validate(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        if !self.types.is_empty() && !self.types.iter().any(|t| t.matches(value)) {
            let expected: Vec<&str> = self.types.iter().map(|t| t.name()).collect();
            return Err(SchemaViolation::new(
                path,
                format!("expected {}, found {}", expected.join(" or "), kind_of(value)),
            ));
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(SchemaViolation::new(path, "value is not one of the allowed values"));
            }
        }

        match value {
            Value::Object(map) => self.validate_object(map, path),
            Value::Array(items) => match &self.items {
                Some(node) => items
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, item)| node.validate(item, &format!("{path}[{i}]"))),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn validate_object(&self, map: &Map<String, Value>, path: &str) -> Result<(), SchemaViolation> {
        for name in &self.required {
            if !map.contains_key(name) {
                return Err(SchemaViolation::new(
                    path,
                    format!("missing required property '{name}'"),
                ));
            }
        }
        for (name, value) in map {
            match self.properties.get(name) {
                Some(node) => node.validate(value, &format!("{path}.{name}"))?,
                None if !self.additional => {
                    return Err(SchemaViolation::new(
                        path,
                        format!("unexpected property '{name}'"),
                    ))
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Shape expressions may assume after validation succeeded.
    fn shape(&self) -> Shape {
        let single = match self.types.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        match single {
            Some(JsonType::String) => Shape::String,
            Some(JsonType::Number | JsonType::Integer) => Shape::Number,
            Some(JsonType::Boolean) => Shape::Bool,
            Some(JsonType::Null) => Shape::Null,
            Some(JsonType::Array) => Shape::array(
                self.items.as_ref().map_or(Shape::Any, |n| n.shape()),
                None,
            ),
            // Declared properties are the readable surface; a property-less
            // object schema leaves fields to runtime.
            Some(JsonType::Object) => Shape::Object {
                fields: self
                    .properties
                    .iter()
                    .map(|(name, node)| (name.clone(), node.shape()))
                    .collect(),
                open: self.properties.is_empty(),
            },
            _ => Shape::Any,
        }
    }
}

fn parse_type(name: &str, path: &str) -> ConfigResult<JsonType> {
    JsonType::from_name(name)
        .ok_or_else(|| ConfigError::Schema(format!("{path}: unknown type '{name}'")))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A function's compiled input schema.
#[derive(Debug, Clone)]
pub struct InputSchema {
    raw: Value,
    root: Node,
}

impl InputSchema {
    pub fn new(schema: Value) -> ConfigResult<Self> {
        let root = Node::compile(&schema, "input")?;
        Ok(Self { raw: schema, root })
    }

    /// Schema that accepts any input.
    pub fn any() -> Self {
        Self {
            raw: Value::Null,
            root: Node {
                additional: true,
                ..Node::default()
            },
        }
    }

    pub fn validate(&self, input: &Value) -> Result<(), SchemaViolation> {
        self.root.validate(input, "input")
    }

    /// Static shape of validated inputs.
    pub fn shape(&self) -> Shape {
        self.root.shape()
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}
