//! Argument validation against a tool's advertised input schema.
//!
//! Only the subset tool servers use in practice is understood: `type`,
//! `properties`, `required`, `enum`, and `additionalProperties: false`.
//! Keywords outside that subset are ignored rather than rejected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One way an argument fails its schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum ViolationKind {
    Missing,
    WrongType { expected: String, found: String },
    NotAllowed { allowed: Vec<String> },
    Unknown,
}

/// A schema violation for one field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl Violation {
    pub fn new(field: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "{}: missing required field", self.field),
            ViolationKind::WrongType { expected, found } => {
                write!(f, "{}: expected {expected}, found {found}", self.field)
            }
            ViolationKind::NotAllowed { allowed } => {
                write!(f, "{}: must be one of {}", self.field, allowed.join(", "))
            }
            ViolationKind::Unknown => write!(f, "{}: unknown field", self.field),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            "null" => Self::Null,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            (Self::Null, Value::Null) => true,
            _ => false,
        }
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Default)]
struct Property {
    /// Empty means any type.
    types: Vec<JsonType>,
    allowed: Option<Vec<Value>>,
}

impl Property {
    fn compile(value: &Value) -> Self {
        let types = match value.get("type") {
            Some(Value::String(name)) => JsonType::parse(name).into_iter().collect(),
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(Value::as_str)
                .filter_map(JsonType::parse)
                .collect(),
            _ => Vec::new(),
        };
        let allowed = value.get("enum").and_then(Value::as_array).cloned();
        Self { types, allowed }
    }

    fn check(&self, field: &str, value: &Value, out: &mut Vec<Violation>) {
        if !self.types.is_empty() && !self.types.iter().any(|t| t.matches(value)) {
            let expected = self
                .types
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(" or ");
            out.push(Violation::new(field, ViolationKind::WrongType {
                expected,
                found: type_of(value).to_string(),
            }));
            return;
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                out.push(Violation::new(field, ViolationKind::NotAllowed {
                    allowed: allowed.iter().map(Value::to_string).collect(),
                }));
            }
        }
    }
}

/// A compiled object schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    properties: BTreeMap<String, Property>,
    required: Vec<String>,
    closed: bool,
}

impl Schema {
    /// Compile an advertised schema. Anything that is not an object schema
    /// compiles to one that accepts every argument mapping.
    pub fn compile(schema: &Value) -> Self {
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), Property::compile(prop)))
                    .collect()
            })
            .unwrap_or_default();
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
        Self {
            properties,
            required,
            closed,
        }
    }

    /// Every violation in `arguments`, ordered by field name.
    pub fn validate(&self, arguments: &Map<String, Value>) -> Vec<Violation> {
        let mut violations = Vec::new();
        for name in &self.required {
            if !arguments.contains_key(name) {
                violations.push(Violation::new(name.clone(), ViolationKind::Missing));
            }
        }
        for (name, value) in arguments {
            match self.properties.get(name) {
                Some(prop) => prop.check(name, value, &mut violations),
                None if self.closed => {
                    violations.push(Violation::new(name.clone(), ViolationKind::Unknown))
                }
                None => {}
            }
        }
        violations.sort();
        violations.dedup();
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn add_schema() -> Schema {
        Schema::compile(&json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        }))
    }

    #[test]
    fn valid_arguments_pass() {
        assert!(add_schema().validate(&args(json!({"a": 3, "b": 4.5}))).is_empty());
    }

    #[test]
    fn reports_every_violation_sorted_by_field() {
        let violations = add_schema().validate(&args(json!({"b": "four"})));
        assert_eq!(violations, vec![
            Violation::new("a", ViolationKind::Missing),
            Violation::new("b", ViolationKind::WrongType {
                expected: "number".into(),
                found: "string".into(),
            }),
        ]);
    }

    #[test]
    fn integer_rejects_fractions() {
        let schema = Schema::compile(&json!({
            "properties": {"n": {"type": "integer"}}
        }));
        assert!(schema.validate(&args(json!({"n": 3}))).is_empty());
        assert!(schema.validate(&args(json!({"n": 3.0}))).is_empty());
        assert_eq!(schema.validate(&args(json!({"n": 3.5}))).len(), 1);
    }

    #[test]
    fn closed_schema_rejects_unknown_fields() {
        let schema = Schema::compile(&json!({
            "properties": {"path": {"type": "string"}},
            "additionalProperties": false
        }));
        let violations = schema.validate(&args(json!({"path": "/tmp", "mode": "rw"})));
        assert_eq!(violations, vec![Violation::new("mode", ViolationKind::Unknown)]);

        let open = Schema::compile(&json!({"properties": {"path": {"type": "string"}}}));
        assert!(open.validate(&args(json!({"path": "/tmp", "mode": "rw"}))).is_empty());
    }

    #[test]
    fn enum_membership() {
        let schema = Schema::compile(&json!({
            "properties": {"unit": {"type": "string", "enum": ["c", "f"]}}
        }));
        assert!(schema.validate(&args(json!({"unit": "c"}))).is_empty());
        let violations = schema.validate(&args(json!({"unit": "k"})));
        assert_eq!(violations[0].to_string(), "unit: must be one of \"c\", \"f\"");
    }

    #[test]
    fn union_types() {
        let schema = Schema::compile(&json!({
            "properties": {"limit": {"type": ["integer", "null"]}}
        }));
        assert!(schema.validate(&args(json!({"limit": null}))).is_empty());
        let violations = schema.validate(&args(json!({"limit": "ten"})));
        assert_eq!(violations[0].to_string(), "limit: expected integer or null, found string");
    }

    #[test]
    fn non_object_schema_accepts_anything() {
        let schema = Schema::compile(&json!(true));
        assert!(schema.validate(&args(json!({"anything": [1, 2]}))).is_empty());
    }
}
