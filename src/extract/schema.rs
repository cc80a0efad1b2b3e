//! Structural defaulting for extracted records.
//!
//! A [`Schema`] lists the fields a record must carry, each with a [`FieldKind`] and a
//! default. Applying it never rejects a record: missing or null fields take their default,
//! scalars arriving where a sequence is expected become one-element sequences, and scalar
//! kinds are coerced where the conversion is lossless.

use serde_json::{Map, Number, Value};

/// Expected JSON shape of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Bool,
    Sequence(Box<FieldKind>),
    Object(Schema),
}

impl FieldKind {
    pub fn sequence_of(item: FieldKind) -> Self {
        FieldKind::Sequence(Box::new(item))
    }

    /// The empty value of this kind.
    pub fn empty(&self) -> Value {
        match self {
            FieldKind::String => Value::String(String::new()),
            FieldKind::Integer | FieldKind::Number => Value::Number(Number::from(0)),
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Sequence(_) => Value::Array(Vec::new()),
            FieldKind::Object(schema) => Value::Object(schema.defaults()),
        }
    }
}

/// One required field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub default: Value,
}

/// Ordered set of required fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field whose default is the kind's empty value.
    pub fn field(self, name: &str, kind: FieldKind) -> Self {
        let default = kind.empty();
        self.field_with_default(name, kind, default)
    }

    pub fn field_with_default(mut self, name: &str, kind: FieldKind, default: Value) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            default,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// A record made only of defaults.
    pub fn defaults(&self) -> Map<String, Value> {
        self.apply(Map::new())
    }

    /// Normalize `record` against the schema. Unknown fields are kept as they are.
    pub fn apply(&self, mut record: Map<String, Value>) -> Map<String, Value> {
        for spec in &self.fields {
            let raw = record.remove(&spec.name).unwrap_or(Value::Null);
            let value = normalize(raw, &spec.kind, &spec.default);
            record.insert(spec.name.clone(), value);
        }
        record
    }
}

fn normalize(raw: Value, kind: &FieldKind, default: &Value) -> Value {
    let fallback = || {
        if default.is_null() {
            kind.empty()
        } else {
            default.clone()
        }
    };

    if raw.is_null() {
        return fallback();
    }

    match kind {
        FieldKind::String => match raw {
            Value::String(s) => Value::String(s),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            Value::Array(items) => {
                let parts: Vec<String> = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s),
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .collect();
                if parts.is_empty() {
                    fallback()
                } else {
                    Value::String(parts.join("\n"))
                }
            }
            _ => fallback(),
        },
        FieldKind::Integer => match &raw {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))
                .map(|i| Value::Number(Number::from(i)))
                .unwrap_or_else(fallback),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
                    .map(|i| Value::Number(Number::from(i)))
                    .unwrap_or_else(fallback)
            }
            _ => fallback(),
        },
        FieldKind::Number => match &raw {
            Value::Number(n) => Value::Number(n.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(fallback),
            _ => fallback(),
        },
        FieldKind::Bool => match &raw {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => fallback(),
            },
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            _ => fallback(),
        },
        FieldKind::Sequence(item_kind) => {
            let item_default = item_kind.empty();
            let items = match raw {
                Value::Array(items) => items,
                Value::Object(_) if !matches!(item_kind.as_ref(), FieldKind::Object(_)) => {
                    return fallback();
                }
                scalar => vec![scalar],
            };
            Value::Array(
                items
                    .into_iter()
                    .filter(|item| !item.is_null())
                    .map(|item| normalize(item, item_kind, &item_default))
                    .collect(),
            )
        }
        FieldKind::Object(schema) => match raw {
            Value::Object(map) => Value::Object(schema.apply(map)),
            _ => fallback(),
        },
    }
}
