use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Boolean,
    Object,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::String, Value::String(_))
                | (FieldType::Boolean, Value::Bool(_))
                | (FieldType::Object, Value::Object(_))
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
}

const fn field(name: &'static str, field_type: FieldType, required: bool) -> FieldSpec {
    FieldSpec {
        name,
        field_type,
        required,
    }
}

/// Every top-level key a record may carry
pub const RECORD_SCHEMA: [FieldSpec; 12] = [
    field("id", FieldType::String, true),
    field("source_path", FieldType::String, true),
    field("host", FieldType::String, true),
    field("formatter_name", FieldType::String, true),
    field("raw", FieldType::String, true),
    field("timestamp", FieldType::String, true),
    field("type", FieldType::String, true),
    field("level", FieldType::String, true),
    field("event", FieldType::String, true),
    field("data", FieldType::Object, true),
    field("error", FieldType::Boolean, false),
    field("error_trace", FieldType::String, false),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' must be {expected}, found {found}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("record does not decode: {0}")]
    Decode(String),
}

/// Move every key present both at the top level and inside `data` out of
/// `data`, letting the nested value win. Application values lifted into a
/// string field are kept as their JSON text.
pub fn flatten(record: &mut Map<String, Value>) {
    let mut data = match record.remove("data") {
        Some(Value::Object(data)) => data,
        Some(other) => {
            record.insert("data".to_string(), other);
            return;
        }
        None => return,
    };

    let duplicated: Vec<String> = record
        .keys()
        .filter(|key| data.contains_key(key.as_str()))
        .cloned()
        .collect();

    for key in duplicated {
        if let Some(value) = data.remove(&key) {
            let value = coerce_lifted(&key, value);
            record.insert(key, value);
        }
    }

    record.insert("data".to_string(), Value::Object(data));
}

fn coerce_lifted(key: &str, value: Value) -> Value {
    let is_string_field = RECORD_SCHEMA
        .iter()
        .any(|spec| spec.name == key && spec.field_type == FieldType::String);

    match value {
        Value::String(_) | Value::Null => value,
        other if is_string_field => Value::String(other.to_string()),
        other => other,
    }
}

pub fn validate(record: &Map<String, Value>) -> Result<(), SchemaError> {
    for key in record.keys() {
        if !RECORD_SCHEMA.iter().any(|spec| spec.name == key) {
            return Err(SchemaError::UnknownField(key.clone()));
        }
    }

    for spec in &RECORD_SCHEMA {
        match record.get(spec.name) {
            None | Some(Value::Null) if spec.required => {
                return Err(SchemaError::MissingField(spec.name));
            }
            None | Some(Value::Null) => {}
            Some(value) if !spec.field_type.matches(value) => {
                return Err(SchemaError::WrongType {
                    field: spec.name,
                    expected: spec.field_type.as_str(),
                    found: value_kind(value),
                });
            }
            Some(_) => {}
        }
    }

    Ok(())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
