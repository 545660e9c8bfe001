//! Output schemas and the structured-output validator.
//!
//! The validator is purely structural: it checks field presence, types, enum
//! membership and declared list bounds. It never invents a value for a missing
//! field and never judges content. Identical input always yields an identical
//! outcome.

use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Number,
    /// One of a fixed set of strings. Matching is case-insensitive and the
    /// canonical spelling is written to the output.
    Enum(&'static [&'static str]),
    /// Object whose values are all strings.
    StringMap,
    List {
        item: Box<FieldType>,
        min: usize,
        max: Option<usize>,
    },
    Object(Vec<FieldSpec>),
}

impl FieldType {
    pub fn list_of(item: FieldType) -> Self {
        FieldType::List {
            item: Box::new(item),
            min: 0,
            max: None,
        }
    }

    pub fn bounded_list(item: FieldType, min: usize, max: usize) -> Self {
        FieldType::List {
            item: Box::new(item),
            min,
            max: Some(max),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Enum(_) => "enum string",
            FieldType::StringMap => "object of strings",
            FieldType::List { .. } => "list",
            FieldType::Object(_) => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Alternative keys accepted in raw output; the value is written under `name`.
    pub aliases: &'static [&'static str],
    pub ty: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            aliases: &[],
            ty,
            required: true,
        }
    }

    pub fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            aliases: &[],
            ty,
            required: false,
        }
    }

    pub fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("output is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("{path}: expected an object")]
    NotAnObject { path: String },

    #[error("{path}: required field is missing")]
    MissingField { path: String },

    #[error("{path}: expected {expected}")]
    WrongType { path: String, expected: &'static str },

    #[error("{path}: '{value}' is not one of {allowed:?}")]
    NotInEnum {
        path: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("{path}: list has {len} items (min {min}, max {max:?})")]
    LengthOutOfBounds {
        path: String,
        len: usize,
        min: usize,
        max: Option<usize>,
    },

    #[error("validated output could not be converted: {0}")]
    Conversion(String),
}

impl Schema {
    pub fn new(name: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self { name, fields }
    }

    /// Validate `raw` and return a normalized copy containing only declared
    /// fields under their canonical names.
    pub fn validate(&self, raw: &Value) -> Result<Value, ValidationError> {
        validate_object(&self.fields, raw, "$")
    }

    /// JSON Schema rendering handed to the generation capability.
    pub fn to_json_schema(&self) -> Value {
        object_json_schema(&self.fields)
    }
}

/// Free-function form of [`Schema::validate`].
pub fn validate(raw: &Value, schema: &Schema) -> Result<Value, ValidationError> {
    schema.validate(raw)
}

fn validate_object(fields: &[FieldSpec], raw: &Value, path: &str) -> Result<Value, ValidationError> {
    let object = raw.as_object().ok_or_else(|| ValidationError::NotAnObject {
        path: path.to_string(),
    })?;

    let mut normalized = Map::new();
    for field in fields {
        let field_path = format!("{path}.{}", field.name);
        let value = std::iter::once(field.name)
            .chain(field.aliases.iter().copied())
            .find_map(|key| object.get(key))
            .filter(|v| !v.is_null());

        match value {
            Some(value) => {
                let checked = validate_value(&field.ty, value, &field_path)?;
                normalized.insert(field.name.to_string(), checked);
            }
            None if field.required => {
                return Err(ValidationError::MissingField { path: field_path });
            }
            None => {}
        }
    }

    Ok(Value::Object(normalized))
}

fn validate_value(ty: &FieldType, value: &Value, path: &str) -> Result<Value, ValidationError> {
    let wrong_type = || ValidationError::WrongType {
        path: path.to_string(),
        expected: ty.describe(),
    };

    match ty {
        FieldType::String => value.as_str().map(|s| json!(s)).ok_or_else(wrong_type),
        FieldType::Number => {
            if value.is_number() {
                Ok(value.clone())
            } else {
                Err(wrong_type())
            }
        }
        FieldType::Enum(allowed) => {
            let s = value.as_str().ok_or_else(wrong_type)?;
            allowed
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(s.trim()))
                .map(|canonical| json!(canonical))
                .ok_or_else(|| ValidationError::NotInEnum {
                    path: path.to_string(),
                    value: s.to_string(),
                    allowed: allowed.iter().map(|a| a.to_string()).collect(),
                })
        }
        FieldType::StringMap => {
            let object = value.as_object().ok_or_else(wrong_type)?;
            let mut out = Map::new();
            for (key, v) in object {
                let s = v.as_str().ok_or_else(|| ValidationError::WrongType {
                    path: format!("{path}.{key}"),
                    expected: "string",
                })?;
                out.insert(key.clone(), json!(s));
            }
            Ok(Value::Object(out))
        }
        FieldType::List { item, min, max } => {
            let items = value.as_array().ok_or_else(wrong_type)?;
            let len = items.len();
            if len < *min || max.map_or(false, |m| len > m) {
                return Err(ValidationError::LengthOutOfBounds {
                    path: path.to_string(),
                    len,
                    min: *min,
                    max: *max,
                });
            }
            items
                .iter()
                .enumerate()
                .map(|(i, v)| validate_value(item, v, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        FieldType::Object(fields) => validate_object(fields, value, path),
    }
}

fn object_json_schema(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in fields {
        properties.insert(field.name.to_string(), type_json_schema(&field.ty));
        if field.required {
            required.push(json!(field.name));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn type_json_schema(ty: &FieldType) -> Value {
    match ty {
        FieldType::String => json!({ "type": "string" }),
        FieldType::Number => json!({ "type": "number" }),
        FieldType::Enum(allowed) => json!({ "type": "string", "enum": allowed }),
        FieldType::StringMap => json!({
            "type": "object",
            "additionalProperties": { "type": "string" }
        }),
        FieldType::List { item, min, max } => {
            let mut schema = json!({
                "type": "array",
                "items": type_json_schema(item),
                "minItems": min,
            });
            if let Some(max) = max {
                schema["maxItems"] = json!(max);
            }
            schema
        }
        FieldType::Object(fields) => object_json_schema(fields),
    }
}

/// Parse generation output as JSON, tolerating a surrounding Markdown code fence.
pub fn parse_json_output(text: &str) -> Result<Value, ValidationError> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```json") {
        body = rest;
    } else if let Some(rest) = body.strip_prefix("```") {
        body = rest;
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }
    serde_json::from_str(body.trim()).map_err(|e| ValidationError::MalformedJson(e.to_string()))
}
