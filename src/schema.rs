//! Declared option schemas for stage kinds.
//!
//! serde stops at the first bad field, so options are first checked against a
//! declared field list that reports every unknown, missing and mistyped field
//! at once. Only a clean mapping is then deserialized into the typed struct.

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::BuildError;

/// Shape of an option value.
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    String,
    Integer,
    Bool,
    StringList,
    /// Nested mapping with its own field declarations.
    Mapping(&'static [Field]),
    /// Sequence of mappings, each checked against the same fields.
    MappingList(&'static [Field]),
}

impl FieldType {
    fn describe(&self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::Integer => "an integer",
            FieldType::Bool => "a boolean",
            FieldType::StringList => "a list of strings",
            FieldType::Mapping(_) => "a mapping",
            FieldType::MappingList(_) => "a list of mappings",
        }
    }
}

/// One declared option field.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

impl Field {
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// Typed options of a stage kind.
pub trait StageOptions: DeserializeOwned {
    /// Declared top-level fields.
    const FIELDS: &'static [Field];

    /// Cross-field checks run after deserialization. Returns violations.
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Check `options` against `T::FIELDS`, then deserialize.
///
/// Every violation found is returned in a single [`BuildError::Schema`].
pub fn parse_options<T: StageOptions>(kind: &str, options: &Value) -> Result<T, BuildError> {
    let schema_error = |violations: Vec<String>| BuildError::Schema {
        kind: kind.to_string(),
        violations,
    };

    let empty = Mapping::new();
    let map = match options {
        Value::Mapping(m) => m,
        Value::Null => &empty,
        other => {
            return Err(schema_error(vec![format!(
                "options must be a mapping, got {}",
                value_kind(other)
            )]))
        }
    };

    let mut violations = Vec::new();
    check_mapping(map, T::FIELDS, "", &mut violations);
    if !violations.is_empty() {
        return Err(schema_error(violations));
    }

    // Null counts as absent, so serde defaults apply.
    let present: Mapping = map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let parsed: T = serde_yaml::from_value(Value::Mapping(present))
        .map_err(|e| schema_error(vec![e.to_string()]))?;

    let violations = parsed.validate();
    if !violations.is_empty() {
        return Err(schema_error(violations));
    }
    Ok(parsed)
}

fn check_mapping(map: &Mapping, fields: &[Field], prefix: &str, out: &mut Vec<String>) {
    for key in map.keys() {
        match key.as_str() {
            Some(k) if fields.iter().any(|f| f.name == k) => {}
            Some(k) => out.push(format!("{}{}: unknown field", prefix, k)),
            None => out.push(format!("{}{:?}: field names must be strings", prefix, key)),
        }
    }

    for field in fields {
        let path = format!("{}{}", prefix, field.name);
        match map.get(field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    out.push(format!("{}: required field missing", path));
                }
            }
            Some(value) => check_value(value, field.ty, &path, out),
        }
    }
}

fn check_value(value: &Value, ty: FieldType, path: &str, out: &mut Vec<String>) {
    let mismatch = |out: &mut Vec<String>| {
        out.push(format!(
            "{}: expected {}, got {}",
            path,
            ty.describe(),
            value_kind(value)
        ))
    };

    match ty {
        FieldType::String => {
            if !value.is_string() {
                mismatch(out);
            }
        }
        FieldType::Integer => {
            if !(value.is_i64() || value.is_u64()) {
                mismatch(out);
            }
        }
        FieldType::Bool => {
            if !value.is_bool() {
                mismatch(out);
            }
        }
        FieldType::StringList => match value.as_sequence() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        out.push(format!(
                            "{}[{}]: expected a string, got {}",
                            path,
                            i,
                            value_kind(item)
                        ));
                    }
                }
            }
            None => mismatch(out),
        },
        FieldType::Mapping(fields) => match value.as_mapping() {
            Some(map) => check_mapping(map, fields, &format!("{}.", path), out),
            None => mismatch(out),
        },
        FieldType::MappingList(fields) => match value.as_sequence() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    match item.as_mapping() {
                        Some(map) => {
                            check_mapping(map, fields, &format!("{}[{}].", path, i), out)
                        }
                        None => out.push(format!(
                            "{}[{}]: expected a mapping, got {}",
                            path,
                            i,
                            value_kind(item)
                        )),
                    }
                }
            }
            None => mismatch(out),
        },
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
