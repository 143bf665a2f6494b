//! A small JSON Schema subset used to check transform output.
//!
//! Supported keywords: `type` (string or list), `required`, `properties`,
//! `items`, `enum`, `minimum`, `maximum`, `minLength`, `maxLength`.
//! Unknown keywords are ignored.

use serde_json::Value;

/// JSON Schema type names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SchemaType {
  String,
  Number,
  Integer,
  Boolean,
  Null,
  Array,
  Object,
}

impl SchemaType {
  pub(crate) fn parse(name: &str) -> Option<Self> {
    Some(match name {
      "string" => SchemaType::String,
      "number" => SchemaType::Number,
      "integer" => SchemaType::Integer,
      "boolean" => SchemaType::Boolean,
      "null" => SchemaType::Null,
      "array" => SchemaType::Array,
      "object" => SchemaType::Object,
      _ => return None,
    })
  }

  pub(crate) fn matches(&self, value: &Value) -> bool {
    match self {
      SchemaType::String => value.is_string(),
      SchemaType::Number => value.is_number(),
      SchemaType::Integer => is_integer(value),
      SchemaType::Boolean => value.is_boolean(),
      SchemaType::Null => value.is_null(),
      SchemaType::Array => value.is_array(),
      SchemaType::Object => value.is_object(),
    }
  }
}

pub(crate) fn is_integer(value: &Value) -> bool {
  match value {
    Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
    _ => false,
  }
}

/// Validate `value` against `schema`, describing the first violation.
pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
  validate_at("$", value, schema)
}

fn validate_at(at: &str, value: &Value, schema: &Value) -> Result<(), String> {
  let Some(schema) = schema.as_object() else {
    return Ok(());
  };

  if let Some(type_spec) = schema.get("type") {
    let names: Vec<&str> = match type_spec {
      Value::String(name) => vec![name.as_str()],
      Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
      _ => vec![],
    };
    let ok = names.is_empty()
      || names
        .iter()
        .filter_map(|name| SchemaType::parse(name))
        .any(|ty| ty.matches(value));
    if !ok {
      return Err(format!("{at}: expected type {}", names.join(" | ")));
    }
  }

  if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
    if !allowed.contains(value) {
      return Err(format!("{at}: value {value} is not one of the allowed values"));
    }
  }

  if let Some(n) = value.as_f64() {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
      if n < min {
        return Err(format!("{at}: {n} is below the minimum {min}"));
      }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
      if n > max {
        return Err(format!("{at}: {n} is above the maximum {max}"));
      }
    }
  }

  if let Some(s) = value.as_str() {
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
      if len < min {
        return Err(format!("{at}: shorter than {min} characters"));
      }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
      if len > max {
        return Err(format!("{at}: longer than {max} characters"));
      }
    }
  }

  if let Some(map) = value.as_object() {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
      for key in required.iter().filter_map(Value::as_str) {
        if !map.contains_key(key) {
          return Err(format!("{at}: missing required property '{key}'"));
        }
      }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
      for (key, prop_schema) in properties {
        if let Some(prop) = map.get(key) {
          validate_at(&format!("{at}.{key}"), prop, prop_schema)?;
        }
      }
    }
  }

  if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
    for (idx, item) in items.iter().enumerate() {
      validate_at(&format!("{at}[{idx}]"), item, item_schema)?;
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_nested_object_schema() {
    let schema = json!({
      "type": "object",
      "required": ["name", "scores"],
      "properties": {
        "name": {"type": "string", "minLength": 2},
        "scores": {"type": "array", "items": {"type": "integer", "minimum": 0}}
      }
    });

    assert!(validate(&json!({"name": "ada", "scores": [1, 2]}), &schema).is_ok());

    let err = validate(&json!({"name": "ada"}), &schema).unwrap_err();
    assert!(err.contains("scores"));

    let err = validate(&json!({"name": "ada", "scores": [1, -2]}), &schema).unwrap_err();
    assert!(err.starts_with("$.scores[1]"));

    let err = validate(&json!({"name": "a", "scores": []}), &schema).unwrap_err();
    assert!(err.starts_with("$.name"));
  }

  #[test]
  fn test_type_union_and_enum() {
    let schema = json!({"type": ["string", "null"], "enum": ["x", null]});
    assert!(validate(&json!(null), &schema).is_ok());
    assert!(validate(&json!("x"), &schema).is_ok());
    assert!(validate(&json!("y"), &schema).is_err());
    assert!(validate(&json!(1), &schema).is_err());
  }

  #[test]
  fn test_integer_accepts_whole_floats() {
    assert!(SchemaType::Integer.matches(&json!(3.0)));
    assert!(!SchemaType::Integer.matches(&json!(3.5)));
  }
}
