//! Runtime input validation against declared workflow variables.

use regex::Regex;
use serde_json::{Map, Value};
use switchyard_config::{ValidationRule, VariableDef, VariableScope, VariableType};

use crate::error::ValidationError;
use crate::schema::{SchemaType, is_integer};

/// Validate the run input and build the global variable map.
///
/// Input and global variables are read from the payload (or their
/// default); local variables are seeded from their default only. Output
/// variables are computed when the run ends and are ignored here.
pub fn validate_input(
  declarations: &[VariableDef],
  input: &Value,
) -> Result<Map<String, Value>, ValidationError> {
  let empty = Map::new();
  let payload = match input {
    Value::Object(map) => map,
    Value::Null => &empty,
    _ => return Err(ValidationError::InputNotObject),
  };

  let mut variables = Map::new();
  for decl in declarations {
    let value = match decl.scope {
      VariableScope::Output => continue,
      VariableScope::Local => decl.default.clone(),
      VariableScope::Input | VariableScope::Global => payload
        .get(&decl.name)
        .filter(|v| !v.is_null())
        .cloned()
        .or_else(|| decl.default.clone()),
    };

    let Some(value) = value else {
      if decl.required {
        return Err(ValidationError::MissingVariable {
          name: decl.name.clone(),
        });
      }
      continue;
    };

    check_type(decl, &value)?;
    if let Some(rule) = &decl.validation {
      check_rule(&decl.name, rule, &value)?;
    }
    variables.insert(decl.name.clone(), value);
  }

  Ok(variables)
}

fn check_type(decl: &VariableDef, value: &Value) -> Result<(), ValidationError> {
  let ok = match decl.var_type {
    VariableType::Any => true,
    VariableType::String => SchemaType::String.matches(value),
    VariableType::Number => SchemaType::Number.matches(value),
    VariableType::Integer => is_integer(value),
    VariableType::Boolean => SchemaType::Boolean.matches(value),
    VariableType::Array => SchemaType::Array.matches(value),
    VariableType::Object => SchemaType::Object.matches(value),
  };
  if ok {
    Ok(())
  } else {
    Err(ValidationError::TypeMismatch {
      name: decl.name.clone(),
      expected: format!("{:?}", decl.var_type).to_lowercase(),
    })
  }
}

fn check_rule(name: &str, rule: &ValidationRule, value: &Value) -> Result<(), ValidationError> {
  let violation = |message: String| ValidationError::RuleViolation {
    name: name.to_string(),
    message,
  };

  if let Some(allowed) = &rule.allowed {
    if !allowed.contains(value) {
      return Err(violation(format!("{value} is not an allowed value")));
    }
  }

  match value {
    Value::String(s) => {
      if let Some(pattern) = &rule.pattern {
        let re = Regex::new(pattern).map_err(|e| violation(format!("invalid pattern: {e}")))?;
        if !re.is_match(s) {
          return Err(violation(format!("'{s}' does not match pattern {pattern}")));
        }
      }
      let len = s.chars().count();
      if rule.min_length.is_some_and(|min| len < min) {
        return Err(violation(format!("length {len} is below the minimum")));
      }
      if rule.max_length.is_some_and(|max| len > max) {
        return Err(violation(format!("length {len} is above the maximum")));
      }
    }
    Value::Number(n) => {
      let n = n.as_f64().unwrap_or(0.0);
      if rule.minimum.is_some_and(|min| n < min) {
        return Err(violation(format!("{n} is below the minimum")));
      }
      if rule.maximum.is_some_and(|max| n > max) {
        return Err(violation(format!("{n} is above the maximum")));
      }
    }
    Value::Array(items) => {
      if rule.min_items.is_some_and(|min| items.len() < min) {
        return Err(violation(format!("{} items is below the minimum", items.len())));
      }
      if rule.max_items.is_some_and(|max| items.len() > max) {
        return Err(violation(format!("{} items is above the maximum", items.len())));
      }
    }
    Value::Object(map) => {
      if let Some(missing) = rule.required_keys.iter().find(|k| !map.contains_key(*k)) {
        return Err(violation(format!("missing key '{missing}'")));
      }
    }
    _ => {}
  }

  Ok(())
}
