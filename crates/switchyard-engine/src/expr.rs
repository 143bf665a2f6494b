//! Expression resolution against an execution context snapshot.
//!
//! Every function here is pure: it reads a JSON snapshot of the context and
//! never mutates it, so evaluation order between nodes does not matter.
//!
//! # Snapshot shape
//! ```json
//! {
//!   "input":   { ... run input ... },
//!   "vars":    { ... global variables ... },
//!   "nodes":   { "fetch": { "output": { ... } } },
//!   "current": { ... input of the executing node ... },
//!   "item": ..., "index": ...            // loop locals, when present
//! }
//! ```
//!
//! # References
//! `${nodes.fetch.output.items[0].name}` resolves a path. When the first
//! segment is not a snapshot root it is treated as a node id, so
//! `${fetch.items[0]}` is shorthand for `${nodes.fetch.output.items[0]}`.
//!
//! # Conditions
//! Conditions are minijinja expressions. `${..}` references inside them are
//! resolved first and bound as variables, so both of these work:
//! ```text
//! nodes.score.output.value > 5
//! ${score.value} > 5 and vars.mode == "strict"
//! ```

use minijinja::{Environment, UndefinedBehavior, Value as JinjaValue};
use serde_json::{Map, Value};
use switchyard_config::DataMapping;
use thiserror::Error;

use crate::path;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
  #[error("unresolved reference: {0}")]
  Unresolved(String),

  #[error("invalid expression '{expr}': {message}")]
  Invalid { expr: String, message: String },

  #[error("unknown transform: {0}")]
  UnknownTransform(String),

  #[error("transform '{transform}' failed: {message}")]
  Transform { transform: String, message: String },
}

/// Resolve a context path, with the node-id shorthand for the first segment.
pub fn resolve_path(snapshot: &Value, reference: &str) -> Option<Value> {
  let reference = strip_reference(reference);
  if let Some(found) = path::lookup(snapshot, reference) {
    return Some(found.clone());
  }

  let (head, rest) = match reference.find(['.', '[']) {
    Some(pos) => reference.split_at(pos),
    None => (reference, ""),
  };
  let output = snapshot.get("nodes")?.get(head)?.get("output")?;
  let rest = rest.strip_prefix('.').unwrap_or(rest);
  path::lookup(output, rest).cloned()
}

fn strip_reference(reference: &str) -> &str {
  let trimmed = reference.trim();
  trimmed
    .strip_prefix("${")
    .and_then(|r| r.strip_suffix('}'))
    .map(str::trim)
    .unwrap_or(trimmed)
}

/// Byte ranges of `${..}` tokens, including the delimiters.
fn find_references(template: &str) -> Result<Vec<(usize, usize)>, ExprError> {
  let mut refs = Vec::new();
  let mut offset = 0;
  while let Some(start) = template[offset..].find("${") {
    let start = offset + start;
    let end = template[start..]
      .find('}')
      .map(|e| start + e + 1)
      .ok_or_else(|| ExprError::Invalid {
        expr: template.to_string(),
        message: "unterminated reference".to_string(),
      })?;
    refs.push((start, end));
    offset = end;
  }
  Ok(refs)
}

/// Resolve a template string.
///
/// A template consisting of exactly one reference keeps the referenced
/// value's JSON type; anything else renders to a string.
pub fn interpolate(snapshot: &Value, template: &str) -> Result<Value, ExprError> {
  let refs = find_references(template)?;
  if refs.is_empty() {
    return Ok(Value::String(template.to_string()));
  }

  if refs.len() == 1 && refs[0] == (0, template.len()) {
    return resolve_path(snapshot, template)
      .ok_or_else(|| ExprError::Unresolved(strip_reference(template).to_string()));
  }

  let mut rendered = String::with_capacity(template.len());
  let mut last = 0;
  for (start, end) in refs {
    rendered.push_str(&template[last..start]);
    let reference = &template[start..end];
    let value = resolve_path(snapshot, reference)
      .ok_or_else(|| ExprError::Unresolved(strip_reference(reference).to_string()))?;
    rendered.push_str(&render_scalar(&value));
    last = end;
  }
  rendered.push_str(&template[last..]);
  Ok(Value::String(rendered))
}

/// Render a value for string interpolation: strings verbatim, the rest as JSON.
pub fn render_scalar(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Recursively interpolate every string inside a JSON value.
pub fn resolve_value(snapshot: &Value, value: &Value) -> Result<Value, ExprError> {
  match value {
    Value::String(template) => interpolate(snapshot, template),
    Value::Array(items) => items
      .iter()
      .map(|item| resolve_value(snapshot, item))
      .collect::<Result<Vec<_>, _>>()
      .map(Value::Array),
    Value::Object(map) => map
      .iter()
      .map(|(k, v)| Ok((k.clone(), resolve_value(snapshot, v)?)))
      .collect::<Result<Map<_, _>, _>>()
      .map(Value::Object),
    other => Ok(other.clone()),
  }
}

/// Evaluate an expression and return its JSON value.
pub fn evaluate(snapshot: &Value, expr: &str) -> Result<Value, ExprError> {
  let value = evaluate_raw(snapshot, expr, None)?;
  serde_json::to_value(&value).map_err(|e| ExprError::Invalid {
    expr: expr.to_string(),
    message: e.to_string(),
  })
}

/// Evaluate an expression with extra variables bound on top of the snapshot.
pub fn evaluate_with(
  snapshot: &Value,
  expr: &str,
  extra: &Map<String, Value>,
) -> Result<Value, ExprError> {
  let value = evaluate_raw(snapshot, expr, Some(extra))?;
  serde_json::to_value(&value).map_err(|e| ExprError::Invalid {
    expr: expr.to_string(),
    message: e.to_string(),
  })
}

/// Evaluate a condition to a boolean using template truthiness.
pub fn evaluate_condition(snapshot: &Value, expr: &str) -> Result<bool, ExprError> {
  Ok(evaluate_raw(snapshot, expr, None)?.is_true())
}

fn evaluate_raw(
  snapshot: &Value,
  expr: &str,
  extra: Option<&Map<String, Value>>,
) -> Result<JinjaValue, ExprError> {
  let mut context: Map<String, Value> = match snapshot {
    Value::Object(map) => map.clone(),
    _ => Map::new(),
  };
  if let Some(extra) = extra {
    context.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
  }

  // Replace each ${path} with a bound variable.
  let refs = find_references(expr)?;
  let mut rewritten = String::with_capacity(expr.len());
  let mut last = 0;
  for (n, (start, end)) in refs.into_iter().enumerate() {
    let name = format!("__ref{n}");
    rewritten.push_str(&expr[last..start]);
    rewritten.push_str(&name);
    if let Some(value) = resolve_path(snapshot, &expr[start..end]) {
      context.insert(name, value);
    }
    last = end;
  }
  rewritten.push_str(&expr[last..]);

  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Chainable);
  let compiled = env
    .compile_expression(&rewritten)
    .map_err(|e| ExprError::Invalid {
      expr: expr.to_string(),
      message: e.to_string(),
    })?;
  compiled
    .eval(JinjaValue::from_serialize(&context))
    .map_err(|e| ExprError::Invalid {
      expr: expr.to_string(),
      message: e.to_string(),
    })
}

/// Apply one data mapping, writing into `target`.
///
/// A missing source falls back to the mapping's default; without a default
/// a required mapping fails and an optional one is skipped.
pub fn apply_mapping(
  snapshot: &Value,
  mapping: &DataMapping,
  target: &mut Value,
) -> Result<(), ExprError> {
  let resolved = if mapping.source.contains("${") {
    match interpolate(snapshot, &mapping.source) {
      Ok(value) => Some(value),
      Err(ExprError::Unresolved(_)) => None,
      Err(e) => return Err(e),
    }
  } else {
    resolve_path(snapshot, &mapping.source)
  };

  let value = match (resolved, &mapping.default) {
    (Some(value), _) => value,
    (None, Some(default)) => default.clone(),
    (None, None) if mapping.required => {
      return Err(ExprError::Unresolved(mapping.source.clone()));
    }
    (None, None) => return Ok(()),
  };

  let value = match &mapping.transform {
    Some(transform) => apply_transform(transform, value)?,
    None => value,
  };
  path::set(target, &mapping.target, value)
}

/// Apply every mapping in order.
pub fn apply_mappings(
  snapshot: &Value,
  mappings: &[DataMapping],
  target: &mut Value,
) -> Result<(), ExprError> {
  for mapping in mappings {
    apply_mapping(snapshot, mapping, target)?;
  }
  Ok(())
}

/// Apply a named value transform.
pub fn apply_transform(transform: &str, value: Value) -> Result<Value, ExprError> {
  let failed = |message: String| ExprError::Transform {
    transform: transform.to_string(),
    message,
  };

  if let Some(separator) = transform.strip_prefix("split:") {
    let Value::String(s) = &value else {
      return Err(failed("expected a string".to_string()));
    };
    return Ok(Value::Array(
      s.split(separator)
        .map(|part| Value::String(part.to_string()))
        .collect(),
    ));
  }
  if let Some(separator) = transform.strip_prefix("join:") {
    let Value::Array(items) = &value else {
      return Err(failed("expected an array".to_string()));
    };
    let parts: Vec<String> = items.iter().map(render_scalar).collect();
    return Ok(Value::String(parts.join(separator)));
  }

  match transform {
    "uppercase" => Ok(Value::String(render_scalar(&value).to_uppercase())),
    "lowercase" => Ok(Value::String(render_scalar(&value).to_lowercase())),
    "trim" => Ok(Value::String(render_scalar(&value).trim().to_string())),
    "to_string" => Ok(Value::String(render_scalar(&value))),
    "json_stringify" => Ok(Value::String(value.to_string())),
    "json_parse" => match &value {
      Value::String(s) => serde_json::from_str(s).map_err(|e| failed(e.to_string())),
      _ => Ok(value),
    },
    "to_number" => match &value {
      Value::Number(_) => Ok(value),
      Value::String(s) => s
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| failed(format!("'{s}' is not a number"))),
      Value::Bool(b) => Ok(Value::from(u8::from(*b))),
      _ => Err(failed("value cannot be converted to a number".to_string())),
    },
    "length" => match &value {
      Value::String(s) => Ok(Value::from(s.chars().count())),
      Value::Array(items) => Ok(Value::from(items.len())),
      Value::Object(map) => Ok(Value::from(map.len())),
      _ => Err(failed("value has no length".to_string())),
    },
    other => Err(ExprError::UnknownTransform(other.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn snapshot() -> Value {
    json!({
      "input": {"user": {"name": "ada", "tags": ["a", "b"]}},
      "vars": {"threshold": 5, "mode": "strict"},
      "nodes": {
        "score": {"output": {"value": 7, "items": [{"id": 1}, {"id": 2}]}}
      }
    })
  }

  #[test]
  fn test_resolve_path_from_roots() {
    let s = snapshot();
    assert_eq!(resolve_path(&s, "input.user.name"), Some(json!("ada")));
    assert_eq!(resolve_path(&s, "${vars.threshold}"), Some(json!(5)));
    assert_eq!(
      resolve_path(&s, "nodes.score.output.items[1].id"),
      Some(json!(2))
    );
    assert_eq!(resolve_path(&s, "input.missing"), None);
  }

  #[test]
  fn test_resolve_path_node_shorthand() {
    let s = snapshot();
    assert_eq!(resolve_path(&s, "score.value"), Some(json!(7)));
    assert_eq!(resolve_path(&s, "score.items[0].id"), Some(json!(1)));
    assert_eq!(resolve_path(&s, "score"), Some(s["nodes"]["score"]["output"].clone()));
    assert_eq!(resolve_path(&s, "nobody.value"), None);
  }

  #[test]
  fn test_interpolate_single_reference_keeps_type() {
    let s = snapshot();
    assert_eq!(interpolate(&s, "${input.user.tags}").unwrap(), json!(["a", "b"]));
    assert_eq!(interpolate(&s, "${vars.threshold}").unwrap(), json!(5));
  }

  #[test]
  fn test_interpolate_mixed_template_renders_string() {
    let s = snapshot();
    assert_eq!(
      interpolate(&s, "hi ${input.user.name}, score ${score.value}").unwrap(),
      json!("hi ada, score 7")
    );
    assert_eq!(interpolate(&s, "no refs").unwrap(), json!("no refs"));
  }

  #[test]
  fn test_interpolate_unresolved_fails() {
    let s = snapshot();
    assert_eq!(
      interpolate(&s, "${input.nope}").unwrap_err(),
      ExprError::Unresolved("input.nope".to_string())
    );
    assert!(matches!(
      interpolate(&s, "${input.user"),
      Err(ExprError::Invalid { .. })
    ));
  }

  #[test]
  fn test_resolve_value_recurses() {
    let s = snapshot();
    let resolved = resolve_value(
      &s,
      &json!({"who": "${input.user.name}", "list": ["${vars.mode}", 3]}),
    )
    .unwrap();
    assert_eq!(resolved, json!({"who": "ada", "list": ["strict", 3]}));
  }

  #[test]
  fn test_evaluate_condition_literals_and_paths() {
    let s = snapshot();
    assert!(evaluate_condition(&s, "true").unwrap());
    assert!(!evaluate_condition(&s, "false").unwrap());
    assert!(evaluate_condition(&s, "nodes.score.output.value > vars.threshold").unwrap());
    assert!(evaluate_condition(&s, "${score.value} == 7 and vars.mode == 'strict'").unwrap());
    assert!(!evaluate_condition(&s, "input.user.missing.deeper").unwrap());
  }

  #[test]
  fn test_evaluate_with_extra_bindings() {
    let s = snapshot();
    let mut extra = Map::new();
    extra.insert("values".to_string(), json!([1, 2, 3]));
    assert_eq!(evaluate_with(&s, "values | length", &extra).unwrap(), json!(3));
    assert!(matches!(
      evaluate(&s, "1 +"),
      Err(ExprError::Invalid { .. })
    ));
  }

  #[test]
  fn test_apply_mapping_default_required_and_transform() {
    let s = snapshot();
    let mut target = json!({});

    let mapping = |source: &str, target: &str| DataMapping {
      source: source.to_string(),
      target: target.to_string(),
      transform: None,
      default: None,
      required: false,
    };

    let mut upper = mapping("input.user.name", "profile.name");
    upper.transform = Some("uppercase".to_string());
    apply_mapping(&s, &upper, &mut target).unwrap();

    let mut defaulted = mapping("input.absent", "fallback");
    defaulted.default = Some(json!("none"));
    apply_mapping(&s, &defaulted, &mut target).unwrap();

    apply_mapping(&s, &mapping("input.absent", "skipped"), &mut target).unwrap();

    let mut required = mapping("input.absent", "x");
    required.required = true;
    assert!(apply_mapping(&s, &required, &mut target).is_err());

    assert_eq!(target, json!({"profile": {"name": "ADA"}, "fallback": "none"}));
  }

  #[test]
  fn test_apply_transform_variants() {
    assert_eq!(apply_transform("split:,", json!("a,b")).unwrap(), json!(["a", "b"]));
    assert_eq!(apply_transform("join:-", json!(["a", 1])).unwrap(), json!("a-1"));
    assert_eq!(apply_transform("json_parse", json!("{\"k\":1}")).unwrap(), json!({"k": 1}));
    assert_eq!(apply_transform("json_stringify", json!({"k": 1})).unwrap(), json!("{\"k\":1}"));
    assert_eq!(apply_transform("to_number", json!(" 2.5 ")).unwrap(), json!(2.5));
    assert_eq!(apply_transform("length", json!([1, 2])).unwrap(), json!(2));
    assert!(matches!(
      apply_transform("reverse", json!("x")),
      Err(ExprError::UnknownTransform(_))
    ));
  }
}
