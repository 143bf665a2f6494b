//! Dotted paths into JSON values: `nodes.fetch.output.items[0].name`.

use serde_json::Value;

use crate::expr::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
  Key(String),
  Index(usize),
}

/// Parse a dotted path. An empty path addresses the root.
pub(crate) fn parse(path: &str) -> Result<Vec<Segment>, ExprError> {
  let path = path.trim();
  let mut segments = Vec::new();
  if path.is_empty() || path == "." {
    return Ok(segments);
  }

  let invalid = |message: &str| ExprError::Invalid {
    expr: path.to_string(),
    message: message.to_string(),
  };

  for part in path.split('.') {
    if part.is_empty() {
      return Err(invalid("empty path segment"));
    }
    let (key, mut rest) = match part.find('[') {
      Some(pos) => part.split_at(pos),
      None => (part, ""),
    };
    if !key.is_empty() {
      segments.push(Segment::Key(key.to_string()));
    }
    while !rest.is_empty() {
      let close = rest.find(']').ok_or_else(|| invalid("unclosed index"))?;
      let index = rest[1..close]
        .trim()
        .parse::<usize>()
        .map_err(|_| invalid("index must be a non-negative integer"))?;
      segments.push(Segment::Index(index));
      rest = &rest[close + 1..];
      if !rest.is_empty() && !rest.starts_with('[') {
        return Err(invalid("unexpected characters after index"));
      }
    }
  }

  Ok(segments)
}

pub(crate) fn get<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
  let mut current = value;
  for segment in segments {
    current = match (segment, current) {
      (Segment::Key(key), Value::Object(map)) => map.get(key)?,
      (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
      (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
      _ => return None,
    };
  }
  Some(current)
}

/// Look up a dotted path, returning `None` when any segment is missing.
pub(crate) fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
  let segments = parse(path).ok()?;
  get(value, &segments)
}

/// Write `new_value` at `path`, creating intermediate objects as needed.
pub(crate) fn set(root: &mut Value, path: &str, new_value: Value) -> Result<(), ExprError> {
  let segments = parse(path)?;
  let mut current = root;
  for segment in &segments {
    current = match segment {
      Segment::Key(key) => {
        if !current.is_object() {
          *current = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = current else {
          return Err(ExprError::Invalid {
            expr: path.to_string(),
            message: format!("cannot address '{key}'"),
          });
        };
        map.entry(key.clone()).or_insert(Value::Null)
      }
      Segment::Index(idx) => {
        if current.is_null() {
          *current = Value::Array(Vec::new());
        }
        match current {
          Value::Array(items) if *idx <= items.len() => {
            if *idx == items.len() {
              items.push(Value::Null);
            }
            &mut items[*idx]
          }
          _ => {
            return Err(ExprError::Invalid {
              expr: path.to_string(),
              message: format!("index {idx} is out of bounds"),
            });
          }
        }
      }
    };
  }
  *current = new_value;
  Ok(())
}

/// Remove and return the value at `path`.
pub(crate) fn remove(root: &mut Value, path: &str) -> Result<Option<Value>, ExprError> {
  let segments = parse(path)?;
  let Some((last, parents)) = segments.split_last() else {
    return Ok(Some(std::mem::take(root)));
  };

  let mut current = root;
  for segment in parents {
    current = match (segment, current) {
      (Segment::Key(key), Value::Object(map)) => match map.get_mut(key) {
        Some(next) => next,
        None => return Ok(None),
      },
      (Segment::Index(idx), Value::Array(items)) => match items.get_mut(*idx) {
        Some(next) => next,
        None => return Ok(None),
      },
      _ => return Ok(None),
    };
  }

  Ok(match (last, current) {
    (Segment::Key(key), Value::Object(map)) => map.remove(key),
    (Segment::Index(idx), Value::Array(items)) if *idx < items.len() => Some(items.remove(*idx)),
    _ => None,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_keys_and_indexes() {
    assert_eq!(
      parse("a.items[2][0].b").unwrap(),
      vec![
        Segment::Key("a".to_string()),
        Segment::Key("items".to_string()),
        Segment::Index(2),
        Segment::Index(0),
        Segment::Key("b".to_string()),
      ]
    );
    assert!(parse("").unwrap().is_empty());
    assert!(parse("a..b").is_err());
    assert!(parse("a[x]").is_err());
  }

  #[test]
  fn test_lookup_supports_numeric_keys_on_arrays() {
    let value = json!({"items": [{"name": "x"}, {"name": "y"}]});
    assert_eq!(lookup(&value, "items[1].name"), Some(&json!("y")));
    assert_eq!(lookup(&value, "items.0.name"), Some(&json!("x")));
    assert_eq!(lookup(&value, "items[5]"), None);
  }

  #[test]
  fn test_set_creates_intermediate_objects() {
    let mut value = json!({"a": 1});
    set(&mut value, "b.c", json!(true)).unwrap();
    set(&mut value, "list[0]", json!("first")).unwrap();
    set(&mut value, "a", json!([])).unwrap();
    set(&mut value, "a[0]", json!("pushed")).unwrap();
    assert_eq!(
      value,
      json!({"a": ["pushed"], "b": {"c": true}, "list": ["first"]})
    );

    let mut short = json!({"items": []});
    assert!(set(&mut short, "items[3]", json!(1)).is_err());
  }

  #[test]
  fn test_remove_returns_previous_value() {
    let mut value = json!({"a": {"b": 1, "c": 2}});
    assert_eq!(remove(&mut value, "a.b").unwrap(), Some(json!(1)));
    assert_eq!(remove(&mut value, "a.zzz").unwrap(), None);
    assert_eq!(value, json!({"a": {"c": 2}}));
  }
}
