//! Transform nodes reshape their input with a list of field operations.

use serde_json::Value;
use switchyard_config::{ConvertTarget, NodeKind, TransformOp};

use crate::error::{ErrorKind, NodeExecutionError};
use crate::executors::{NodeCall, NodeOutput};
use crate::expr::{self, ExprError};
use crate::{path, schema};

pub(crate) fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::Transform {
    operations,
    validation_schema,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not a transform node"));
  };

  let snapshot = call.snapshot();
  let mut data = match call.input {
    Value::Null => Value::Object(Default::default()),
    other => other.clone(),
  };
  for op in operations {
    apply(&snapshot, op, &mut data)?;
  }

  if let Some(schema) = validation_schema {
    schema::validate(&data, schema).map_err(NodeExecutionError::schema)?;
  }
  Ok(NodeOutput::new(data))
}

fn apply(snapshot: &Value, op: &TransformOp, data: &mut Value) -> Result<(), NodeExecutionError> {
  match op {
    TransformOp::Set { path, value } => {
      let value = expr::resolve_value(snapshot, value)?;
      path::set(data, path, value)?;
    }
    TransformOp::Append { path, value } | TransformOp::Prepend { path, value } => {
      let value = expr::resolve_value(snapshot, value)?;
      let front = matches!(op, TransformOp::Prepend { .. });
      let updated = match path::lookup(data, path).cloned() {
        None | Some(Value::Null) => Value::Array(vec![value]),
        Some(Value::Array(mut items)) => {
          if front {
            items.insert(0, value);
          } else {
            items.push(value);
          }
          Value::Array(items)
        }
        Some(Value::String(s)) => {
          let extra = expr::render_scalar(&value);
          Value::String(if front {
            format!("{extra}{s}")
          } else {
            format!("{s}{extra}")
          })
        }
        Some(_) => {
          return Err(NodeExecutionError::new(
            ErrorKind::InvalidConfig,
            format!("cannot add to '{path}': not an array or string"),
            false,
          ));
        }
      };
      path::set(data, path, updated)?;
    }
    TransformOp::Delete { path } => {
      path::remove(data, path)?;
    }
    TransformOp::Rename { from, to } => {
      if let Some(value) = path::remove(data, from)? {
        path::set(data, to, value)?;
      }
    }
    TransformOp::Convert { path, to } => {
      let Some(current) = path::lookup(data, path).cloned() else {
        return Ok(());
      };
      let converted = convert(&current, *to).map_err(|message| ExprError::Transform {
        transform: format!("convert {path}"),
        message,
      })?;
      path::set(data, path, converted)?;
    }
  }
  Ok(())
}

fn convert(value: &Value, to: ConvertTarget) -> Result<Value, String> {
  match to {
    ConvertTarget::String => Ok(Value::String(expr::render_scalar(value))),
    ConvertTarget::Json => match value {
      Value::String(s) => serde_json::from_str(s).map_err(|e| e.to_string()),
      other => Ok(other.clone()),
    },
    ConvertTarget::Boolean => match value {
      Value::Bool(b) => Ok(Value::Bool(*b)),
      Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
      Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(Value::Bool(true)),
        "false" | "no" | "0" | "" => Ok(Value::Bool(false)),
        other => Err(format!("'{other}' is not a boolean")),
      },
      Value::Null => Ok(Value::Bool(false)),
      _ => Err("cannot convert a collection to a boolean".to_string()),
    },
    ConvertTarget::Number | ConvertTarget::Integer => {
      let number = match value {
        Value::Number(n) => n.as_f64().ok_or("number out of range")?,
        Value::String(s) => s
          .trim()
          .parse::<f64>()
          .map_err(|_| format!("'{s}' is not a number"))?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return Err("value is not numeric".to_string()),
      };
      if to == ConvertTarget::Integer {
        Ok(Value::from(number.trunc() as i64))
      } else {
        serde_json::Number::from_f64(number)
          .map(Value::Number)
          .ok_or_else(|| "number is not finite".to_string())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::context::ExecutionContext;
  use crate::engine::{Collaborators, testing};

  fn transform(ops: Value, schema: Option<Value>, input: Value) -> Result<Value, NodeExecutionError> {
    let mut node = json!({"id": "t", "kind": "transform", "operations": ops});
    if let Some(schema) = schema {
      node["validation_schema"] = schema;
    }
    let scope = testing::scope(
      json!({"id": "wf", "name": "t", "nodes": [node]}),
      Collaborators::default(),
    );
    let context = ExecutionContext::new(json!({"user": "ada"}), Default::default());
    execute(&NodeCall {
      scope: &scope,
      node: scope.workflow.node("t").unwrap(),
      context: &context,
      input: &input,
    })
    .map(|out| out.output)
  }

  #[test]
  fn test_operations_apply_in_order() {
    let out = transform(
      json!([
        {"op": "set", "path": "owner", "value": "${input.user}"},
        {"op": "append", "path": "tags", "value": "new"},
        {"op": "prepend", "path": "tags", "value": "first"},
        {"op": "rename", "from": "old", "to": "meta.legacy"},
        {"op": "delete", "path": "tmp"},
        {"op": "convert", "path": "count", "to": "integer"},
        {"op": "convert", "path": "flag", "to": "boolean"}
      ]),
      None,
      json!({"tags": ["x"], "old": 1, "tmp": true, "count": "12.7", "flag": "yes"}),
    )
    .unwrap();

    assert_eq!(
      out,
      json!({
        "owner": "ada",
        "tags": ["first", "x", "new"],
        "meta": {"legacy": 1},
        "count": 12,
        "flag": true
      })
    );
  }

  #[test]
  fn test_schema_violation() {
    let err = transform(
      json!([{"op": "delete", "path": "id"}]),
      Some(json!({"type": "object", "required": ["id"]})),
      json!({"id": 1}),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SchemaViolation);
  }

  #[test]
  fn test_bad_conversion_fails() {
    let err = transform(
      json!([{"op": "convert", "path": "n", "to": "number"}]),
      None,
      json!({"n": "many"}),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Expression);
  }
}
