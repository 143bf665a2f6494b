//! Aggregator nodes combine the outputs of several upstream nodes.

use serde_json::{Map, Value, json};
use switchyard_config::{AggregationMethod, NodeKind};

use crate::error::NodeExecutionError;
use crate::executors::{NodeCall, NodeOutput};
use crate::{expr, path};

pub(crate) fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::Aggregator {
    method,
    sources,
    output_path,
    expression,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not an aggregator node"));
  };

  let ids: Vec<String> = if sources.is_empty() {
    let graph = call.scope.workflow.graph();
    let mut upstream: Vec<String> = Vec::new();
    for id in graph.upstream(&call.node.id) {
      if !upstream.iter().any(|u| u == id) {
        upstream.push(id.to_string());
      }
    }
    upstream
  } else {
    sources.clone()
  };

  // Sources that never produced an output (skipped or untraversed) are left out.
  let values: Vec<(&str, &Value)> = ids
    .iter()
    .filter_map(|id| call.context.output(id).map(|out| (id.as_str(), out)))
    .collect();

  let combined = match method {
    AggregationMethod::Merge => {
      let mut merged = Map::new();
      for (id, value) in &values {
        match value {
          Value::Object(map) => merged.extend(map.clone()),
          other => {
            merged.insert(id.to_string(), (*other).clone());
          }
        }
      }
      Value::Object(merged)
    }
    AggregationMethod::Concat => Value::Array(flatten(&values)),
    AggregationMethod::Collect => Value::Array(values.iter().map(|(_, v)| (*v).clone()).collect()),
    AggregationMethod::Sum | AggregationMethod::Average | AggregationMethod::Min | AggregationMethod::Max => {
      numeric(*method, &numbers(&call.node.id, &flatten(&values))?)
    }
    AggregationMethod::Custom => {
      let expression = expression.as_deref().ok_or_else(|| {
        NodeExecutionError::invalid_config("custom aggregation requires an expression")
      })?;
      let mut extra = Map::new();
      extra.insert(
        "values".to_string(),
        Value::Array(values.iter().map(|(_, v)| (*v).clone()).collect()),
      );
      expr::evaluate_with(&call.snapshot(), expression, &extra)?
    }
  };

  let output = match output_path {
    Some(output_path) => {
      let mut wrapped = Value::Object(Map::new());
      path::set(&mut wrapped, output_path, combined)?;
      wrapped
    }
    None => combined,
  };
  Ok(NodeOutput::new(output))
}

fn flatten(values: &[(&str, &Value)]) -> Vec<Value> {
  let mut flat = Vec::new();
  for (_, value) in values {
    match value {
      Value::Array(items) => flat.extend(items.iter().cloned()),
      other => flat.push((*other).clone()),
    }
  }
  flat
}

fn numbers(node_id: &str, values: &[Value]) -> Result<Vec<f64>, NodeExecutionError> {
  values
    .iter()
    .map(|v| {
      v.as_f64().ok_or_else(|| {
        NodeExecutionError::invalid_config(format!(
          "aggregator '{node_id}' expected numbers, got {v}"
        ))
      })
    })
    .collect()
}

fn numeric(method: AggregationMethod, numbers: &[f64]) -> Value {
  if numbers.is_empty() {
    return match method {
      AggregationMethod::Sum => json!(0),
      _ => Value::Null,
    };
  }
  let result = match method {
    AggregationMethod::Sum => numbers.iter().sum(),
    AggregationMethod::Average => numbers.iter().sum::<f64>() / numbers.len() as f64,
    AggregationMethod::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
    _ => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
  };
  number(result)
}

/// Integral results stay integers in JSON.
fn number(value: f64) -> Value {
  if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
    json!(value as i64)
  } else {
    json!(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::ExecutionContext;
  use crate::engine::{Collaborators, testing};
  use crate::error::ErrorKind;

  fn aggregate(agg: Value, outputs: &[(&str, Value)]) -> Result<Value, NodeExecutionError> {
    let mut agg = agg;
    agg["id"] = json!("agg");
    agg["kind"] = json!("aggregator");
    let scope = testing::scope(
      json!({
        "id": "wf", "name": "agg",
        "nodes": [
          {"id": "a", "kind": "agent", "agent_id": "x"},
          {"id": "b", "kind": "agent", "agent_id": "x"},
          {"id": "c", "kind": "agent", "agent_id": "x"},
          agg
        ],
        "edges": [
          {"source_id": "a", "target_id": "agg"},
          {"source_id": "b", "target_id": "agg"},
          {"source_id": "c", "target_id": "agg"}
        ]
      }),
      Collaborators::default(),
    );
    let mut context = ExecutionContext::default();
    for (id, out) in outputs {
      context.set_output(*id, out.clone());
    }
    execute(&NodeCall {
      scope: &scope,
      node: scope.workflow.node("agg").unwrap(),
      context: &context,
      input: &Value::Null,
    })
    .map(|out| out.output)
  }

  #[test]
  fn test_merge_and_collect() {
    let outputs = [("a", json!({"x": 1})), ("b", json!(7)), ("c", json!({"y": 2}))];
    assert_eq!(
      aggregate(json!({"method": "merge"}), &outputs).unwrap(),
      json!({"x": 1, "b": 7, "y": 2})
    );
    assert_eq!(
      aggregate(json!({"method": "collect", "output_path": "all"}), &outputs).unwrap(),
      json!({"all": [{"x": 1}, 7, {"y": 2}]})
    );
  }

  #[test]
  fn test_numeric_methods_skip_missing_sources() {
    let outputs = [("a", json!([1, 2])), ("c", json!(3.5))];
    assert_eq!(aggregate(json!({"method": "sum"}), &outputs).unwrap(), json!(6.5));
    assert_eq!(aggregate(json!({"method": "max"}), &outputs).unwrap(), json!(3.5));
    assert_eq!(aggregate(json!({"method": "min"}), &outputs).unwrap(), json!(1));
    assert_eq!(aggregate(json!({"method": "sum"}), &[]).unwrap(), json!(0));
    assert_eq!(aggregate(json!({"method": "average"}), &[]).unwrap(), Value::Null);

    let err = aggregate(json!({"method": "sum"}), &[("a", json!("x"))]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidConfig);
  }

  #[test]
  fn test_concat_and_custom() {
    let outputs = [("a", json!([1])), ("b", json!([2, 3]))];
    assert_eq!(
      aggregate(json!({"method": "concat"}), &outputs).unwrap(),
      json!([1, 2, 3])
    );
    assert_eq!(
      aggregate(
        json!({"method": "custom", "expression": "values | length", "sources": ["b", "a"]}),
        &outputs
      )
      .unwrap(),
      json!(2)
    );
  }
}
