//! Execution context: the live variable and result store for one run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Variables, node outputs and the run input of one execution scope.
///
/// Nested scopes (loop iterations, parallel branches, sub-workflows) work
/// on a [`child`](Self::child) copy and hand their owned outputs back with
/// [`merge_outputs`](Self::merge_outputs), so the parent only ever has a
/// single writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
  pub input: Value,
  pub variables: Map<String, Value>,
  pub node_outputs: BTreeMap<String, Value>,
  /// Scope-local bindings such as the loop item and index.
  #[serde(default, skip_serializing_if = "Map::is_empty")]
  pub locals: Map<String, Value>,
}

impl ExecutionContext {
  pub fn new(input: Value, variables: Map<String, Value>) -> Self {
    Self {
      input,
      variables,
      node_outputs: BTreeMap::new(),
      locals: Map::new(),
    }
  }

  /// Copy of this context with extra local bindings.
  pub fn child(&self, locals: Map<String, Value>) -> Self {
    let mut child = self.clone();
    child.locals.extend(locals);
    child
  }

  pub fn output(&self, node_id: &str) -> Option<&Value> {
    self.node_outputs.get(node_id)
  }

  /// Commit a node output, making it visible to later expressions.
  pub fn set_output(&mut self, node_id: impl Into<String>, output: Value) {
    self.node_outputs.insert(node_id.into(), output);
  }

  /// Copy the outputs of `node_ids` from a child context.
  pub fn merge_outputs<'a>(
    &mut self,
    child: &ExecutionContext,
    node_ids: impl IntoIterator<Item = &'a String>,
  ) {
    for id in node_ids {
      if let Some(output) = child.node_outputs.get(id) {
        self.node_outputs.insert(id.clone(), output.clone());
      }
    }
  }

  /// JSON view used by the expression resolver.
  ///
  /// Variables are exposed both as `vars` and `global`; locals are bound at
  /// the root so a loop item is reachable as `item`.
  pub fn snapshot(&self) -> Value {
    let nodes: Map<String, Value> = self
      .node_outputs
      .iter()
      .map(|(id, output)| {
        let mut entry = Map::new();
        entry.insert("output".to_string(), output.clone());
        (id.clone(), Value::Object(entry))
      })
      .collect();

    let mut root = Map::new();
    root.insert("input".to_string(), self.input.clone());
    root.insert("vars".to_string(), Value::Object(self.variables.clone()));
    root.insert("global".to_string(), Value::Object(self.variables.clone()));
    root.insert("nodes".to_string(), Value::Object(nodes));
    for (key, value) in &self.locals {
      root.insert(key.clone(), value.clone());
    }
    Value::Object(root)
  }

  /// Snapshot with `current` bound to the executing node's input.
  pub fn snapshot_with_current(&self, current: &Value) -> Value {
    let mut snapshot = self.snapshot();
    if let Value::Object(root) = &mut snapshot {
      root.insert("current".to_string(), current.clone());
    }
    snapshot
  }
}
