use serde_json::{Value, json};
use switchyard_config::NodeKind;

use crate::error::NodeExecutionError;
use crate::executors::{NodeCall, NodeOutput};
use crate::expr;

/// Produce the recovery value for a failed node.
///
/// Runs with `error` and `failed_node` bound in the context. Without a
/// `recovery` template the output just reports what was handled.
pub(crate) fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::ErrorHandler { recovery, .. } = &call.node.kind else {
    return Err(NodeExecutionError::invalid_config("not an error handler node"));
  };

  let snapshot = call.snapshot();
  let output = match recovery {
    Some(template) => expr::resolve_value(&snapshot, template)?,
    None => json!({
      "handled": true,
      "error": snapshot.get("error").cloned().unwrap_or(Value::Null),
      "failed_node": snapshot.get("failed_node").cloned().unwrap_or(Value::Null),
    }),
  };
  Ok(NodeOutput::new(output))
}
