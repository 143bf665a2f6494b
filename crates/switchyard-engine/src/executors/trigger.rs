use std::time::Duration;

use switchyard_config::NodeKind;
use tracing::debug;

use crate::error::NodeExecutionError;
use crate::executors::{NodeCall, NodeOutput};

/// Wait for a named external event; its payload is the node's output.
pub(crate) async fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::ExternalTrigger {
    event_name,
    wait_timeout_ms,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not an external trigger node"));
  };

  debug!(node_id = %call.node.id, event_name = %event_name, "waiting for event");
  let events = &call.scope.collaborators().events;
  let payload = match wait_timeout_ms {
    Some(ms) => tokio::time::timeout(Duration::from_millis(*ms), events.wait_for(event_name))
      .await
      .map_err(|_| NodeExecutionError::timeout(*ms))?,
    None => events.wait_for(event_name).await,
  }
  .map_err(|e| NodeExecutionError::collaborator(e.message, e.retryable))?;

  Ok(NodeOutput::new(payload))
}
