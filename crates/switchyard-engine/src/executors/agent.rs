use switchyard_config::NodeKind;

use crate::budget::ResourceUsage;
use crate::collaborators::AgentRequest;
use crate::error::NodeExecutionError;
use crate::expr;
use crate::executors::{NodeCall, NodeOutput};

pub(crate) async fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::Agent {
    agent_id,
    instructions,
    instructions_override,
    instructions_append,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not an agent node"));
  };

  let snapshot = call.snapshot();
  let base = instructions_override.as_ref().or(instructions.as_ref());
  let instructions = match (base, instructions_append) {
    (Some(base), Some(extra)) => Some(format!("{base}\n\n{extra}")),
    (Some(base), None) => Some(base.clone()),
    (None, Some(extra)) => Some(extra.clone()),
    (None, None) => None,
  };
  let instructions = match instructions {
    Some(text) => Some(expr::render_scalar(&expr::interpolate(&snapshot, &text)?)),
    None => None,
  };

  let request = AgentRequest {
    execution_id: call.scope.execution_id.clone(),
    node_id: call.node.id.clone(),
    agent_id: agent_id.clone(),
    instructions,
    input: call.input.clone(),
  };
  let response = call
    .scope
    .collaborators()
    .agents
    .invoke(request)
    .await
    .map_err(|e| NodeExecutionError::collaborator(e.message, e.retryable))?;

  Ok(NodeOutput {
    output: response.output,
    usage: ResourceUsage {
      tokens: response.tokens_used,
      cost_usd: response.cost_usd,
      api_calls: response.api_calls,
    },
    ..Default::default()
  })
}

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};

  use async_trait::async_trait;
  use serde_json::{Value, json};

  use super::*;
  use crate::collaborators::{AgentInvoker, AgentResponse, CollaboratorError};
  use crate::context::ExecutionContext;
  use crate::engine::{Collaborators, testing};
  use crate::error::ErrorKind;

  #[derive(Default)]
  struct Recording {
    requests: Mutex<Vec<AgentRequest>>,
  }

  #[async_trait]
  impl AgentInvoker for Recording {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, CollaboratorError> {
      if request.agent_id == "broken" {
        return Err(CollaboratorError::permanent("agent unavailable"));
      }
      self.requests.lock().unwrap().push(request);
      Ok(AgentResponse {
        output: json!({"answer": 42}),
        tokens_used: 30,
        cost_usd: 0.01,
        api_calls: 1,
      })
    }
  }

  #[tokio::test]
  async fn test_instructions_are_composed_and_interpolated() {
    let agent = Arc::new(Recording::default());
    let scope = testing::scope(
      json!({
        "id": "wf", "name": "agent",
        "nodes": [{
          "id": "ask", "kind": "agent", "agent_id": "writer",
          "instructions": "ignored",
          "instructions_override": "Write about ${input.topic}.",
          "instructions_append": "Be brief."
        }]
      }),
      Collaborators {
        agents: agent.clone(),
        ..Default::default()
      },
    );
    let context = ExecutionContext::new(json!({"topic": "rivers"}), Default::default());
    let node = scope.workflow.node("ask").unwrap();
    let input = json!({"k": "v"});

    let out = execute(&NodeCall {
      scope: &scope,
      node,
      context: &context,
      input: &input,
    })
    .await
    .unwrap();

    assert_eq!(out.output, json!({"answer": 42}));
    assert_eq!(out.usage.tokens, 30);
    let requests = agent.requests.lock().unwrap();
    assert_eq!(
      requests[0].instructions.as_deref(),
      Some("Write about rivers.\n\nBe brief.")
    );
    assert_eq!(requests[0].input, json!({"k": "v"}));
  }

  #[tokio::test]
  async fn test_collaborator_error_maps_kind() {
    let scope = testing::scope(
      json!({
        "id": "wf", "name": "agent",
        "nodes": [{"id": "ask", "kind": "agent", "agent_id": "broken"}]
      }),
      Collaborators {
        agents: Arc::new(Recording::default()),
        ..Default::default()
      },
    );
    let context = ExecutionContext::default();
    let err = execute(&NodeCall {
      scope: &scope,
      node: scope.workflow.node("ask").unwrap(),
      context: &context,
      input: &Value::Null,
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Collaborator);
    assert!(!err.retryable);
  }
}
