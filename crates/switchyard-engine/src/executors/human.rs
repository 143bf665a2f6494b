//! Human-in-the-loop nodes pause for an approval decision.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use switchyard_config::NodeKind;
use tracing::{info, warn};

use crate::collaborators::ApprovalRequest;
use crate::error::{ErrorKind, NodeExecutionError};
use crate::executors::{NodeCall, NodeOutput};
use crate::expr;
use crate::result::Route;

const REJECTIONS: [&str; 2] = ["reject", "rejected"];

pub(crate) async fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::HumanInLoop {
    prompt,
    options,
    approval_timeout_ms,
    escalation_after_ms,
    escalation_to,
    rejected_target,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not a human-in-the-loop node"));
  };

  let snapshot = call.snapshot();
  let request = ApprovalRequest {
    execution_id: call.scope.execution_id.clone(),
    node_id: call.node.id.clone(),
    prompt: expr::render_scalar(&expr::interpolate(&snapshot, prompt)?),
    options: options.clone(),
    context: call.input.clone(),
  };
  let approvals = &call.scope.collaborators().approvals;

  let escalated = AtomicBool::new(false);
  // Runs beside the approval wait and never finishes it.
  let escalation = async {
    sleep_or_pending(*escalation_after_ms).await;
    escalated.store(true, Ordering::SeqCst);
    info!(
      node_id = %call.node.id,
      escalation_to = ?escalation_to,
      "approval escalated"
    );
    if let Err(e) = approvals.escalate(&request, escalation_to.as_deref()).await {
      warn!(node_id = %call.node.id, error = %e, "approval escalation failed");
    }
    std::future::pending::<Infallible>().await
  };

  let decision = tokio::select! {
    decision = approvals.request_approval(&request) => decision,
    never = escalation => match never {},
    _ = sleep_or_pending(*approval_timeout_ms) => {
      return Err(NodeExecutionError::new(
        ErrorKind::Timeout,
        format!(
          "no approval decision within {}ms",
          approval_timeout_ms.unwrap_or_default()
        ),
        false,
      ));
    }
  };
  let decision =
    decision.map_err(|e| NodeExecutionError::collaborator(e.message, e.retryable))?;
  let escalated = escalated.load(Ordering::SeqCst);

  if !options.contains(&decision.option) {
    return Err(NodeExecutionError::collaborator(
      format!(
        "approval answered '{}', expected one of: {}",
        decision.option,
        options.join(", ")
      ),
      false,
    ));
  }

  let rejected = REJECTIONS.contains(&decision.option.as_str());
  let route = match (rejected, rejected_target) {
    (true, Some(target)) => Some(Route::Only {
      target: target.clone(),
    }),
    (true, None) => {
      return Err(NodeExecutionError::new(
        ErrorKind::Rejected,
        format!("approval '{}' was rejected", call.node.id),
        false,
      ));
    }
    (false, Some(target)) => Some(Route::Exclude {
      target: target.clone(),
    }),
    (false, None) => None,
  };

  Ok(NodeOutput {
    output: json!({
      "decision": decision.option,
      "comment": decision.comment,
      "escalated": escalated,
    }),
    route,
    ..Default::default()
  })
}

async fn sleep_or_pending(ms: Option<u64>) {
  match ms {
    Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Instant;

  use async_trait::async_trait;
  use serde_json::Value;

  use super::*;
  use crate::collaborators::{ApprovalChannel, ApprovalDecision, AutoApprove, CollaboratorError};
  use crate::context::ExecutionContext;
  use crate::engine::{Collaborators, testing};

  /// Answers after a delay and records escalations.
  struct SlowApprover {
    delay_ms: u64,
    escalate_delay_ms: u64,
    escalated: AtomicBool,
  }

  fn approver(delay_ms: u64, escalate_delay_ms: u64) -> Arc<SlowApprover> {
    Arc::new(SlowApprover {
      delay_ms,
      escalate_delay_ms,
      escalated: AtomicBool::new(false),
    })
  }

  #[async_trait]
  impl ApprovalChannel for SlowApprover {
    async fn request_approval(
      &self,
      _request: &ApprovalRequest,
    ) -> Result<ApprovalDecision, CollaboratorError> {
      tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
      Ok(ApprovalDecision {
        option: "approve".to_string(),
        comment: Some("fine".to_string()),
      })
    }

    async fn escalate(
      &self,
      _request: &ApprovalRequest,
      escalate_to: Option<&str>,
    ) -> Result<(), CollaboratorError> {
      assert_eq!(escalate_to, Some("lead"));
      self.escalated.store(true, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(self.escalate_delay_ms)).await;
      Ok(())
    }
  }

  const GATED: &str = r#"{
    "id": "wf", "name": "gate",
    "nodes": [
      {"id": "gate", "kind": "human_in_loop", "prompt": "Ship ${input.release}?",
        "escalation_after_ms": 10, "escalation_to": "lead", "approval_timeout_ms": 1000,
        "rejected_target": "rollback"},
      {"id": "ship", "kind": "agent", "agent_id": "x"},
      {"id": "rollback", "kind": "agent", "agent_id": "x"}
    ],
    "edges": [
      {"source_id": "gate", "target_id": "ship"},
      {"source_id": "gate", "target_id": "rollback"}
    ]
  }"#;

  async fn ask(
    approvals: Arc<dyn ApprovalChannel>,
    tweak: impl FnOnce(&mut Value),
  ) -> Result<NodeOutput, NodeExecutionError> {
    let mut def: Value = serde_json::from_str(GATED).unwrap();
    tweak(&mut def);
    let scope = testing::scope(
      def,
      Collaborators {
        approvals,
        ..Default::default()
      },
    );
    let input = json!({"release": "1.2"});
    let context = ExecutionContext::new(input.clone(), Default::default());
    execute(&NodeCall {
      scope: &scope,
      node: scope.workflow.node("gate").unwrap(),
      context: &context,
      input: &input,
    })
    .await
  }

  #[tokio::test]
  async fn test_approval_excludes_rejection_path_and_escalates() {
    let approver = approver(40, 0);
    let out = ask(approver.clone(), |_| {}).await.unwrap();

    assert_eq!(
      out.output,
      json!({"decision": "approve", "comment": "fine", "escalated": true})
    );
    assert_eq!(
      out.route,
      Some(Route::Exclude {
        target: "rollback".to_string()
      })
    );
    assert!(approver.escalated.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn test_rejection_routes_to_target() {
    let out = ask(Arc::new(AutoApprove::new("reject")), |_| {})
      .await
      .unwrap();
    assert_eq!(
      out.route,
      Some(Route::Only {
        target: "rollback".to_string()
      })
    );
  }

  #[tokio::test]
  async fn test_rejection_without_target_fails() {
    let err = ask(Arc::new(AutoApprove::new("reject")), |def| {
      def["nodes"][0]
        .as_object_mut()
        .unwrap()
        .remove("rejected_target");
    })
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Rejected);
  }

  #[tokio::test]
  async fn test_approval_timeout() {
    let err = ask(approver(5_000, 0), |def| {
      def["nodes"][0]["approval_timeout_ms"] = json!(30)
    })
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
  }

  #[tokio::test]
  async fn test_slow_escalation_does_not_hold_off_expiry() {
    let approver = approver(5_000, 5_000);
    let started = Instant::now();
    let err = ask(approver.clone(), |def| {
      def["nodes"][0]["approval_timeout_ms"] = json!(60)
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(approver.escalated.load(Ordering::SeqCst));
    assert!(started.elapsed() < Duration::from_secs(2));
  }

  #[tokio::test]
  async fn test_decision_during_escalation_is_taken() {
    let out = ask(approver(40, 5_000), |_| {}).await.unwrap();
    assert_eq!(out.output["decision"], "approve");
    assert_eq!(out.output["escalated"], true);
  }
}
