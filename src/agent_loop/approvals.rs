//! Automatic approval resolution.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::types::ApprovalRequest;

/// Answer from an [`ApprovalHandler`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Decline,
    /// Leave the request for a human to answer through
    /// [`ChatClient::add_tool_approval_response`](super::ChatClient::add_tool_approval_response).
    Defer,
}

impl ApprovalDecision {
    /// The recorded answer, or `None` when deferred.
    pub fn approved(self) -> Option<bool> {
        match self {
            Self::Approve => Some(true),
            Self::Decline => Some(false),
            Self::Defer => None,
        }
    }
}

/// Async callback consulted when a tool call requests approval.
pub type ApprovalHandler =
    Arc<dyn Fn(ApprovalRequest) -> BoxFuture<'static, ApprovalDecision> + Send + Sync>;

/// Build a handler from a synchronous policy.
pub fn approval_policy<F>(policy: F) -> ApprovalHandler
where
    F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync + 'static,
{
    Arc::new(move |request: ApprovalRequest| {
        let decision = policy(&request);
        async move { decision }.boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApprovalState;

    #[tokio::test]
    async fn policy_handler_answers_by_tool_name() {
        let handler = approval_policy(|request| {
            if request.tool_name == "read" {
                ApprovalDecision::Approve
            } else {
                ApprovalDecision::Defer
            }
        });
        let request = |name: &str| ApprovalRequest {
            tool_call_id: "c".into(),
            tool_name: name.into(),
            input: serde_json::Value::Null,
            approval: ApprovalState {
                id: "approval_c".into(),
                needs_approval: true,
                approved: None,
            },
        };
        assert_eq!(handler(request("read")).await.approved(), Some(true));
        assert_eq!(handler(request("rm")).await.approved(), None);
    }
}
