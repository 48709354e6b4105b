//! Typed helpers for the agent gateway's methods.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::client::{CHAT_SEND_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::{FrameSink, RpcClient, RpcError};

/// Parameters of `chat.send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    /// Session the message belongs to.
    pub session_key: String,
    /// The user's message.
    pub message: String,
    /// Lets the gateway drop a resent message it already accepted.
    pub idempotency_key: String,
}

/// Result of `chat.send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendResult {
    /// Id of the started run, used by `chat.abort`.
    pub run_id: String,
}

/// Result of `sessions.list`. Session entries are passed through as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionList {
    /// Raw session entries.
    #[serde(default)]
    pub sessions: Vec<Value>,
}

/// Answer to a tool-call approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    /// Let the tool call run.
    Approve,
    /// Refuse the tool call.
    Deny,
}

impl<S: FrameSink> RpcClient<S> {
    /// `chat.send`: starts an agent turn and returns its run id.
    pub async fn chat_send(&self, params: &ChatSendParams) -> Result<ChatSendResult, RpcError> {
        self.call("chat.send", params, CHAT_SEND_TIMEOUT).await
    }

    /// `chat.abort`: stops a running turn.
    pub async fn chat_abort(&self, run_id: &str) -> Result<(), RpcError> {
        self.request("chat.abort", json!({ "runId": run_id }))
            .await
            .map(drop)
    }

    /// `sessions.list`, optionally capped at `limit` entries.
    pub async fn sessions_list(&self, limit: Option<u32>) -> Result<SessionList, RpcError> {
        let params = match limit {
            Some(limit) => json!({ "limit": limit }),
            None => json!({}),
        };
        self.call("sessions.list", &params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// `sessions.usage`: token usage of one session, as reported.
    pub async fn sessions_usage(&self, session_key: &str) -> Result<Value, RpcError> {
        self.request("sessions.usage", json!({ "sessionKey": session_key }))
            .await
    }

    /// `exec.approval.resolve`: approves or denies a pending tool call.
    pub async fn resolve_approval(
        &self,
        run_id: &str,
        tool_call_id: &str,
        action: ApprovalAction,
    ) -> Result<(), RpcError> {
        self.request(
            "exec.approval.resolve",
            json!({ "runId": run_id, "toolCallId": tool_call_id, "action": action }),
        )
        .await
        .map(drop)
    }
}
