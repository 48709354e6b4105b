//! RPC frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame of the request/response protocol, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcFrame {
    /// A call expecting one `res` with the same id.
    Req {
        /// Correlates the response.
        id: String,
        /// Gateway method name, e.g. `chat.send`.
        method: String,
        /// Method parameters.
        #[serde(default)]
        params: Value,
    },
    /// The answer to a `req`.
    Res {
        /// Id of the request being answered.
        id: String,
        /// Whether `payload` or `error` applies.
        ok: bool,
        /// Result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        /// Failure details.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
    /// An unsolicited notification.
    Event {
        /// Event name handlers subscribe to.
        event: String,
        /// Event body.
        #[serde(default)]
        payload: Value,
        /// Sender's sequence number, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

/// The error body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl Default for RemoteError {
    fn default() -> Self {
        Self {
            code: "unknown".into(),
            message: "Unknown error".into(),
        }
    }
}
