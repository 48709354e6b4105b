//! Request/response multiplexing and event dispatch for pairlink.
//!
//! Peers exchange three JSON frames inside relayed messages:
//!
//! ```text
//! {"type":"req","id":"…","method":"chat.send","params":{…}}
//! {"type":"res","id":"…","ok":true,"payload":{…}}
//! {"type":"event","event":"agent","payload":{…}}
//! ```
//!
//! [`RpcClient`] correlates responses with requests by id, times out
//! calls that get no answer, and fans events out to subscribed handlers.
//! It writes through a [`FrameSink`], so it neither knows nor cares how
//! frames reach the other side.

mod client;
mod error;
mod frame;
mod methods;

pub use client::{
    CHAT_SEND_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, FrameSink, RpcClient, Subscription,
};
pub use error::RpcError;
pub use frame::{RemoteError, RpcFrame};
pub use methods::{ApprovalAction, ChatSendParams, ChatSendResult, SessionList};
