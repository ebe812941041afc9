//! Control-plane request/reply protocol.
//!
//! Clients construct an ephemeral endpoint per request, send an
//! [`ApiRequestMsg`] to the supervisor's well-known endpoint, and block for
//! the matching reply. Replies echo the client-chosen message id so stale
//! replies can be ignored.

use crate::rule::RuleId;

pub mod client;
pub mod server;

pub use client::ApiClient;

/// How many control messages the supervisor drains per tick before yielding.
pub const MSG_BUDGET_PER_TICK: u32 = 5;

/// Outcome of a control-plane operation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumIs,
)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Ok,
    /// Operation deferred: a sync termination has not completed yet.
    Wait,
    /// No such rule, or the rule's state does not admit the operation.
    InvalidRule,
    /// Malformed request.
    BadParams,
    /// The reply did not arrive within the deadline.
    Timeout,
    Error,
}

/// Rule state as reported to clients.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum PublicRuleState {
    Idle,
    Running,
    CompletedProcessRunning,
    CompletedProcessExited,
    NotCompleted,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, strum::Display)]
pub enum ApiRequest {
    StartProcess {
        rule: RuleId,
        params: Option<String>,
    },
    TerminateProcess {
        rule: RuleId,
    },
    /// Like TerminateProcess, but the reply is deferred until the process
    /// has been reaped.
    TerminateProcessSync {
        rule: RuleId,
    },
    KillProcess {
        rule: RuleId,
    },
    SignalProcess {
        rule: RuleId,
        sig: i32,
    },
    ProcessReady {
        pid: u32,
    },
    GetRuleState {
        rule: RuleId,
    },
    ReduceNetRxPriority {
        priority: i32,
    },
    RestoreNetRxPriority,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApiRequestMsg {
    pub msg_id: u32,
    pub request: ApiRequest,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApiReply {
    pub msg_id: u32,
    pub rule_state: Option<PublicRuleState>,
    pub status: ApiStatus,
}

/// What the server needs to answer a request later: the sender's registry
/// slot and the message id to echo.
#[derive(Debug, Clone, Copy)]
pub struct ReplyCookie {
    pub src_slot: i32,
    pub msg_id: u32,
}
