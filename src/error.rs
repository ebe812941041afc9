//! Diagnostic error types for rich error reporting via miette.

use crate::rule::RuleId;
use miette::Diagnostic;
use thiserror::Error;

/// Errors related to rules and the rule store.
#[derive(Debug, Error, Diagnostic)]
pub enum RuleError {
    #[error("rule id '{name}' is missing the '_' group separator")]
    #[diagnostic(
        code(pcd::rule::missing_separator),
        help("rule ids take the form <group>_<rule>, e.g. 'net_dhcp'")
    )]
    MissingSeparator { name: String },

    #[error("rule id '{name}' contains invalid or overlong components")]
    #[diagnostic(
        code(pcd::rule::invalid_id),
        help("group and rule names are printable ASCII without whitespace, at most 16 bytes each")
    )]
    InvalidId { name: String },

    #[error("multiple definitions of rule {id}")]
    #[diagnostic(code(pcd::rule::duplicate))]
    Duplicate { id: RuleId },

    #[error("rule {id} not found")]
    #[diagnostic(code(pcd::rule::not_found))]
    NotFound { id: RuleId },

    #[error("rule {id} is already active")]
    #[diagnostic(
        code(pcd::rule::already_active),
        help("a rule cannot be enqueued while it is waiting on a condition or owns a process")
    )]
    AlreadyActive { id: RuleId },

    #[error("rule {id} is not queued in the scheduler")]
    #[diagnostic(code(pcd::rule::not_queued))]
    NotQueued { id: RuleId },

    #[error("no process is associated with rule {id}")]
    #[diagnostic(code(pcd::rule::no_process))]
    NoProcess { id: RuleId },

    #[error("process {pid} is not running (rule {id})")]
    #[diagnostic(code(pcd::rule::process_not_running))]
    ProcessNotRunning { id: RuleId, pid: u32 },

    #[error("process {pid} already running (rule {id})")]
    #[diagnostic(code(pcd::rule::process_running))]
    ProcessRunning { id: RuleId, pid: u32 },
}

/// Errors related to the IPC transport and registry.
#[derive(Debug, Error, Diagnostic)]
pub enum IpcError {
    #[error("endpoint registry is full ({capacity} slots)")]
    #[diagnostic(
        code(pcd::ipc::registry_full),
        help("stop an unused endpoint or raise the registry capacity")
    )]
    RegistryFull { capacity: usize },

    #[error("registry slot {slot} is vacant")]
    #[diagnostic(code(pcd::ipc::slot_vacant))]
    SlotVacant { slot: i32 },

    #[error("registry slot {slot} is owned by pid {owner}, not pid {pid}")]
    #[diagnostic(
        code(pcd::ipc::not_slot_owner),
        help("only the process that started an endpoint may stop it")
    )]
    NotSlotOwner { slot: i32, owner: u32, pid: u32 },

    #[error("another instance already owns endpoint '{name}'")]
    #[diagnostic(
        code(pcd::ipc::second_instance),
        help("a live process is bound to the socket; is another pcd running?")
    )]
    SecondInstance { name: String },

    #[error("invalid message magic {magic:#010x}")]
    #[diagnostic(
        code(pcd::ipc::bad_magic),
        help("the datagram did not originate from a pcd IPC endpoint")
    )]
    BadMagic { magic: u32 },

    #[error("truncated message: header says {expected} bytes, received {actual}")]
    #[diagnostic(code(pcd::ipc::truncated))]
    Truncated { expected: usize, actual: usize },

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    #[diagnostic(code(pcd::ipc::message_too_large))]
    MessageTooLarge { size: usize, max: usize },

    #[error("no endpoint claims owner id {owner}")]
    #[diagnostic(
        code(pcd::ipc::owner_not_found),
        help("ensure the supervisor is running: pcd run -f <rules-file>")
    )]
    OwnerNotFound { owner: u32 },

    #[error("no reply within {ms} ms")]
    #[diagnostic(code(pcd::ipc::timeout))]
    Timeout { ms: u64 },

    #[error("request rejected: {status}")]
    #[diagnostic(code(pcd::ipc::request_failed))]
    RequestFailed { status: crate::api::ApiStatus },
}

/// Errors related to the rules file front-end.
#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error("failed to read rules file: {}", path.display())]
    #[diagnostic(code(pcd::parser::read_error))]
    ReadError {
        path: std::path::PathBuf,
        #[help]
        details: Option<String>,
    },

    #[error("{}:{line}: {reason}", path.display())]
    #[diagnostic(code(pcd::parser::syntax_error))]
    Syntax {
        path: std::path::PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{}:{line}: rule block is missing required keyword {keyword}", path.display())]
    #[diagnostic(
        code(pcd::parser::incomplete_rule),
        help("every rule needs RULE, START_COND, COMMAND, END_COND, END_COND_TIMEOUT, FAILURE_ACTION and ACTIVE")
    )]
    IncompleteRule {
        path: std::path::PathBuf,
        line: usize,
        keyword: &'static str,
    },

    #[error("include depth limit exceeded at {}", path.display())]
    #[diagnostic(
        code(pcd::parser::include_depth),
        help("INCLUDE files may nest at most 10 levels; check for an include cycle")
    )]
    IncludeDepth { path: std::path::PathBuf },
}
