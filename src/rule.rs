use crate::Result;
use crate::error::RuleError;
use crate::procs::ProcKey;
use std::fmt::Display;
use std::path::PathBuf;

/// Upper bound for group and rule name components, matching the fixed-size
/// fields of the control-plane wire format.
pub const RULE_NAME_MAX: usize = 16;

/// Maximum number of rule ids a RULE_COMPLETED start condition may reference.
pub const START_COND_MAX_IDS: usize = 8;

/// Maximum length of a parameter string (default or per-request override).
pub const PARAMS_MAX: usize = 256;

/// Index of a rule inside the store's arena. Rules are never removed before
/// shutdown, so handles stay valid for the lifetime of the supervisor.
pub type RuleHandle = usize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RuleId {
    pub group: String,
    pub rule: String,
}

impl RuleId {
    pub fn new(group: impl Into<String>, rule: impl Into<String>) -> Result<Self> {
        let id = Self {
            group: group.into(),
            rule: rule.into(),
        };
        if !valid_component(&id.group) || id.group.is_empty() {
            return Err(RuleError::InvalidId {
                name: id.to_string(),
            }
            .into());
        }
        // The rule component may be empty: that is what an indexed template
        // with a bare marker looks like after the marker is stripped.
        if !valid_component(&id.rule) {
            return Err(RuleError::InvalidId {
                name: id.to_string(),
            }
            .into());
        }
        Ok(id)
    }

    /// Parse a `<group>_<rule>` string, splitting at the first underscore.
    pub fn parse(s: &str) -> Result<Self> {
        let (group, rule) = s.split_once('_').ok_or_else(|| RuleError::MissingSeparator {
            name: s.to_string(),
        })?;
        Self::new(group, rule)
    }
}

fn valid_component(s: &str) -> bool {
    s.len() <= RULE_NAME_MAX
        && s.chars()
            .all(|c| c.is_ascii() && !c.is_ascii_control() && !c.is_ascii_whitespace())
}

impl Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.group, self.rule)
    }
}

/// A rule id referenced by a RULE_COMPLETED start condition, together with
/// its resolver cache slot. The first successful lookup fills the cache.
#[derive(Debug, Clone)]
pub struct RuleDependency {
    pub id: RuleId,
    pub cached: Option<RuleHandle>,
}

impl RuleDependency {
    pub fn new(id: RuleId) -> Self {
        Self { id, cached: None }
    }
}

#[derive(Debug, Clone)]
pub enum StartCondition {
    None,
    FileExists(PathBuf),
    RulesCompleted(Vec<RuleDependency>),
    NetDeviceExists(String),
    IpcOwnerPresent(u32),
    EnvVarEquals { name: String, value: String },
}

#[derive(Debug, Clone)]
pub enum EndCondition {
    None,
    FileExists(PathBuf),
    ExitStatus(i32),
    NetDeviceExists(String),
    IpcOwnerPresent(u32),
    /// Latched by the supervised process's ready announcement; evaluation
    /// clears the latch.
    ProcessReady { ready: bool },
    /// Countdown after the command returns. `remaining_ms` is reloaded from
    /// `reload_ms` when it expires so the rule can be re-enqueued later.
    Wait { remaining_ms: u64, reload_ms: u64 },
}

impl EndCondition {
    pub fn is_process_ready(&self) -> bool {
        matches!(self, EndCondition::ProcessReady { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Nice(i32),
    Fifo(u32),
}

impl Default for SchedPolicy {
    fn default() -> Self {
        SchedPolicy::Nice(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    None,
    Reboot,
    Restart,
    ExecRule(RuleId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RuleState {
    Idle,
    Active,
    StartCondWait,
    EndCondWait,
    Completed,
    NotCompleted,
    Failed,
}

impl RuleState {
    /// A rule in either condition-waiting state owns a timer entry.
    pub fn is_active(self) -> bool {
        matches!(self, RuleState::StartCondWait | RuleState::EndCondWait)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    Millis(u64),
}

/// The unit of supervision: run a command under start/end conditions, with a
/// time budget and a policy for what to do when it fails.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    /// Template marker: an indexed rule is cloned on demand into concrete
    /// instances whose names extend the template's name.
    pub indexed: bool,
    pub start_cond: StartCondition,
    pub end_cond: EndCondition,
    pub timeout: Timeout,
    pub command: String,
    pub params: Option<String>,
    /// One-shot per-request override of `params`, set over the control plane.
    pub optional_params: Option<String>,
    pub failure_action: FailureAction,
    pub sched: SchedPolicy,
    pub daemon: bool,
    pub uid: u32,
    pub state: RuleState,
    /// Weak forward link to the rule's live process, if any.
    pub proc: Option<ProcKey>,
}

/// Pseudo-rules carry this command and never spawn a process; they exist as
/// synchronization points in the rule graph.
pub const PSEUDO_COMMAND: &str = "NONE";

impl Rule {
    pub fn is_pseudo(&self) -> bool {
        self.command == PSEUDO_COMMAND
    }

    pub fn active(&self) -> bool {
        self.state.is_active()
    }

    /// The parameter string a spawn would use right now.
    pub fn effective_params(&self) -> Option<&str> {
        self.optional_params.as_deref().or(self.params.as_deref())
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}
