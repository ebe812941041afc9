//! The process table: spawning, signalling, graceful termination with
//! escalation to kill, and staging of asynchronous child exits.
//!
//! Child exits are observed by per-child waiter tasks which publish the exit
//! disposition into a channel; the tick loop drains the channel at tick
//! boundaries and flips the matching entry to `Stopping`. The synchronous
//! passes then advance `Stopping -> Stopped` and hand stopped entries to the
//! post-mortem dispatcher.

use crate::Result;
use crate::api::ReplyCookie;
use crate::env;
use crate::error::RuleError;
use crate::rule::{Rule, RuleHandle, SchedPolicy};
use crate::store::RuleStore;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::sync::mpsc;

/// Ticks a freshly spawned process spends in `Starting` before it is
/// considered `Running`.
pub const SPAWN_WARMUP_TICKS: u32 = 3;

/// Ticks between the graceful termination signal and the hard kill.
pub const TERM_GRACE_TICKS: u32 = 7;

/// Maximum number of argv entries built from a parameter string.
pub const MAX_ARGS: usize = 32;

/// Stable identifier of a process record. Keys are never reused.
pub type ProcKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProcState {
    RunMe,
    Starting,
    Running,
    TermMe,
    KillMe,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    None,
    Exited(i32),
    Signalled(i32),
    Stopped(i32),
}

#[derive(Debug)]
pub struct ProcEntry {
    pub key: ProcKey,
    /// Owning rule. Stays linked for post-mortem dispatch even after the
    /// rule's forward pointer is cleared by a stop.
    pub rule: Option<RuleHandle>,
    pub pid: Option<u32>,
    pub state: ProcState,
    pub disposition: ExitDisposition,
    /// Warm-up countdown while `Starting`, grace countdown while `KillMe`.
    pub ticks: u32,
    /// Set when we initiated the termination, so the post-mortem treats the
    /// death as expected.
    pub signalled_by_us: bool,
    /// A parked sync-termination RPC awaiting the reaped process.
    pub cookie: Option<ReplyCookie>,
}

pub struct ProcessTable {
    entries: Vec<ProcEntry>,
    next_key: ProcKey,
    exits_tx: mpsc::UnboundedSender<(u32, ExitDisposition)>,
    exits_rx: mpsc::UnboundedReceiver<(u32, ExitDisposition)>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            entries: Vec::new(),
            next_key: 1,
            exits_tx,
            exits_rx,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: ProcKey) -> Option<&ProcEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn get_mut(&mut self, key: ProcKey) -> Option<&mut ProcEntry> {
        self.entries.iter_mut().find(|e| e.key == key)
    }

    /// Rule owning the process with the given pid.
    pub fn rule_by_pid(&self, pid: u32) -> Option<RuleHandle> {
        self.entries
            .iter()
            .find(|e| e.pid == Some(pid))
            .and_then(|e| e.rule)
    }

    /// Pids of every process we have spawned and not yet reaped.
    pub fn live_pids(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|e| !matches!(e.state, ProcState::Stopping | ProcState::Stopped))
            .filter_map(|e| e.pid)
            .collect()
    }

    /// Create a process record for the rule in state `RunMe` and link the
    /// two together. Fails if the rule already has a live process.
    pub fn enqueue(&mut self, store: &mut RuleStore, h: RuleHandle) -> Result<ProcKey> {
        let rule = store.get(h);
        if let Some(key) = rule.proc {
            let pid = self.get(key).and_then(|e| e.pid).unwrap_or(0);
            warn!(
                "cannot start process, {} ({pid}) already running (rule {})",
                rule.command, rule.id
            );
            return Err(RuleError::ProcessRunning {
                id: rule.id.clone(),
                pid,
            }
            .into());
        }
        let key = self.next_key;
        self.next_key += 1;
        self.entries.push(ProcEntry {
            key,
            rule: Some(h),
            pid: None,
            state: ProcState::RunMe,
            disposition: ExitDisposition::None,
            ticks: 0,
            signalled_by_us: false,
            cookie: None,
        });
        store.get_mut(h).proc = Some(key);
        Ok(key)
    }

    /// Request termination of the rule's process. `brutal` skips the grace
    /// period. The rule's forward pointer is cleared immediately; the record
    /// lives on until the post-mortem pass publishes its disposition.
    pub fn stop(
        &mut self,
        store: &mut RuleStore,
        h: RuleHandle,
        brutal: bool,
        cookie: Option<ReplyCookie>,
    ) -> Result<()> {
        let rule = store.get(h);
        let Some(key) = rule.proc else {
            warn!("cannot stop process, no process is associated with rule {}", rule.id);
            return Err(RuleError::NoProcess { id: rule.id.clone() }.into());
        };
        let id = rule.id.clone();
        let command = rule.command.clone();
        let entry = self.get_mut(key).expect("rule points at a live record");
        match entry.state {
            ProcState::Stopped | ProcState::Stopping => {
                // The process already exited on its own and we got a stop
                // request afterwards; mark it as an expected death.
                entry.signalled_by_us = true;
            }
            ProcState::RunMe | ProcState::Starting | ProcState::Running => {}
            _ => {
                warn!("cannot stop process, {command} is not running (rule {id})");
                return Err(RuleError::ProcessNotRunning {
                    id,
                    pid: entry.pid.unwrap_or(0),
                }
                .into());
            }
        }
        entry.state = if brutal {
            ProcState::KillMe
        } else {
            ProcState::TermMe
        };
        entry.ticks = 0;
        entry.cookie = cookie;
        store.get_mut(h).proc = None;
        Ok(())
    }

    /// Deliver a signal to the rule's process. Restricted to processes that
    /// are actually up; the caller restricts the signal set.
    pub fn signal_by_rule(&self, store: &RuleStore, h: RuleHandle, sig: Signal) -> Result<()> {
        let rule = store.get(h);
        let entry = rule.proc.and_then(|key| self.get(key));
        let Some(entry) = entry else {
            warn!("cannot signal process, {} is not running (rule {})", rule.command, rule.id);
            return Err(RuleError::NoProcess { id: rule.id.clone() }.into());
        };
        if !matches!(entry.state, ProcState::Starting | ProcState::Running) {
            warn!("cannot signal process, {} is not running (rule {})", rule.command, rule.id);
            return Err(RuleError::ProcessNotRunning {
                id: rule.id.clone(),
                pid: entry.pid.unwrap_or(0),
            }
            .into());
        }
        if let Some(pid) = entry.pid {
            kill(Pid::from_raw(pid as i32), sig).ok();
        }
        Ok(())
    }

    /// Drain staged child exits into the table. Runs at tick boundaries so
    /// the synchronous passes observe a consistent `Stopping` state.
    pub fn drain_exits(&mut self) {
        while let Ok((pid, disposition)) = self.exits_rx.try_recv() {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.pid == Some(pid)) {
                trace!("child {pid} exited: {disposition:?}");
                entry.disposition = disposition;
                entry.state = ProcState::Stopping;
            }
        }
    }

    /// Spawn pass: fork `RunMe` entries and count `Starting` entries up to
    /// `Running`.
    pub fn iterate_start(&mut self, store: &RuleStore) {
        for i in 0..self.entries.len() {
            match self.entries[i].state {
                ProcState::RunMe => {
                    let Some(h) = self.entries[i].rule else {
                        continue;
                    };
                    let rule = store.get(h);
                    info!("starting process {} (rule {})", rule.command, rule.id);
                    match spawn_child(rule, self.exits_tx.clone()) {
                        Ok(pid) => {
                            let entry = &mut self.entries[i];
                            entry.pid = Some(pid);
                            entry.state = ProcState::Starting;
                            entry.ticks = SPAWN_WARMUP_TICKS;
                        }
                        Err(e) => {
                            error!("failed to spawn {} (rule {}): {e}", rule.command, rule.id);
                            // Treated like a child that aborted at exec time.
                            let entry = &mut self.entries[i];
                            entry.disposition = ExitDisposition::Exited(libc::SIGABRT);
                            entry.state = ProcState::Stopping;
                        }
                    }
                }
                ProcState::Starting => {
                    let entry = &mut self.entries[i];
                    if entry.ticks == 0 {
                        entry.state = ProcState::Running;
                    } else {
                        entry.ticks -= 1;
                    }
                }
                _ => {}
            }
        }
    }

    /// Teardown pass: publish reaped exits, walk the termination ladder.
    /// Stopped entries are left in place for the post-mortem dispatcher.
    pub fn iterate_stop(&mut self, store: &RuleStore) {
        for i in 0..self.entries.len() {
            match self.entries[i].state {
                ProcState::Stopping => {
                    // Deal with the disposition in the next pass.
                    self.entries[i].state = ProcState::Stopped;
                }
                ProcState::TermMe => {
                    // Serialize terminations: wait while another process is
                    // inside its kill window.
                    if self.entries.iter().any(|e| e.state == ProcState::KillMe) {
                        continue;
                    }
                    let rule = self.entries[i].rule.map(|h| store.get(h));
                    let entry = &mut self.entries[i];
                    match entry.pid {
                        Some(pid) => {
                            if let Some(rule) = rule {
                                info!("terminating process {} ({pid}) (rule {})", rule.command, rule.id);
                            }
                            entry.state = ProcState::KillMe;
                            entry.ticks = TERM_GRACE_TICKS;
                            entry.signalled_by_us = true;
                            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_err() {
                                entry.state = ProcState::Stopped;
                            }
                        }
                        None => entry.state = ProcState::Stopped,
                    }
                }
                ProcState::KillMe => {
                    let rule = self.entries[i].rule.map(|h| store.get(h));
                    let entry = &mut self.entries[i];
                    if entry.ticks > 0 {
                        entry.ticks -= 1;
                        continue;
                    }
                    match entry.pid {
                        Some(pid) => {
                            if let Some(rule) = rule {
                                info!("killing process {} ({pid}) (rule {})", rule.command, rule.id);
                            }
                            entry.state = ProcState::Stopped;
                            entry.signalled_by_us = true;
                            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                        }
                        None => {
                            if let Some(rule) = rule {
                                error!("no process {} spawned, removing (rule {})", rule.command, rule.id);
                            }
                            entry.state = ProcState::Stopped;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Keys of entries ready for post-mortem dispatch.
    pub fn stopped_keys(&self) -> Vec<ProcKey> {
        self.entries
            .iter()
            .filter(|e| e.state == ProcState::Stopped)
            .map(|e| e.key)
            .collect()
    }

    pub fn remove(&mut self, key: ProcKey) {
        self.entries.retain(|e| e.key != key);
    }

    #[cfg(test)]
    pub(crate) fn inject_exit(&mut self, pid: u32, disposition: ExitDisposition) {
        self.exits_tx.send((pid, disposition)).unwrap();
    }
}

/// Spawn the rule's command. The child resets its signal dispositions,
/// applies the rule's scheduling policy, and drops privileges before exec.
/// Returns the child pid; a waiter task publishes the exit disposition.
fn spawn_child(rule: &Rule, exits_tx: mpsc::UnboundedSender<(u32, ExitDisposition)>) -> Result<u32> {
    let (argv, redirect) = build_argv(rule)?;
    let mut cmd = tokio::process::Command::new(&rule.command);
    cmd.args(&argv);
    cmd.stdin(Stdio::null());
    if let Some(path) = redirect {
        let file = fs::File::create(&path)
            .map_err(|e| miette::miette!("cannot redirect stdout to {}: {e}", path.display()))?;
        cmd.stdout(Stdio::from(file));
    }
    let sched = rule.sched;
    let uid = rule.uid;
    unsafe {
        cmd.pre_exec(move || {
            // Everything here must be async-signal-safe.
            for sig in 1..32 {
                libc::signal(sig, libc::SIG_DFL);
            }
            match sched {
                SchedPolicy::Nice(nice) => {
                    let param = libc::sched_param { sched_priority: 0 };
                    libc::sched_setscheduler(0, libc::SCHED_OTHER, &param);
                    libc::setpriority(libc::PRIO_PROCESS as _, 0, nice);
                }
                SchedPolicy::Fifo(prio) => {
                    let param = libc::sched_param {
                        sched_priority: prio as libc::c_int,
                    };
                    libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
                }
            }
            if uid != 0 {
                libc::setreuid(uid, uid);
            }
            Ok(())
        });
    }
    let mut child = cmd.spawn().map_err(|e| {
        miette::miette!("spawn of {} failed: {e}", rule.command)
    })?;
    let pid = child
        .id()
        .ok_or_else(|| miette::miette!("spawned {} but no pid was reported", rule.command))?;
    tokio::spawn(async move {
        let disposition = match child.wait().await {
            Ok(status) => disposition_from_status(status),
            Err(e) => {
                warn!("wait on child {pid} failed: {e}");
                ExitDisposition::Exited(1)
            }
        };
        let _ = exits_tx.send((pid, disposition));
    });
    Ok(pid)
}

fn disposition_from_status(status: std::process::ExitStatus) -> ExitDisposition {
    if let Some(code) = status.code() {
        ExitDisposition::Exited(code)
    } else if let Some(sig) = status.signal() {
        ExitDisposition::Signalled(sig)
    } else if let Some(sig) = status.stopped_signal() {
        ExitDisposition::Stopped(sig)
    } else {
        ExitDisposition::Exited(1)
    }
}

/// Build the argv tail for a rule's command from its parameter string.
///
/// Tokens are split on ASCII whitespace. `$NAME` and `${NAME}` references
/// resolve against a file `<temp-path>/NAME` first, then the process
/// environment; unresolvable references are silently dropped, and resolved
/// values containing whitespace contribute multiple argv tokens. Text after
/// a closing `}` is concatenated to the last produced token. A token
/// containing `>` consumes the following token as a stdout redirection
/// target.
pub fn build_argv(rule: &Rule) -> Result<(Vec<String>, Option<PathBuf>)> {
    let params = rule.effective_params().unwrap_or_default();
    let mut argv: Vec<String> = Vec::new();
    let mut redirect = None;
    let mut tokens = params.split_ascii_whitespace();
    while let Some(token) = tokens.next() {
        if argv.len() >= MAX_ARGS {
            break;
        }
        if let Some(stripped) = token.strip_prefix('$') {
            let (name, suffix) = match stripped.strip_prefix('{') {
                Some(braced) => match braced.split_once('}') {
                    Some((name, suffix)) => (name, suffix),
                    None => continue,
                },
                None => (stripped, ""),
            };
            let Some(value) = resolve_var(name) else {
                // No such variable anywhere: drop the token.
                continue;
            };
            let mut parts = value
                .split_ascii_whitespace()
                .map(truncate_param)
                .collect::<Vec<_>>();
            if let (Some(last), false) = (parts.last_mut(), suffix.is_empty()) {
                last.push_str(suffix);
            } else if parts.is_empty() && !suffix.is_empty() {
                parts.push(suffix.to_string());
            }
            for part in parts {
                if argv.len() >= MAX_ARGS {
                    break;
                }
                argv.push(part);
            }
        } else if token.contains('>') {
            if let Some(target) = tokens.next() {
                redirect = Some(PathBuf::from(target));
            }
        } else {
            argv.push(token.to_string());
        }
    }
    Ok((argv, redirect))
}

/// Resolve a `$NAME` reference: a file `<temp-path>/NAME` takes precedence
/// over the process environment.
fn resolve_var(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    let path = env::PCD_TEMP_PATH.join(name);
    if let Ok(contents) = fs::read_to_string(&path) {
        let line = contents.lines().next().unwrap_or_default();
        if !line.is_empty() {
            return Some(line.to_string());
        }
    }
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn truncate_param(s: &str) -> String {
    let max = crate::rule::PARAMS_MAX;
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
