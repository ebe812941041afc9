//! The tick-driven rule scheduler.
//!
//! Every rule waiting on a condition owns exactly one timer entry. Each tick
//! the scheduler evaluates the current condition of every queued rule once,
//! advancing the rule through start-condition wait, process spawn,
//! end-condition wait, and completion or failure. Enqueue and dequeue
//! requests discovered during a pass are staged on side lists and applied
//! after the iteration so the timer list is never mutated while walked.

use crate::Result;
use crate::cond::{self, StartCheck};
use crate::crashlog::CrashMonitor;
use crate::error::RuleError;
use crate::failure;
use crate::ipc::registry::SharedRegistry;
use crate::procs::ProcessTable;
use crate::rule::{RuleHandle, RuleState, Timeout};
use crate::store::RuleStore;

/// Default scheduler tick and its valid range, in milliseconds.
pub const TIMER_TICK_DEFAULT_MS: u64 = 200;
pub const TIMER_TICK_MIN_MS: u64 = 10;
pub const TIMER_TICK_MAX_MS: u64 = 500;

/// How often the process-table passes run when the scheduler reports no
/// pending transitions.
pub const PROCESS_TICK_MS: u64 = 1500;

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    rule: RuleHandle,
    timeout: Timeout,
}

/// Scheduler entries for every rule in a condition-waiting state.
#[derive(Default)]
pub struct TimerList {
    enabled: bool,
    entries: Vec<TimerEntry>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.enabled = true;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_queued(&self, h: RuleHandle) -> bool {
        self.entries.iter().any(|e| e.rule == h)
    }

    /// Enqueue a rule: it enters start-condition wait with a fresh timeout
    /// budget. Rules that are already active or still own a process are
    /// rejected.
    pub fn enqueue_rule(&mut self, store: &mut RuleStore, h: RuleHandle) -> Result<()> {
        let rule = store.get(h);
        if rule.active() || rule.proc.is_some() {
            return Err(RuleError::AlreadyActive {
                id: rule.id.clone(),
            }
            .into());
        }
        let timeout = rule.timeout;
        store.get_mut(h).state = RuleState::StartCondWait;
        self.entries.push(TimerEntry { rule: h, timeout });
        Ok(())
    }

    /// Remove a rule from the scheduler, stopping its process first if one
    /// is running. `failed` marks the rule `Failed` (the process module
    /// detected a failure); otherwise a rule that neither completed nor went
    /// idle becomes `NotCompleted`.
    pub fn dequeue_rule(
        &mut self,
        store: &mut RuleStore,
        procs: &mut ProcessTable,
        h: RuleHandle,
        failed: bool,
    ) -> Result<()> {
        let Some(pos) = self.entries.iter().position(|e| e.rule == h) else {
            return Err(RuleError::NotQueued {
                id: store.get(h).id.clone(),
            }
            .into());
        };
        if store.get(h).proc.is_some() {
            let _ = procs.stop(store, h, false, None);
        }
        self.entries.remove(pos);
        let rule = store.get_mut(h);
        if failed {
            rule.state = RuleState::Failed;
        } else if !matches!(rule.state, RuleState::Completed | RuleState::Idle) {
            rule.state = RuleState::NotCompleted;
        }
        Ok(())
    }

    /// One scheduler pass. Returns true when any transition happened that
    /// warrants an immediate process-table pass.
    pub fn iterate(
        &mut self,
        store: &mut RuleStore,
        procs: &mut ProcessTable,
        registry: &SharedRegistry,
        crash: &mut CrashMonitor,
        tick_ms: u64,
    ) -> bool {
        if !self.enabled || self.entries.is_empty() {
            return false;
        }
        // Completions become visible to dependents only on the next pass.
        let snapshot = store.states_snapshot();
        let mut process_flag = false;
        let mut stage_dequeue: Vec<RuleHandle> = Vec::new();
        let mut stage_enqueue: Vec<RuleHandle> = Vec::new();

        for i in 0..self.entries.len() {
            let h = self.entries[i].rule;
            match store.get(h).state {
                RuleState::StartCondWait => {
                    process_flag |= self.handle_start_condition(
                        i,
                        store,
                        procs,
                        registry,
                        crash,
                        &snapshot,
                        &mut stage_dequeue,
                        &mut stage_enqueue,
                        tick_ms,
                    );
                }
                RuleState::EndCondWait => {
                    process_flag |= self.handle_end_condition(
                        i,
                        store,
                        procs,
                        registry,
                        crash,
                        &mut stage_dequeue,
                        &mut stage_enqueue,
                        tick_ms,
                    );
                }
                _ => {
                    // The rule left the active band behind our back; drop
                    // its timer entry.
                    stage_dequeue.push(h);
                }
            }
        }

        for h in stage_dequeue {
            self.entries.retain(|e| e.rule != h);
        }
        for h in stage_enqueue {
            if let Err(e) = self.enqueue_rule(store, h) {
                warn!("failed to enqueue rule {}: {e}", store.get(h).id);
            }
        }

        process_flag
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_start_condition(
        &mut self,
        i: usize,
        store: &mut RuleStore,
        procs: &mut ProcessTable,
        registry: &SharedRegistry,
        crash: &mut CrashMonitor,
        snapshot: &[RuleState],
        stage_dequeue: &mut Vec<RuleHandle>,
        stage_enqueue: &mut Vec<RuleHandle>,
        tick_ms: u64,
    ) -> bool {
        let h = self.entries[i].rule;
        trace!("rule {}: waiting for start condition", store.get(h).id);
        match cond::check_start(store, registry, snapshot, h) {
            StartCheck::Satisfied => {
                if store.get(h).is_pseudo() {
                    debug!("rule {}: pseudo rule start condition success", store.get(h).id);
                    store.get_mut(h).state = RuleState::EndCondWait;
                    // No process to wait for: give the end condition its
                    // first evaluation right away so a bare sync point
                    // completes within the same tick.
                    return self.handle_end_condition(
                        i,
                        store,
                        procs,
                        registry,
                        crash,
                        stage_dequeue,
                        stage_enqueue,
                        tick_ms,
                    );
                }
                match procs.enqueue(store, h) {
                    Ok(_) => {
                        store.get_mut(h).state = RuleState::EndCondWait;
                        true
                    }
                    Err(_) => {
                        // A process is somehow still attached; kill it and
                        // try again next pass.
                        let _ = procs.stop(store, h, true, None);
                        true
                    }
                }
            }
            StartCheck::Pending => self.check_timeout(
                i,
                store,
                procs,
                crash,
                stage_dequeue,
                stage_enqueue,
                tick_ms,
            ),
            StartCheck::Unresolvable(dep) => {
                error!(
                    "rule {}: referenced rule {dep} not found, cannot complete",
                    store.get(h).id
                );
                store.get_mut(h).state = RuleState::NotCompleted;
                // The next pass sees the terminal state and drops the entry.
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_end_condition(
        &mut self,
        i: usize,
        store: &mut RuleStore,
        procs: &mut ProcessTable,
        registry: &SharedRegistry,
        crash: &mut CrashMonitor,
        stage_dequeue: &mut Vec<RuleHandle>,
        stage_enqueue: &mut Vec<RuleHandle>,
        tick_ms: u64,
    ) -> bool {
        let h = self.entries[i].rule;
        trace!("rule {}: waiting for end condition", store.get(h).id);
        if cond::check_end(store, procs, registry, h, tick_ms) {
            let rule = store.get(h);
            match rule.proc.and_then(|key| procs.get(key)).and_then(|p| p.pid) {
                Some(pid) => info!("rule {}: success (process {} ({pid}))", rule.id, rule.command),
                None => info!("rule {}: success", rule.id),
            }
            store.get_mut(h).state = RuleState::Completed;
            stage_dequeue.push(h);
            return false;
        }
        self.check_timeout(
            i,
            store,
            procs,
            crash,
            stage_dequeue,
            stage_enqueue,
            tick_ms,
        )
    }

    /// Decrement the rule's time budget by one tick; on underflow mark it
    /// `NotCompleted` and run its failure action.
    fn check_timeout(
        &mut self,
        i: usize,
        store: &mut RuleStore,
        procs: &mut ProcessTable,
        crash: &mut CrashMonitor,
        stage_dequeue: &mut Vec<RuleHandle>,
        stage_enqueue: &mut Vec<RuleHandle>,
        tick_ms: u64,
    ) -> bool {
        let h = self.entries[i].rule;
        match self.entries[i].timeout {
            Timeout::Forever => false,
            Timeout::Millis(0) => {
                error!("rule {}: timeout", store.get(h).id);
                if store.get(h).proc.is_some() {
                    let _ = procs.stop(store, h, true, None);
                }
                store.get_mut(h).state = RuleState::NotCompleted;
                stage_dequeue.push(h);
                if let Some(next) = failure::run(store, procs, crash, h) {
                    stage_enqueue.push(next);
                }
                true
            }
            Timeout::Millis(remaining) => {
                self.entries[i].timeout = if remaining <= tick_ms {
                    Timeout::Millis(0)
                } else {
                    Timeout::Millis(remaining - tick_ms)
                };
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{
        EndCondition, FailureAction, PSEUDO_COMMAND, Rule, RuleDependency, RuleId, SchedPolicy,
        StartCondition,
    };

    struct World {
        store: RuleStore,
        procs: ProcessTable,
        timers: TimerList,
        registry: SharedRegistry,
        crash: CrashMonitor,
    }

    impl World {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let registry = SharedRegistry::open(dir.path()).unwrap();
            let crash = CrashMonitor::open(&dir.path().join("except")).unwrap();
            std::mem::forget(dir);
            let mut timers = TimerList::new();
            timers.start();
            Self {
                store: RuleStore::new(),
                procs: ProcessTable::new(),
                timers,
                registry,
                crash,
            }
        }

        fn tick(&mut self) -> bool {
            self.timers.iterate(
                &mut self.store,
                &mut self.procs,
                &self.registry,
                &mut self.crash,
                TIMER_TICK_DEFAULT_MS,
            )
        }

        fn state(&self, h: RuleHandle) -> RuleState {
            self.store.get(h).state
        }
    }

    fn pseudo_rule(id: &str, start: StartCondition) -> Rule {
        Rule {
            id: RuleId::parse(id).unwrap(),
            indexed: false,
            start_cond: start,
            end_cond: EndCondition::None,
            timeout: Timeout::Forever,
            command: PSEUDO_COMMAND.to_string(),
            params: None,
            optional_params: None,
            failure_action: FailureAction::None,
            sched: SchedPolicy::default(),
            daemon: false,
            uid: 0,
            state: RuleState::Active,
            proc: None,
        }
    }

    fn depends_on(id: &str) -> StartCondition {
        StartCondition::RulesCompleted(vec![RuleDependency::new(RuleId::parse(id).unwrap())])
    }

    #[test]
    fn test_linear_chain_completes_in_order() {
        let mut w = World::new();
        let a = w.store.insert(pseudo_rule("init_a", StartCondition::None)).unwrap();
        let b = w.store.insert(pseudo_rule("init_b", depends_on("init_a"))).unwrap();
        let c = w.store.insert(pseudo_rule("init_c", depends_on("init_b"))).unwrap();
        for h in [a, b, c] {
            w.timers.enqueue_rule(&mut w.store, h).unwrap();
        }

        // Tick 1: only the unconditional head completes.
        w.tick();
        assert_eq!(w.state(a), RuleState::Completed);
        assert_eq!(w.state(b), RuleState::StartCondWait);
        assert_eq!(w.state(c), RuleState::StartCondWait);

        // Tick 2: the completion of a is now visible to b.
        w.tick();
        assert_eq!(w.state(b), RuleState::Completed);
        assert_eq!(w.state(c), RuleState::StartCondWait);

        // Tick 3: the chain is done.
        w.tick();
        assert_eq!(w.state(c), RuleState::Completed);
        assert!(w.timers.is_empty());
    }

    #[test]
    fn test_completion_not_visible_same_tick() {
        // Even when the dependent precedes its dependency in the timer list
        // the propagation delay is exactly one tick.
        let mut w = World::new();
        let b = w.store.insert(pseudo_rule("init_b", depends_on("init_a"))).unwrap();
        let a = w.store.insert(pseudo_rule("init_a", StartCondition::None)).unwrap();
        w.timers.enqueue_rule(&mut w.store, b).unwrap();
        w.timers.enqueue_rule(&mut w.store, a).unwrap();

        w.tick();
        assert_eq!(w.state(a), RuleState::Completed);
        assert_eq!(w.state(b), RuleState::StartCondWait);
        w.tick();
        assert_eq!(w.state(b), RuleState::Completed);
    }

    #[test]
    fn test_timeout_marks_not_completed() {
        let mut w = World::new();
        let mut rule = pseudo_rule(
            "a_never",
            StartCondition::FileExists("/nonexistent/pcd/test/file".into()),
        );
        rule.timeout = Timeout::Millis(500);
        let h = w.store.insert(rule).unwrap();
        w.timers.enqueue_rule(&mut w.store, h).unwrap();

        // 500ms budget at 200ms ticks: two decrements, then expiry.
        w.tick();
        w.tick();
        w.tick();
        assert_eq!(w.state(h), RuleState::StartCondWait);
        w.tick();
        assert_eq!(w.state(h), RuleState::NotCompleted);
        assert!(!w.timers.is_queued(h));
    }

    #[test]
    fn test_timeout_forever_never_expires() {
        let mut w = World::new();
        let rule = pseudo_rule(
            "a_wait",
            StartCondition::FileExists("/nonexistent/pcd/test/file".into()),
        );
        let h = w.store.insert(rule).unwrap();
        w.timers.enqueue_rule(&mut w.store, h).unwrap();
        for _ in 0..50 {
            w.tick();
        }
        assert_eq!(w.state(h), RuleState::StartCondWait);
    }

    #[test]
    fn test_exec_rule_cascade_on_timeout() {
        let mut w = World::new();
        let target = w.store.insert(pseudo_rule("grp_b", StartCondition::None)).unwrap();
        w.store.get_mut(target).state = RuleState::Idle;
        let mut failing = pseudo_rule(
            "grp_a",
            StartCondition::FileExists("/nonexistent/pcd/test/file".into()),
        );
        failing.timeout = Timeout::Millis(200);
        failing.failure_action = FailureAction::ExecRule(RuleId::parse("grp_b").unwrap());
        let a = w.store.insert(failing).unwrap();
        w.timers.enqueue_rule(&mut w.store, a).unwrap();

        w.tick(); // burns the 200ms budget
        w.tick(); // expiry: a fails, b is enqueued
        assert_eq!(w.state(a), RuleState::NotCompleted);
        assert_eq!(w.state(target), RuleState::StartCondWait);
        assert!(w.timers.is_queued(target));

        w.tick();
        assert_eq!(w.state(target), RuleState::Completed);
    }

    #[test]
    fn test_unresolvable_dependency_fails_permanently() {
        let mut w = World::new();
        let h = w.store.insert(pseudo_rule("grp_a", depends_on("grp_gone"))).unwrap();
        w.timers.enqueue_rule(&mut w.store, h).unwrap();
        w.tick();
        assert_eq!(w.state(h), RuleState::NotCompleted);
        // The stale timer entry is dropped on the following pass.
        w.tick();
        assert!(!w.timers.is_queued(h));
    }

    #[test]
    fn test_enqueue_rejects_active_rule() {
        let mut w = World::new();
        let h = w.store.insert(pseudo_rule("grp_a", depends_on("grp_x"))).unwrap();
        w.timers.enqueue_rule(&mut w.store, h).unwrap();
        let err = w.timers.enqueue_rule(&mut w.store, h).unwrap_err();
        assert!(err.to_string().contains("already active"));
    }

    #[test]
    fn test_exactly_one_timer_entry_per_active_rule() {
        let mut w = World::new();
        let a = w.store.insert(pseudo_rule("grp_a", depends_on("grp_b"))).unwrap();
        let b = w.store.insert(pseudo_rule("grp_b", StartCondition::None)).unwrap();
        w.timers.enqueue_rule(&mut w.store, a).unwrap();
        w.timers.enqueue_rule(&mut w.store, b).unwrap();
        for _ in 0..3 {
            w.tick();
            for h in [a, b] {
                let queued = w.timers.entries.iter().filter(|e| e.rule == h).count();
                let active = w.store.get(h).active();
                assert_eq!(active, queued == 1, "rule {h} state/timer mismatch");
                assert!(queued <= 1);
            }
        }
    }

    #[test]
    fn test_dequeue_rule_idempotence() {
        let mut w = World::new();
        let h = w.store.insert(pseudo_rule("grp_a", depends_on("grp_x"))).unwrap();
        w.timers.enqueue_rule(&mut w.store, h).unwrap();
        w.timers
            .dequeue_rule(&mut w.store, &mut w.procs, h, false)
            .unwrap();
        assert_eq!(w.state(h), RuleState::NotCompleted);
        let err = w
            .timers
            .dequeue_rule(&mut w.store, &mut w.procs, h, false)
            .unwrap_err();
        assert!(err.to_string().contains("not queued"));
    }
}
