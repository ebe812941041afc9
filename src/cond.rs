//! Start and end condition evaluators.
//!
//! Evaluators are predicates over (rule, world state). Failure to satisfy a
//! condition is not an error, it just means "not yet". The only permitted
//! side effects are the PROCESS_READY latch clear and the WAIT countdown
//! update, both properties of the rule itself.

use crate::ipc::registry::SharedRegistry;
use crate::procs::{ExitDisposition, ProcessTable};
use crate::rule::{EndCondition, RuleHandle, RuleId, RuleState, StartCondition};
use crate::store::RuleStore;
use std::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCheck {
    Satisfied,
    Pending,
    /// A RULE_COMPLETED reference does not resolve; the dependent rule can
    /// never complete.
    Unresolvable(RuleId),
}

/// Evaluate a rule's start condition.
///
/// `snapshot` holds every rule's state as of the beginning of the scheduler
/// pass; RULE_COMPLETED checks consult it rather than live state so that a
/// completion propagates to dependents no earlier than the next tick.
pub fn check_start(
    store: &mut RuleStore,
    registry: &SharedRegistry,
    snapshot: &[RuleState],
    h: RuleHandle,
) -> StartCheck {
    let cond = store.get(h).start_cond.clone();
    match cond {
        StartCondition::None => StartCheck::Satisfied,
        StartCondition::FileExists(path) => {
            if fs::metadata(&path).is_ok() {
                StartCheck::Satisfied
            } else {
                StartCheck::Pending
            }
        }
        StartCondition::NetDeviceExists(ifname) => {
            if net_device_exists(&ifname) {
                StartCheck::Satisfied
            } else {
                StartCheck::Pending
            }
        }
        StartCondition::IpcOwnerPresent(owner) => {
            if registry.owner_present(owner) {
                StartCheck::Satisfied
            } else {
                StartCheck::Pending
            }
        }
        StartCondition::EnvVarEquals { name, value } => {
            if crate::env::var(&name).is_ok_and(|v| v == value) {
                StartCheck::Satisfied
            } else {
                StartCheck::Pending
            }
        }
        StartCondition::RulesCompleted(deps) => {
            if deps.is_empty() {
                return StartCheck::Pending;
            }
            let mut resolved = Vec::with_capacity(deps.len());
            let mut result = StartCheck::Satisfied;
            for (i, dep) in deps.iter().enumerate() {
                let handle = match dep.cached {
                    Some(cached) => cached,
                    None => match store.lookup(&dep.id) {
                        Some(found) => {
                            resolved.push((i, found));
                            found
                        }
                        None => {
                            result = StartCheck::Unresolvable(dep.id.clone());
                            break;
                        }
                    },
                };
                // Handles minted during this pass (template expansion) are
                // past the end of the snapshot and cannot be completed yet.
                if snapshot.get(handle) != Some(&RuleState::Completed) {
                    result = StartCheck::Pending;
                    break;
                }
            }
            fill_dependency_cache(store, h, &resolved);
            result
        }
    }
}

fn fill_dependency_cache(store: &mut RuleStore, h: RuleHandle, resolved: &[(usize, RuleHandle)]) {
    if resolved.is_empty() {
        return;
    }
    if let StartCondition::RulesCompleted(deps) = &mut store.get_mut(h).start_cond {
        for &(i, handle) in resolved {
            deps[i].cached = Some(handle);
        }
    }
}

/// Evaluate a rule's end condition. Returns true when satisfied.
pub fn check_end(
    store: &mut RuleStore,
    procs: &ProcessTable,
    registry: &SharedRegistry,
    h: RuleHandle,
    tick_ms: u64,
) -> bool {
    let cond = store.get(h).end_cond.clone();
    match cond {
        EndCondition::None => true,
        EndCondition::FileExists(path) => fs::metadata(&path).is_ok(),
        EndCondition::NetDeviceExists(ifname) => net_device_exists(&ifname),
        EndCondition::IpcOwnerPresent(owner) => registry.owner_present(owner),
        EndCondition::ExitStatus(expected) => {
            let Some(key) = store.get(h).proc else {
                return false;
            };
            procs
                .get(key)
                .is_some_and(|p| p.disposition == ExitDisposition::Exited(expected))
        }
        EndCondition::ProcessReady { ready } => {
            if ready {
                // One-shot semantics: evaluation clears the latch.
                if let EndCondition::ProcessReady { ready } = &mut store.get_mut(h).end_cond {
                    *ready = false;
                }
                true
            } else {
                false
            }
        }
        EndCondition::Wait { remaining_ms, .. } => {
            if let EndCondition::Wait {
                remaining_ms: rem,
                reload_ms,
            } = &mut store.get_mut(h).end_cond
            {
                if remaining_ms < tick_ms {
                    *rem = *reload_ms;
                    return true;
                }
                *rem = remaining_ms - tick_ms;
            }
            false
        }
    }
}

#[cfg(unix)]
fn net_device_exists(ifname: &str) -> bool {
    nix::net::if_::if_nametoindex(ifname).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{
        EndCondition, FailureAction, Rule, RuleDependency, SchedPolicy, StartCondition, Timeout,
    };
    use crate::store::RuleStore;

    fn make_rule(id: &str, start: StartCondition, end: EndCondition) -> Rule {
        Rule {
            id: RuleId::parse(id).unwrap(),
            indexed: false,
            start_cond: start,
            end_cond: end,
            timeout: Timeout::Forever,
            command: "NONE".to_string(),
            params: None,
            optional_params: None,
            failure_action: FailureAction::None,
            sched: SchedPolicy::default(),
            daemon: false,
            uid: 0,
            state: RuleState::Idle,
            proc: None,
        }
    }

    fn test_world() -> (SharedRegistry, ProcessTable) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::open(dir.path()).unwrap();
        // Leak the tempdir so the registry file outlives the helper.
        std::mem::forget(dir);
        (registry, ProcessTable::new())
    }

    #[test]
    fn test_none_conditions() {
        let (registry, procs) = test_world();
        let mut store = RuleStore::new();
        let h = store
            .insert(make_rule("a_a", StartCondition::None, EndCondition::None))
            .unwrap();
        let snapshot = store.states_snapshot();
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Satisfied
        );
        assert!(check_end(&mut store, &procs, &registry, h, 200));
    }

    #[test]
    fn test_file_condition() {
        let (registry, _) = test_world();
        let mut store = RuleStore::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        let h = store
            .insert(make_rule(
                "a_a",
                StartCondition::FileExists(file.path().to_path_buf()),
                EndCondition::None,
            ))
            .unwrap();
        let snapshot = store.states_snapshot();
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Satisfied
        );
        drop(file);
        let snapshot = store.states_snapshot();
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Pending
        );
    }

    #[test]
    fn test_env_var_condition() {
        let (registry, _) = test_world();
        let mut store = RuleStore::new();
        let h = store
            .insert(make_rule(
                "a_a",
                StartCondition::EnvVarEquals {
                    name: "PCD_COND_TEST_VAR".to_string(),
                    value: "yes".to_string(),
                },
                EndCondition::None,
            ))
            .unwrap();
        let snapshot = store.states_snapshot();
        unsafe { std::env::set_var("PCD_COND_TEST_VAR", "no") };
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Pending
        );
        unsafe { std::env::set_var("PCD_COND_TEST_VAR", "yes") };
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Satisfied
        );
        unsafe { std::env::remove_var("PCD_COND_TEST_VAR") };
    }

    #[test]
    fn test_rules_completed_requires_all() {
        let (registry, _) = test_world();
        let mut store = RuleStore::new();
        let dep_a = store
            .insert(make_rule("a_a", StartCondition::None, EndCondition::None))
            .unwrap();
        let dep_b = store
            .insert(make_rule("a_b", StartCondition::None, EndCondition::None))
            .unwrap();
        let h = store
            .insert(make_rule(
                "a_c",
                StartCondition::RulesCompleted(vec![
                    RuleDependency::new(RuleId::parse("a_a").unwrap()),
                    RuleDependency::new(RuleId::parse("a_b").unwrap()),
                ]),
                EndCondition::None,
            ))
            .unwrap();

        let snapshot = store.states_snapshot();
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Pending
        );

        store.get_mut(dep_a).state = RuleState::Completed;
        let snapshot = store.states_snapshot();
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Pending
        );

        store.get_mut(dep_b).state = RuleState::Completed;
        let snapshot = store.states_snapshot();
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Satisfied
        );

        // The resolver cache was filled on first successful resolution.
        if let StartCondition::RulesCompleted(deps) = &store.get(h).start_cond {
            assert_eq!(deps[0].cached, Some(dep_a));
            assert_eq!(deps[1].cached, Some(dep_b));
        } else {
            panic!("condition changed kind");
        }
    }

    #[test]
    fn test_rules_completed_unresolvable() {
        let (registry, _) = test_world();
        let mut store = RuleStore::new();
        let h = store
            .insert(make_rule(
                "a_c",
                StartCondition::RulesCompleted(vec![RuleDependency::new(
                    RuleId::parse("a_missing").unwrap(),
                )]),
                EndCondition::None,
            ))
            .unwrap();
        let snapshot = store.states_snapshot();
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Unresolvable(RuleId::parse("a_missing").unwrap())
        );
    }

    #[test]
    fn test_rules_completed_snapshot_hides_fresh_completion() {
        let (registry, _) = test_world();
        let mut store = RuleStore::new();
        let dep = store
            .insert(make_rule("a_a", StartCondition::None, EndCondition::None))
            .unwrap();
        let h = store
            .insert(make_rule(
                "a_b",
                StartCondition::RulesCompleted(vec![RuleDependency::new(
                    RuleId::parse("a_a").unwrap(),
                )]),
                EndCondition::None,
            ))
            .unwrap();
        let snapshot = store.states_snapshot();
        // Completion after the snapshot was taken is not visible this pass.
        store.get_mut(dep).state = RuleState::Completed;
        assert_eq!(
            check_start(&mut store, &registry, &snapshot, h),
            StartCheck::Pending
        );
    }

    #[test]
    fn test_process_ready_latch_is_one_shot() {
        let (registry, procs) = test_world();
        let mut store = RuleStore::new();
        let h = store
            .insert(make_rule(
                "a_a",
                StartCondition::None,
                EndCondition::ProcessReady { ready: false },
            ))
            .unwrap();
        assert!(!check_end(&mut store, &procs, &registry, h, 200));

        if let EndCondition::ProcessReady { ready } = &mut store.get_mut(h).end_cond {
            *ready = true;
        }
        assert!(check_end(&mut store, &procs, &registry, h, 200));
        // The evaluation cleared the latch.
        assert!(!check_end(&mut store, &procs, &registry, h, 200));
    }

    #[test]
    fn test_wait_countdown_and_reload() {
        let (registry, procs) = test_world();
        let mut store = RuleStore::new();
        let h = store
            .insert(make_rule(
                "a_a",
                StartCondition::None,
                EndCondition::Wait {
                    remaining_ms: 500,
                    reload_ms: 500,
                },
            ))
            .unwrap();
        // 500ms at a 200ms tick: two unsatisfied evaluations, then expiry.
        assert!(!check_end(&mut store, &procs, &registry, h, 200));
        assert!(!check_end(&mut store, &procs, &registry, h, 200));
        assert!(check_end(&mut store, &procs, &registry, h, 200));
        // The countdown reloaded for a future re-enqueue.
        if let EndCondition::Wait { remaining_ms, .. } = store.get(h).end_cond {
            assert_eq!(remaining_ms, 500);
        } else {
            panic!("condition changed kind");
        }
    }
}
