//! Failure actions: the policy invoked when a rule times out, exits
//! unexpectedly, or dies from a signal.

use crate::crashlog::CrashMonitor;
use crate::procs::ProcessTable;
use crate::rule::{FailureAction, RuleHandle};
use crate::store::RuleStore;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Run the rule's failure action. Returns the rule to re-enqueue into the
/// scheduler, if the action asks for one.
pub fn run(
    store: &mut RuleStore,
    procs: &mut ProcessTable,
    crash: &mut CrashMonitor,
    h: RuleHandle,
) -> Option<RuleHandle> {
    match store.get(h).failure_action.clone() {
        FailureAction::None => {
            error!("rule {} failed", store.get(h).id);
            None
        }
        FailureAction::Reboot => {
            // Collect any last crash reports before going down.
            crash.drain();
            error!("rule {} failed, rebooting system", store.get(h).id);
            let _ = kill(Pid::this(), Signal::SIGTERM);
            None
        }
        FailureAction::Restart => restart(store, procs, h),
        FailureAction::ExecRule(target_id) => {
            let Some(target) = store.lookup(&target_id) else {
                error!("failed to execute rule {target_id}, rule not found");
                return None;
            };
            if store.get(target).active() {
                error!("failed to execute rule {target_id}, rule already running");
                return None;
            }
            restart(store, procs, target)
        }
    }
}

fn restart(store: &mut RuleStore, procs: &mut ProcessTable, h: RuleHandle) -> Option<RuleHandle> {
    if store.get(h).proc.is_some() {
        let _ = procs.stop(store, h, true, None);
    }
    Some(h)
}
