//! Control-plane request dispatch inside the supervisor.

use crate::Result;
use crate::api::{ApiReply, ApiRequest, ApiStatus, PublicRuleState, ReplyCookie};
use crate::ipc::{self, Endpoint, SharedRegistry};
use crate::netrx::NetRxControl;
use crate::procs::ProcessTable;
use crate::rule::{EndCondition, PARAMS_MAX, RuleHandle, RuleState};
use crate::scheduler::TimerList;
use crate::store::RuleStore;

/// Outcome of dispatching one request.
#[derive(Debug)]
pub enum Handled {
    Reply(ApiReply),
    /// No reply yet: the caller stays parked until the post-mortem
    /// dispatcher answers through [`reply_deferred`].
    Deferred,
}

pub fn handle_request(
    store: &mut RuleStore,
    procs: &mut ProcessTable,
    timers: &mut TimerList,
    netrx: &mut NetRxControl,
    request: &ApiRequest,
    cookie: ReplyCookie,
) -> Handled {
    let mut rule_state = None;
    let status = match request {
        ApiRequest::ProcessReady { pid } => match procs.rule_by_pid(*pid) {
            None => {
                warn!("got READY event, but no rule is associated with pid {pid}");
                ApiStatus::InvalidRule
            }
            Some(h) => {
                if store.get(h).end_cond.is_process_ready() {
                    if let EndCondition::ProcessReady { ready } = &mut store.get_mut(h).end_cond {
                        *ready = true;
                    }
                    ApiStatus::Ok
                } else {
                    warn!("got READY event, but rule end condition is different");
                    ApiStatus::BadParams
                }
            }
        },
        ApiRequest::ReduceNetRxPriority { priority } => {
            if netrx.reduce(*priority) {
                ApiStatus::Ok
            } else {
                ApiStatus::Error
            }
        }
        ApiRequest::RestoreNetRxPriority => {
            netrx.restore();
            ApiStatus::Ok
        }
        ApiRequest::StartProcess { rule, params } => match store.lookup(rule) {
            None => rule_not_found(request, rule),
            Some(h) => {
                if let Some(params) = params {
                    if params.len() > PARAMS_MAX {
                        return reply(cookie, None, ApiStatus::BadParams);
                    }
                    store.set_optional_params(h, params);
                }
                match timers.enqueue_rule(store, h) {
                    Ok(()) => ApiStatus::Ok,
                    Err(e) => {
                        warn!("cannot start rule {rule}: {e}");
                        ApiStatus::InvalidRule
                    }
                }
            }
        },
        ApiRequest::TerminateProcess { rule } => match store.lookup(rule) {
            None => rule_not_found(request, rule),
            Some(h) => api_stop(store, procs, timers, h, false, None),
        },
        ApiRequest::TerminateProcessSync { rule } => match store.lookup(rule) {
            None => rule_not_found(request, rule),
            Some(h) => match api_stop(store, procs, timers, h, false, Some(cookie)) {
                ApiStatus::Wait => return Handled::Deferred,
                status => status,
            },
        },
        ApiRequest::KillProcess { rule } => match store.lookup(rule) {
            None => rule_not_found(request, rule),
            Some(h) => api_stop(store, procs, timers, h, true, None),
        },
        ApiRequest::SignalProcess { rule, sig } => match store.lookup(rule) {
            None => rule_not_found(request, rule),
            Some(h) => signal_rule(store, procs, h, *sig),
        },
        ApiRequest::GetRuleState { rule } => match store.lookup(rule) {
            None => rule_not_found(request, rule),
            Some(h) => {
                rule_state = Some(public_state(store, h));
                ApiStatus::Ok
            }
        },
    };
    reply(cookie, rule_state, status)
}

fn reply(cookie: ReplyCookie, rule_state: Option<PublicRuleState>, status: ApiStatus) -> Handled {
    Handled::Reply(ApiReply {
        msg_id: cookie.msg_id,
        rule_state,
        status,
    })
}

fn rule_not_found(request: &ApiRequest, rule: &crate::rule::RuleId) -> ApiStatus {
    warn!("rule {rule} not found, aborting request {request}");
    ApiStatus::InvalidRule
}

/// Stop a rule on behalf of a client: drop any per-request parameter
/// override, dequeue it from the scheduler, and stop its process. A rule
/// that already completed but still runs a daemon is stopped through the
/// process table and parked when the caller wants a synchronous reply.
pub(crate) fn api_stop(
    store: &mut RuleStore,
    procs: &mut ProcessTable,
    timers: &mut TimerList,
    h: RuleHandle,
    brutal: bool,
    cookie: Option<ReplyCookie>,
) -> ApiStatus {
    store.clear_optional_params(h);
    match timers.dequeue_rule(store, procs, h, false) {
        Ok(()) => ApiStatus::Ok,
        Err(_) => {
            let deferred = cookie.is_some();
            match procs.stop(store, h, brutal, cookie) {
                Ok(()) => {
                    store.get_mut(h).state = RuleState::Idle;
                    if deferred {
                        ApiStatus::Wait
                    } else {
                        ApiStatus::Ok
                    }
                }
                Err(_) => ApiStatus::InvalidRule,
            }
        }
    }
}

fn signal_rule(store: &RuleStore, procs: &ProcessTable, h: RuleHandle, sig: i32) -> ApiStatus {
    let signal = match sig {
        libc::SIGUSR1 => nix::sys::signal::Signal::SIGUSR1,
        libc::SIGUSR2 => nix::sys::signal::Signal::SIGUSR2,
        _ => return ApiStatus::BadParams,
    };
    match procs.signal_by_rule(store, h, signal) {
        Ok(()) => ApiStatus::Ok,
        Err(_) => ApiStatus::InvalidRule,
    }
}

fn public_state(store: &RuleStore, h: RuleHandle) -> PublicRuleState {
    let rule = store.get(h);
    match rule.state {
        RuleState::Idle => PublicRuleState::Idle,
        RuleState::Active | RuleState::StartCondWait | RuleState::EndCondWait => {
            PublicRuleState::Running
        }
        RuleState::Completed => {
            if rule.proc.is_some() {
                PublicRuleState::CompletedProcessRunning
            } else {
                PublicRuleState::CompletedProcessExited
            }
        }
        RuleState::NotCompleted => PublicRuleState::NotCompleted,
        RuleState::Failed => PublicRuleState::Failed,
    }
}

pub fn send_reply(
    endpoint: &Endpoint,
    registry: &SharedRegistry,
    dest_slot: i32,
    reply: &ApiReply,
) -> Result<()> {
    let payload = ipc::serialize(reply)?;
    endpoint.reply(registry, dest_slot, payload)
}

/// Complete a parked sync-termination request from the post-mortem path.
pub fn reply_deferred(
    endpoint: &Endpoint,
    registry: &SharedRegistry,
    cookie: ReplyCookie,
    status: ApiStatus,
) {
    let reply = ApiReply {
        msg_id: cookie.msg_id,
        rule_state: None,
        status,
    };
    if let Err(e) = send_reply(endpoint, registry, cookie.src_slot, &reply) {
        warn!("failed to send deferred reply: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{
        FailureAction, PSEUDO_COMMAND, Rule, RuleId, SchedPolicy, StartCondition, Timeout,
    };

    struct World {
        store: RuleStore,
        procs: ProcessTable,
        timers: TimerList,
        netrx: NetRxControl,
    }

    impl World {
        fn new() -> Self {
            let mut timers = TimerList::new();
            timers.start();
            Self {
                store: RuleStore::new(),
                procs: ProcessTable::new(),
                timers,
                netrx: NetRxControl::new(),
            }
        }

        fn dispatch(&mut self, request: ApiRequest) -> Handled {
            let cookie = ReplyCookie {
                src_slot: 5,
                msg_id: 1234,
            };
            handle_request(
                &mut self.store,
                &mut self.procs,
                &mut self.timers,
                &mut self.netrx,
                &request,
                cookie,
            )
        }

        fn dispatch_status(&mut self, request: ApiRequest) -> (ApiStatus, Option<PublicRuleState>) {
            match self.dispatch(request) {
                Handled::Reply(reply) => {
                    assert_eq!(reply.msg_id, 1234);
                    (reply.status, reply.rule_state)
                }
                Handled::Deferred => panic!("unexpected deferred reply"),
            }
        }
    }

    fn make_rule(id: &str) -> Rule {
        Rule {
            id: RuleId::parse(id).unwrap(),
            indexed: false,
            start_cond: StartCondition::None,
            end_cond: EndCondition::None,
            timeout: Timeout::Forever,
            command: PSEUDO_COMMAND.to_string(),
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

    fn rule_id(s: &str) -> RuleId {
        RuleId::parse(s).unwrap()
    }

    #[test]
    fn test_start_process_enqueues_and_sets_override() {
        let mut w = World::new();
        let h = w.store.insert(make_rule("net_dhcp")).unwrap();
        let (status, _) = w.dispatch_status(ApiRequest::StartProcess {
            rule: rule_id("net_dhcp"),
            params: Some("eth1".to_string()),
        });
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(w.store.get(h).state, RuleState::StartCondWait);
        assert_eq!(w.store.get(h).optional_params.as_deref(), Some("eth1"));

        // A second start while the first instance is active is invalid.
        let (status, _) = w.dispatch_status(ApiRequest::StartProcess {
            rule: rule_id("net_dhcp"),
            params: None,
        });
        assert_eq!(status, ApiStatus::InvalidRule);
    }

    #[test]
    fn test_start_process_expands_template() {
        let mut w = World::new();
        let mut template = make_rule("worker_");
        template.indexed = true;
        w.store.insert(template).unwrap();

        let (status, _) = w.dispatch_status(ApiRequest::StartProcess {
            rule: rule_id("worker_3"),
            params: None,
        });
        assert_eq!(status, ApiStatus::Ok);
        let h = w.store.find(&rule_id("worker_3")).unwrap();
        assert_eq!(w.store.get(h).state, RuleState::StartCondWait);

        // The instance is busy now; a repeat start is rejected.
        let (status, _) = w.dispatch_status(ApiRequest::StartProcess {
            rule: rule_id("worker_3"),
            params: None,
        });
        assert_eq!(status, ApiStatus::InvalidRule);
    }

    #[test]
    fn test_unknown_rule_is_invalid() {
        let mut w = World::new();
        let (status, _) = w.dispatch_status(ApiRequest::TerminateProcess {
            rule: rule_id("no_such"),
        });
        assert_eq!(status, ApiStatus::InvalidRule);
    }

    #[test]
    fn test_terminate_is_idempotent_with_invalid_second() {
        let mut w = World::new();
        let h = w.store.insert(make_rule("net_dhcp")).unwrap();
        w.timers.enqueue_rule(&mut w.store, h).unwrap();

        let (status, _) = w.dispatch_status(ApiRequest::TerminateProcess {
            rule: rule_id("net_dhcp"),
        });
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(w.store.get(h).state, RuleState::NotCompleted);

        let (status, _) = w.dispatch_status(ApiRequest::TerminateProcess {
            rule: rule_id("net_dhcp"),
        });
        assert_eq!(status, ApiStatus::InvalidRule);
    }

    #[test]
    fn test_terminate_sync_defers_reply_for_running_daemon() {
        let mut w = World::new();
        let mut rule = make_rule("svc_api");
        rule.daemon = true;
        rule.state = RuleState::Completed;
        let h = w.store.insert(rule).unwrap();
        let key = w.procs.enqueue(&mut w.store, h).unwrap();
        {
            let entry = w.procs.get_mut(key).unwrap();
            entry.pid = Some(999_999_999);
            entry.state = crate::procs::ProcState::Running;
        }
        w.store.get_mut(h).state = RuleState::Completed;

        let handled = w.dispatch(ApiRequest::TerminateProcessSync {
            rule: rule_id("svc_api"),
        });
        assert!(matches!(handled, Handled::Deferred));
        // The rule is idle; the cookie is parked on the process record.
        assert_eq!(w.store.get(h).state, RuleState::Idle);
        let entry = w.procs.get(key).unwrap();
        assert_eq!(entry.cookie.map(|c| c.msg_id), Some(1234));
    }

    #[test]
    fn test_process_ready_latches_only_matching_rules() {
        let mut w = World::new();
        let mut rule = make_rule("svc_api");
        rule.end_cond = EndCondition::ProcessReady { ready: false };
        let h = w.store.insert(rule).unwrap();
        let key = w.procs.enqueue(&mut w.store, h).unwrap();
        w.procs.get_mut(key).unwrap().pid = Some(777);

        let (status, _) = w.dispatch_status(ApiRequest::ProcessReady { pid: 777 });
        assert_eq!(status, ApiStatus::Ok);
        assert!(matches!(
            w.store.get(h).end_cond,
            EndCondition::ProcessReady { ready: true }
        ));

        // Unknown pid.
        let (status, _) = w.dispatch_status(ApiRequest::ProcessReady { pid: 778 });
        assert_eq!(status, ApiStatus::InvalidRule);

        // Wrong end condition.
        let other = {
            let mut r = make_rule("svc_other");
            r.end_cond = EndCondition::None;
            w.store.insert(r).unwrap()
        };
        let key = w.procs.enqueue(&mut w.store, other).unwrap();
        w.procs.get_mut(key).unwrap().pid = Some(888);
        let (status, _) = w.dispatch_status(ApiRequest::ProcessReady { pid: 888 });
        assert_eq!(status, ApiStatus::BadParams);
    }

    #[test]
    fn test_signal_restricted_to_user_signals() {
        let mut w = World::new();
        let h = w.store.insert(make_rule("svc_api")).unwrap();
        let key = w.procs.enqueue(&mut w.store, h).unwrap();
        {
            let entry = w.procs.get_mut(key).unwrap();
            entry.pid = Some(999_999_999);
            entry.state = crate::procs::ProcState::Running;
        }

        let (status, _) = w.dispatch_status(ApiRequest::SignalProcess {
            rule: rule_id("svc_api"),
            sig: libc::SIGUSR1,
        });
        assert_eq!(status, ApiStatus::Ok);

        let (status, _) = w.dispatch_status(ApiRequest::SignalProcess {
            rule: rule_id("svc_api"),
            sig: libc::SIGKILL,
        });
        assert_eq!(status, ApiStatus::BadParams);
    }

    #[test]
    fn test_get_rule_state_mapping() {
        let mut w = World::new();
        let h = w.store.insert(make_rule("svc_api")).unwrap();

        let expect = |w: &mut World, state: PublicRuleState| {
            let (status, reported) = w.dispatch_status(ApiRequest::GetRuleState {
                rule: rule_id("svc_api"),
            });
            assert_eq!(status, ApiStatus::Ok);
            assert_eq!(reported, Some(state));
        };

        expect(&mut w, PublicRuleState::Idle);

        w.store.get_mut(h).state = RuleState::StartCondWait;
        expect(&mut w, PublicRuleState::Running);

        w.store.get_mut(h).state = RuleState::Completed;
        expect(&mut w, PublicRuleState::CompletedProcessExited);

        w.store.get_mut(h).state = RuleState::Idle;
        let key = w.procs.enqueue(&mut w.store, h).unwrap();
        w.procs.get_mut(key).unwrap().state = crate::procs::ProcState::Running;
        w.store.get_mut(h).state = RuleState::Completed;
        expect(&mut w, PublicRuleState::CompletedProcessRunning);

        w.store.get_mut(h).proc = None;
        w.store.get_mut(h).state = RuleState::Failed;
        expect(&mut w, PublicRuleState::Failed);
    }

    #[test]
    fn test_oversized_params_rejected() {
        let mut w = World::new();
        w.store.insert(make_rule("net_dhcp")).unwrap();
        let (status, _) = w.dispatch_status(ApiRequest::StartProcess {
            rule: rule_id("net_dhcp"),
            params: Some("x".repeat(PARAMS_MAX + 1)),
        });
        assert_eq!(status, ApiStatus::BadParams);
    }
}
