//! The supervisor: owns the rule store, process table, scheduler, IPC
//! endpoint, and crash monitor, and drives them from a single tick loop.
//!
//! Control flow per tick: drain incoming control messages, sleep one tick,
//! advance the scheduler, and every process-tick (or immediately after a
//! scheduler transition) run the process-table passes and drain the crash
//! FIFO. Child exits are staged by waiter tasks and published at tick
//! boundaries; rule state only ever changes on this loop.

use crate::api::{ApiRequestMsg, ApiStatus, MSG_BUDGET_PER_TICK, ReplyCookie};
use crate::api::server::{self, Handled};
use crate::crashlog::CrashMonitor;
use crate::env;
use crate::failure;
use crate::ipc::{self, Endpoint, IpcTimeout, SharedRegistry};
use crate::netrx::NetRxControl;
use crate::procs::{ExitDisposition, ProcessTable};
use crate::rule::{EndCondition, RuleHandle, RuleState};
use crate::scheduler::{PROCESS_TICK_MS, TimerList};
use crate::store::RuleStore;
use crate::{Result, parser};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sysinfo::ProcessesToUpdate;
use tokio::signal;
use tokio::signal::unix::SignalKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub rules_file: Option<PathBuf>,
    pub tick_ms: u64,
    /// Debug mode: the reboot path exits instead of signalling init.
    pub debug: bool,
    pub print_rules: bool,
    /// Crash-daemon-only mode: no rules, just the crash FIFO.
    pub crash_daemon_only: bool,
}

pub struct Supervisor {
    cfg: Config,
    store: RuleStore,
    procs: ProcessTable,
    timers: TimerList,
    registry: SharedRegistry,
    endpoint: Endpoint,
    crash: CrashMonitor,
    netrx: NetRxControl,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    /// Bring up every subsystem. Any failure here is fatal; the caller
    /// exits nonzero.
    pub fn init(cfg: Config) -> Result<Self> {
        if another_instance_running() {
            return Err(miette::miette!(
                "another instance of pcd is already running, aborting"
            ));
        }
        boost_own_priority();

        let registry = SharedRegistry::open(&env::PCD_SOCKET_DIR)?;
        let mut store = RuleStore::new();
        if !cfg.crash_daemon_only {
            let rules_file = cfg
                .rules_file
                .clone()
                .ok_or_else(|| miette::miette!("no rules file specified"))?;
            for rule in parser::parse_file(&rules_file)? {
                if cfg.print_rules {
                    print_rule(&rule);
                }
                if let Err(e) = store.insert(rule) {
                    warn!("{e}, ignoring");
                }
            }
            info!("loaded {} rules from {}", store.len(), rules_file.display());
        }

        let endpoint = Endpoint::start(&registry, &env::PCD_SERVER_NAME)?;
        registry.set_owner(endpoint.slot(), *env::PCD_OWNER_ID)?;
        let crash = CrashMonitor::open(&env::PCD_EXCEPTION_FIFO)?;

        let mut timers = TimerList::new();
        for h in store.active_handles() {
            timers.enqueue_rule(&mut store, h)?;
        }
        timers.start();

        info!("initialization complete");
        Ok(Self {
            cfg,
            store,
            procs: ProcessTable::new(),
            timers,
            registry,
            endpoint,
            crash,
            netrx: NetRxControl::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The supervisor main loop. Runs until signalled.
    pub async fn run(mut self) -> Result<()> {
        self.install_signal_handlers();
        let tick = Duration::from_millis(self.cfg.tick_ms);
        // Start with an immediate process pass.
        let mut tick_counter = PROCESS_TICK_MS;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.terminate().await;
            }
            self.check_messages();
            tokio::time::sleep(tick).await;
            // Publish reaped child exits before the scheduler looks at any
            // process state, so an EXIT end condition can observe the
            // disposition the moment the child is gone.
            self.procs.drain_exits();
            let transitions = self.timers.iterate(
                &mut self.store,
                &mut self.procs,
                &self.registry,
                &mut self.crash,
                self.cfg.tick_ms,
            );
            if transitions || tick_counter >= PROCESS_TICK_MS {
                self.process_pass();
                self.crash.drain();
                tick_counter = 0;
            }
            tick_counter += self.cfg.tick_ms;
        }
    }

    fn process_pass(&mut self) {
        self.procs.drain_exits();
        self.procs.iterate_start(&self.store);
        self.procs.iterate_stop(&self.store);
        self.dispatch_stopped();
    }

    /// Drain up to the per-tick budget of control messages.
    fn check_messages(&mut self) {
        for _ in 0..MSG_BUDGET_PER_TICK {
            let msg = match self.endpoint.wait_msg(IpcTimeout::Immediate) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    error!("control endpoint receive failed: {e}");
                    break;
                }
            };
            let req: ApiRequestMsg = match ipc::deserialize(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    warn!("dropping malformed control message: {e}");
                    continue;
                }
            };
            debug!("control request {} (msg {})", req.request, req.msg_id);
            let cookie = ReplyCookie {
                src_slot: msg.src_slot,
                msg_id: req.msg_id,
            };
            match server::handle_request(
                &mut self.store,
                &mut self.procs,
                &mut self.timers,
                &mut self.netrx,
                &req.request,
                cookie,
            ) {
                Handled::Reply(reply) => {
                    if let Err(e) =
                        server::send_reply(&self.endpoint, &self.registry, cookie.src_slot, &reply)
                    {
                        warn!("failed to reply to slot {}: {e}", cookie.src_slot);
                    }
                }
                Handled::Deferred => {}
            }
        }
    }

    /// Post-mortem dispatch: decide the fate of every reaped process and of
    /// the rule that owned it.
    fn dispatch_stopped(&mut self) {
        for key in self.procs.stopped_keys() {
            let Some(entry) = self.procs.get(key) else {
                continue;
            };
            let Some(h) = entry.rule else {
                self.procs.remove(key);
                continue;
            };
            let pid = entry.pid;
            let disposition = entry.disposition;
            let signalled = entry.signalled_by_us;
            let cookie = entry.cookie;

            // Clear the rule's forward link before anything else so nothing
            // below observes a dangling process reference.
            if self.store.get(h).proc == Some(key) {
                self.store.get_mut(h).proc = None;
            }
            if let Some(pid) = pid {
                let _ = self.registry.cleanup_proc(pid);
            }

            let rule = self.store.get(h);
            let id = rule.id.clone();
            let command = rule.command.clone();
            let daemon = rule.daemon;
            let pid0 = pid.unwrap_or(0);
            let trigger = match disposition {
                ExitDisposition::Exited(code) => {
                    if signalled {
                        if let Some(cookie) = cookie {
                            server::reply_deferred(
                                &self.endpoint,
                                &self.registry,
                                cookie,
                                ApiStatus::Ok,
                            );
                        }
                        false
                    } else if daemon {
                        error!("process {command} ({pid0}) exited unexpectedly (rule {id})");
                        true
                    } else {
                        let failed = match rule.end_cond {
                            EndCondition::ExitStatus(expected) => code != expected,
                            _ => code != 0,
                        };
                        if failed {
                            error!(
                                "process {command} ({pid0}) exited with result code {code} (rule {id})"
                            );
                        }
                        failed
                    }
                }
                ExitDisposition::Signalled(sig) => {
                    if signalled {
                        if let Some(cookie) = cookie {
                            server::reply_deferred(
                                &self.endpoint,
                                &self.registry,
                                cookie,
                                ApiStatus::Ok,
                            );
                        }
                        false
                    } else if daemon {
                        error!(
                            "unhandled exception {sig} ({}) in process {command} ({pid0}) (rule {id})",
                            signal_name(sig)
                        );
                        true
                    } else {
                        false
                    }
                }
                ExitDisposition::Stopped(sig) => {
                    error!(
                        "exception {sig} ({}) caused process {command} ({pid0}) to stop (rule {id})",
                        signal_name(sig)
                    );
                    true
                }
                ExitDisposition::None => false,
            };

            if trigger && self.trigger_failure(h).is_err() {
                // Try again next pass; the record stays until the failure
                // action can run.
                continue;
            }
            debug!("deleting process {command} ({pid0}) (rule {id})");
            self.procs.remove(key);
        }
    }

    /// Fail the rule and run its failure action, re-enqueueing whatever the
    /// action returns.
    fn trigger_failure(&mut self, h: RuleHandle) -> Result<()> {
        let _ = self
            .timers
            .dequeue_rule(&mut self.store, &mut self.procs, h, true);
        // A completed daemon whose process died was not in the scheduler;
        // it still lands in Failed before the action runs.
        if self.store.get(h).state != RuleState::Failed {
            self.store.get_mut(h).state = RuleState::Failed;
        }
        if let Some(next) = failure::run(&mut self.store, &mut self.procs, &mut self.crash, h) {
            if let Err(e) = self.timers.enqueue_rule(&mut self.store, next) {
                error!("failed to enqueue rule {}", self.store.get(next).id);
                return Err(e);
            }
        }
        Ok(())
    }

    fn install_signal_handlers(&self) {
        static RECEIVED_SIGNAL: AtomicBool = AtomicBool::new(false);
        let kinds = [
            SignalKind::terminate(),
            SignalKind::interrupt(),
            SignalKind::quit(),
        ];
        for kind in kinds {
            let mut stream = match signal::unix::signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to register signal handler for {kind:?}: {e}");
                    continue;
                }
            };
            let flag = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    stream.recv().await;
                    if RECEIVED_SIGNAL.swap(true, Ordering::SeqCst) {
                        exit(1);
                    } else {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            });
        }
    }

    /// Orderly shutdown: stop accepting RPCs, stop the tick, close the
    /// crash FIFO, then take the system down (or just exit in debug mode).
    /// Never returns.
    async fn terminate(&mut self) {
        info!("terminating, rebooting system");
        let _ = self.endpoint.stop(&self.registry);
        self.timers.stop();
        self.crash.close();

        if self.cfg.debug {
            eprintln!("pcd: reboot disabled in debug mode, exiting");
            exit(1);
        }

        for pid in self.procs.live_pids() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        // Terminate init, reboot the system.
        let _ = kill(Pid::from_raw(1), Signal::SIGTERM);
        for _ in 0..20 {
            self.procs.drain_exits();
            self.procs.iterate_stop(&self.store);
            if self.procs.live_pids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        exit(1);
    }
}

fn signal_name(sig: i32) -> &'static str {
    Signal::try_from(sig).map(|s| s.as_str()).unwrap_or("unknown")
}

fn another_instance_running() -> bool {
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let me = std::process::id();
    sys.processes().values().any(|p| {
        p.pid().as_u32() != me && p.name().to_string_lossy() == env!("CARGO_PKG_NAME")
    })
}

/// Run at real-time priority so supervision keeps up under load. Quietly a
/// no-op without the privilege.
fn boost_own_priority() {
    let param = libc::sched_param { sched_priority: 1 };
    unsafe {
        libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
    }
}


fn print_rule(rule: &crate::rule::Rule) {
    println!("Rule ID: {}", rule.id);
    println!("  Command: {}", rule.command);
    if let Some(params) = &rule.params {
        println!("  Params: {params}");
    }
    println!("  Start condition: {:?}", rule.start_cond);
    println!("  End condition: {:?}", rule.end_cond);
    println!("  Timeout: {:?}", rule.timeout);
    println!("  Failure action: {:?}", rule.failure_action);
    println!("  Scheduling: {:?}", rule.sched);
    println!("  Daemon: {}", if rule.daemon { "YES" } else { "NO" });
    println!(
        "  Active: {}",
        if rule.state == RuleState::Active {
            "YES"
        } else {
            "NO"
        }
    );
}
