//! System-wide tweak of the kernel's net-rx softirq task priority.
//!
//! During heavy bring-up the real-time net-rx thread can starve the boot
//! sequence; clients may ask the supervisor to demote it and restore it once
//! start-up settles.

use sysinfo::ProcessesToUpdate;

const NETRX_TASK_NAME: &str = "softirq-net-rx";
const DEFAULT_NETRX_PRIORITY: i32 = 50;

#[derive(Debug, Default)]
pub struct NetRxControl {
    saved: Option<(u32, i32)>,
}

impl NetRxControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Demote the net-rx task to a nice-scheduled priority. Remembers the
    /// original real-time priority for a later restore.
    pub fn reduce(&mut self, nice: i32) -> bool {
        let Some(pid) = find_netrx_pid() else {
            warn!("{NETRX_TASK_NAME} task not found");
            return false;
        };
        let mut param = libc::sched_param { sched_priority: 0 };
        let prio = if unsafe { libc::sched_getparam(pid as libc::pid_t, &mut param) } == 0 {
            param.sched_priority
        } else {
            DEFAULT_NETRX_PRIORITY
        };
        info!("setting low priority for {NETRX_TASK_NAME} task");
        let demoted = libc::sched_param { sched_priority: 0 };
        unsafe {
            libc::sched_setscheduler(pid as libc::pid_t, libc::SCHED_OTHER, &demoted);
            libc::setpriority(libc::PRIO_PROCESS as _, pid, nice);
        }
        self.saved = Some((pid, prio));
        true
    }

    /// Undo a previous [`reduce`](Self::reduce).
    pub fn restore(&mut self) -> bool {
        if let Some((pid, prio)) = self.saved.take() {
            info!("restoring priority for {NETRX_TASK_NAME} task");
            let param = libc::sched_param {
                sched_priority: prio,
            };
            unsafe {
                libc::sched_setscheduler(pid as libc::pid_t, libc::SCHED_FIFO, &param);
            }
        }
        true
    }
}

fn find_netrx_pid() -> Option<u32> {
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .iter()
        .find(|(_, p)| p.name().to_string_lossy().starts_with(NETRX_TASK_NAME))
        .map(|(pid, _)| pid.as_u32())
}
