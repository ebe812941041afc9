//! Client side of the control plane.
//!
//! Each client process creates an ephemeral `pcd-client-<pid>` endpoint,
//! resolves the supervisor by its well-known owner id, and performs blocking
//! request/reply exchanges. Replies are matched by message id; stale replies
//! left over from timed-out requests are skipped.

use crate::Result;
use crate::api::{ApiReply, ApiRequest, ApiRequestMsg, ApiStatus, PublicRuleState};
use crate::env;
use crate::error::IpcError;
use crate::ipc::{self, Endpoint, IpcTimeout, SharedRegistry};
use crate::rule::RuleId;
use exponential_backoff::Backoff;
use std::time::{Duration, Instant};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Termination may have to ride out a full kill-escalation window.
const TERMINATE_TIMEOUT_FACTOR: u32 = 4;

const RESOLVE_ATTEMPTS: u32 = 5;
const RESOLVE_MIN_DELAY: Duration = Duration::from_millis(100);
const RESOLVE_MAX_DELAY: Duration = Duration::from_secs(1);

pub struct ApiClient {
    registry: SharedRegistry,
    endpoint: Endpoint,
}

impl ApiClient {
    /// Create the per-process client endpoint.
    pub fn connect() -> Result<Self> {
        let registry = SharedRegistry::open(&env::PCD_SOCKET_DIR)?;
        let name = format!("{}{}", env::CLIENT_NAME_PREFIX, std::process::id());
        let endpoint = Endpoint::start(&registry, &name)?;
        trace!("client endpoint '{name}' ready");
        Ok(Self { registry, endpoint })
    }

    /// Enqueue a rule, optionally overriding its parameters for this run.
    pub fn start_rule(&self, rule: RuleId, params: Option<String>) -> Result<ApiStatus> {
        self.request(ApiRequest::StartProcess { rule, params }, REPLY_TIMEOUT)
            .map(|reply| reply.status)
    }

    /// Stop a rule. `sync` blocks until the process has been reaped.
    pub fn terminate_rule(&self, rule: RuleId, sync: bool) -> Result<ApiStatus> {
        let request = if sync {
            ApiRequest::TerminateProcessSync { rule }
        } else {
            ApiRequest::TerminateProcess { rule }
        };
        self.request(request, REPLY_TIMEOUT * TERMINATE_TIMEOUT_FACTOR)
            .map(|reply| reply.status)
    }

    /// Stop a rule without the termination grace period.
    pub fn kill_rule(&self, rule: RuleId) -> Result<ApiStatus> {
        self.request(
            ApiRequest::KillProcess { rule },
            REPLY_TIMEOUT * TERMINATE_TIMEOUT_FACTOR,
        )
        .map(|reply| reply.status)
    }

    /// Deliver SIGUSR1 or SIGUSR2 to a rule's process.
    pub fn signal_rule(&self, rule: RuleId, sig: i32) -> Result<ApiStatus> {
        self.request(ApiRequest::SignalProcess { rule, sig }, REPLY_TIMEOUT)
            .map(|reply| reply.status)
    }

    /// Announce that the given supervised process is ready.
    pub fn process_ready(&self, pid: u32) -> Result<ApiStatus> {
        self.request(ApiRequest::ProcessReady { pid }, REPLY_TIMEOUT)
            .map(|reply| reply.status)
    }

    pub fn get_rule_state(&self, rule: RuleId) -> Result<PublicRuleState> {
        let reply = self.request(ApiRequest::GetRuleState { rule }, REPLY_TIMEOUT)?;
        match (reply.status, reply.rule_state) {
            (ApiStatus::Ok, Some(state)) => Ok(state),
            (status, _) => Err(IpcError::RequestFailed { status }.into()),
        }
    }

    pub fn reduce_netrx_priority(&self, priority: i32) -> Result<ApiStatus> {
        self.request(ApiRequest::ReduceNetRxPriority { priority }, REPLY_TIMEOUT)
            .map(|reply| reply.status)
    }

    pub fn restore_netrx_priority(&self) -> Result<ApiStatus> {
        self.request(ApiRequest::RestoreNetRxPriority, REPLY_TIMEOUT)
            .map(|reply| reply.status)
    }

    fn request(&self, request: ApiRequest, timeout: Duration) -> Result<ApiReply> {
        let server_slot = self.resolve_server()?;
        let msg_id = self.endpoint.next_msg_id();
        let payload = ipc::serialize(&ApiRequestMsg {
            msg_id,
            request: request.clone(),
        })?;
        trace!("sending {request} (msg {msg_id})");
        self.endpoint
            .send_to_slot(&self.registry, server_slot, payload)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(IpcError::Timeout {
                    ms: timeout.as_millis() as u64,
                }
                .into());
            }
            let msg = self
                .endpoint
                .wait_msg(IpcTimeout::Millis(remaining.as_millis() as u64))?;
            let Some(msg) = msg else {
                continue;
            };
            let reply: ApiReply = ipc::deserialize(&msg.payload)?;
            if reply.msg_id != msg_id {
                debug!("ignoring stale reply (msg {} != {msg_id})", reply.msg_id);
                continue;
            }
            return Ok(reply);
        }
    }

    /// Find the supervisor's registry slot, retrying briefly in case it is
    /// still coming up.
    fn resolve_server(&self) -> Result<i32> {
        for duration in Backoff::new(RESOLVE_ATTEMPTS, RESOLVE_MIN_DELAY, RESOLVE_MAX_DELAY) {
            if let Some((slot, _)) = self.registry.lookup_owner(*env::PCD_OWNER_ID) {
                return Ok(slot);
            }
            match duration {
                Some(duration) => {
                    debug!("supervisor endpoint not found, retrying in {duration:?}");
                    std::thread::sleep(duration);
                }
                None => break,
            }
        }
        Err(IpcError::OwnerNotFound {
            owner: *env::PCD_OWNER_ID,
        }
        .into())
    }

    /// Tear down the ephemeral endpoint. Also runs on drop.
    pub fn close(&self) {
        let _ = self.endpoint.stop(&self.registry);
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.close();
    }
}
