use crate::Result;
use crate::api::ApiClient;
use crate::error::IpcError;

/// Announce that a supervised process is ready
///
/// Intended for use from service scripts: without an explicit pid the
/// calling shell (the supervised process) is reported.
#[derive(Debug, clap::Args)]
pub struct Ready {
    /// Pid of the supervised process (defaults to the parent process)
    #[clap(short, long)]
    pid: Option<u32>,
}

impl Ready {
    pub async fn run(self) -> Result<()> {
        let pid = self
            .pid
            .unwrap_or_else(|| nix::unistd::getppid().as_raw() as u32);
        let client = ApiClient::connect()?;
        let status = client.process_ready(pid)?;
        if !status.is_ok() {
            return Err(IpcError::RequestFailed { status }.into());
        }
        debug!("announced readiness of pid {pid}");
        Ok(())
    }
}
