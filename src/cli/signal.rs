use crate::Result;
use crate::api::ApiClient;
use crate::error::IpcError;
use crate::rule::RuleId;
use miette::bail;

/// Send a user signal to a rule's process
#[derive(Debug, clap::Args)]
pub struct Signal {
    /// Rule id as <group>_<rule>
    rule: String,
    /// Signal to deliver: usr1 or usr2
    signal: String,
}

impl Signal {
    pub async fn run(self) -> Result<()> {
        let sig = match self.signal.to_lowercase().as_str() {
            "usr1" | "sigusr1" => libc::SIGUSR1,
            "usr2" | "sigusr2" => libc::SIGUSR2,
            other => bail!("unsupported signal '{other}' (use usr1 or usr2)"),
        };
        let id = RuleId::parse(&self.rule)?;
        let client = ApiClient::connect()?;
        let status = client.signal_rule(id.clone(), sig)?;
        if !status.is_ok() {
            return Err(IpcError::RequestFailed { status }.into());
        }
        info!("signalled rule {id}");
        Ok(())
    }
}
