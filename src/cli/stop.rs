use crate::Result;
use crate::api::ApiClient;
use crate::error::IpcError;
use crate::rule::RuleId;

/// Stop a rule and its process
#[derive(Debug, clap::Args)]
pub struct Stop {
    /// Rule id as <group>_<rule>
    rule: String,
    /// Wait until the process has actually been reaped
    #[clap(short, long)]
    sync: bool,
    /// Skip the termination grace period
    #[clap(short, long, conflicts_with = "sync")]
    kill: bool,
}

impl Stop {
    pub async fn run(self) -> Result<()> {
        let id = RuleId::parse(&self.rule)?;
        let client = ApiClient::connect()?;
        let status = if self.kill {
            client.kill_rule(id.clone())?
        } else {
            client.terminate_rule(id.clone(), self.sync)?
        };
        if !status.is_ok() {
            return Err(IpcError::RequestFailed { status }.into());
        }
        info!("rule {id} stopped");
        Ok(())
    }
}
