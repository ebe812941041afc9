use crate::Result;
use crate::api::ApiClient;
use crate::error::IpcError;
use crate::rule::RuleId;

/// Start a rule
#[derive(Debug, clap::Args)]
pub struct Start {
    /// Rule id as <group>_<rule>
    rule: String,
    /// One-shot parameter override for this run
    #[clap(short, long)]
    params: Option<String>,
}

impl Start {
    pub async fn run(self) -> Result<()> {
        let id = RuleId::parse(&self.rule)?;
        let client = ApiClient::connect()?;
        let status = client.start_rule(id.clone(), self.params)?;
        if !status.is_ok() {
            return Err(IpcError::RequestFailed { status }.into());
        }
        info!("rule {id} enqueued");
        Ok(())
    }
}
