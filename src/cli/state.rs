use crate::Result;
use crate::api::ApiClient;
use crate::rule::RuleId;

/// Query a rule's state
#[derive(Debug, clap::Args)]
pub struct State {
    /// Rule id as <group>_<rule>
    rule: String,
}

impl State {
    pub async fn run(self) -> Result<()> {
        let id = RuleId::parse(&self.rule)?;
        let client = ApiClient::connect()?;
        let state = client.get_rule_state(id)?;
        println!("{state}");
        Ok(())
    }
}
