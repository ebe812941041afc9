use crate::Result;
use clap::Parser;

mod ready;
mod run;
mod signal;
mod start;
mod state;
mod stop;

#[derive(Debug, clap::Parser)]
#[clap(name = "pcd", version, about = "Process control daemon")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    Run(run::Run),
    Start(start::Start),
    Stop(stop::Stop),
    Signal(signal::Signal),
    State(state::State),
    Ready(ready::Ready),
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::Run(cmd) => cmd.run().await,
        Command::Start(cmd) => cmd.run().await,
        Command::Stop(cmd) => cmd.run().await,
        Command::Signal(cmd) => cmd.run().await,
        Command::State(cmd) => cmd.run().await,
        Command::Ready(cmd) => cmd.run().await,
    }
}
