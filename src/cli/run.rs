use crate::scheduler::{TIMER_TICK_DEFAULT_MS, TIMER_TICK_MAX_MS, TIMER_TICK_MIN_MS};
use crate::supervisor::{Config, Supervisor};
use crate::{Result, errlog, logger};
use miette::bail;
use std::path::PathBuf;

/// Run the supervisor
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Run the supervisor

Reads a rules file, sequences rule start-up according to their conditions,
monitors the spawned processes, and serves the control plane.

Examples:
  pcd run -f /etc/rules.pcd           Supervise the system rules
  pcd run -f rules.pcd -t 100 -v      Faster tick, verbose diagnostics
  pcd run -c                          Crash-daemon only mode"
)]
pub struct Run {
    /// Rules file describing what to supervise
    #[clap(short = 'f', long = "file", env = "PCD_RULES_FILE")]
    file: Option<PathBuf>,
    /// Scheduler tick in milliseconds (10-500)
    #[clap(short = 't', long = "timer-tick", default_value_t = TIMER_TICK_DEFAULT_MS)]
    timer_tick: u64,
    /// Verbose diagnostics
    #[clap(short, long)]
    verbose: bool,
    /// Debug mode: exit instead of rebooting the system
    #[clap(short, long)]
    debug: bool,
    /// Error log file (in nvram)
    #[clap(short = 'e', long)]
    errlog: Option<PathBuf>,
    /// Print the parsed rules
    #[clap(short, long)]
    print: bool,
    /// Crash-daemon only mode (no rules file)
    #[clap(short, long)]
    crashd: bool,
}

impl Run {
    pub async fn run(self) -> Result<()> {
        if self.verbose {
            logger::set_verbose();
        }
        if let Some(path) = &self.errlog {
            errlog::init(path);
        }
        if self.crashd && self.file.is_some() {
            bail!("rules are disabled in crash daemon mode (either specify a rules file or enable crash daemon mode)");
        }
        if !self.crashd && self.file.is_none() {
            bail!("please specify a rules filename");
        }
        let tick_ms = if (TIMER_TICK_MIN_MS..=TIMER_TICK_MAX_MS).contains(&self.timer_tick) {
            self.timer_tick
        } else {
            warn!("invalid tick requested, using default of {TIMER_TICK_DEFAULT_MS}ms");
            TIMER_TICK_DEFAULT_MS
        };
        info!("starting process control daemon v{}", env!("CARGO_PKG_VERSION"));
        let supervisor = Supervisor::init(Config {
            rules_file: self.file,
            tick_ms,
            debug: self.debug,
            print_rules: self.print,
            crash_daemon_only: self.crashd,
        })?;
        supervisor.run().await
    }
}
