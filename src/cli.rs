//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "lxc-autoscaler", about = "Autoscaling control loop for LXC containers")]
pub struct Cli {
    /// Path to the configuration file. Falls back to the default search
    /// path list when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Parse and validate the configuration file, then exit.
    #[arg(long)]
    pub validate_config: bool,

    /// Force dry-run mode regardless of what the config file says: every
    /// decision is logged and recorded but no resize is ever sent.
    #[arg(long)]
    pub dry_run: bool,

    /// Run a single evaluate-and-scale cycle and exit, instead of running
    /// the daemon loop. Useful for scripting and smoke tests.
    #[arg(long)]
    pub once: bool,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
