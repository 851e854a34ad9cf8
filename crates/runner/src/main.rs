//! VmHarness - Main Entry Point
//!
//! Runs installer test scripts against Vagrant boxes and exits non-zero if
//! any scheduled case failed.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vmharness_runner::runner::{self, Runner, RunnerConfig};
use vmharness_runner::vagrant::VagrantProvider;

#[derive(Parser)]
#[command(name = "vmharness")]
#[command(about = "Run installer test scripts against Vagrant boxes")]
#[command(version)]
struct Cli {
    /// Test files to run; empty means every *.t file in the work directory
    testfiles: Vec<PathBuf>,

    /// Sync the latest installer bits to each box before its first test
    #[arg(long)]
    rsync: bool,

    /// Uninstall previous installer state from each box before its first test
    #[arg(long)]
    uninstall_first: bool,

    /// Halt boxes when done instead of suspending them
    #[arg(long)]
    halt_afterward: bool,

    /// Directory containing the Vagrantfile and test files
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Write the run summary as JSON to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let testfiles = if cli.testfiles.is_empty() {
        runner::discover_test_files(&cli.work_dir)?
    } else {
        cli.testfiles.clone()
    };

    let provider = Arc::new(VagrantProvider::new(cli.work_dir.clone()));
    let mut runner = Runner::new(
        provider,
        RunnerConfig {
            uninstall_first: cli.uninstall_first,
            rsync: cli.rsync,
            halt_afterward: cli.halt_afterward,
        },
    );
    let summary = runner.run(&testfiles).await;

    if let Some(path) = &cli.output {
        runner::write_results(&summary, path)?;
    }

    std::process::exit(if summary.success() { 0 } else { 1 });
}
