use std::path::PathBuf;

use clap::Parser;

use attest::controller::Controller;

/// The attest email authentication gateway daemon.
#[derive(Parser, Debug)]
#[command(name = "attestd")]
#[command(about = "Email authentication gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file. Falls back to ATTEST_CONFIG,
    /// ./attest.config.ron, then /etc/attest/attest.config.ron.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the master pid here while running.
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let controller = match cli.config {
        Some(path) => Controller::new(path),
        None => Controller::from_default_location()?,
    };

    if let Some(pid_file) = &cli.pid_file {
        attest_control::write_pid_file(pid_file)?;
    }

    let outcome = controller.run().await;

    if let Some(pid_file) = &cli.pid_file {
        attest_control::remove_pid_file(pid_file);
    }

    outcome
}
