//! Operator control for the attest daemon: start, stop, restart and
//! status against a pid file.

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

use attest_control::{ControlError, DEFAULT_PID_FILE};

#[derive(Parser, Debug)]
#[command(name = "attestctl")]
#[command(about = "Manage the attest daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the master pid file.
    #[arg(long, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Path to the daemon binary used by start/restart.
    #[arg(long, default_value = "attestd")]
    daemon: PathBuf,

    /// Configuration file passed through to the daemon.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon if it is not already running.
    Start,
    /// Stop the running daemon.
    Stop,
    /// Stop, then start again.
    Restart,
    /// Exit 0 when the daemon is running, nonzero otherwise.
    Status,
}

const STOP_WAIT: Duration = Duration::from_secs(30);

fn start(cli: &Cli) -> Result<(), ControlError> {
    let pid = attest_control::start(&cli.daemon, cli.config.as_deref(), &cli.pid_file)?;
    println!("attestd started (pid {pid})");
    Ok(())
}

fn stop(cli: &Cli) -> Result<(), ControlError> {
    attest_control::stop(&cli.pid_file, STOP_WAIT)?;
    println!("attestd stopped");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Start => start(&cli),
        Commands::Stop => stop(&cli),
        Commands::Restart => stop(&cli).and_then(|()| start(&cli)),
        Commands::Status => match attest_control::status(&cli.pid_file) {
            Ok(pid) => {
                println!("attestd is running (pid {pid})");
                Ok(())
            }
            Err(err) => Err(err),
        },
    };

    if let Err(err) = outcome {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
