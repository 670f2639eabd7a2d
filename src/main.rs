//! Binary entry point for the corral maintenance CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use corral::{Janitor, JanitorConfig, JanitorError, SweepSummary};

mod cli;

use cli::{Cli, SweepCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("sweep failed: {0}")]
    Sweep(#[from] JanitorError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli) {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Sweep(command) => {
            let summary = sweep(command)?;
            write_summary(&mut io::stdout(), &summary)?;
            Ok(())
        }
    }
}

fn sweep(command: SweepCommand) -> Result<SweepSummary, JanitorError> {
    let config = JanitorConfig::new(command.namespace, command.scope, command.kubectl_bin)?;
    Janitor::with_process_runner(config).sweep()
}

fn write_summary(out: &mut impl Write, summary: &SweepSummary) -> io::Result<()> {
    let counts: Vec<String> = summary
        .deleted
        .iter()
        .map(|(kind, count)| format!("{kind}={count}"))
        .collect();
    writeln!(
        out,
        "sweep complete: deleted {} object(s) {}",
        summary.total(),
        counts.join(", ")
    )
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "corral: {err}").ok();
}
