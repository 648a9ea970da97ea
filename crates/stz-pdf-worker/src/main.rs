//! Isolated parse worker.
//!
//! Runs inside the resource envelope the harness sets up: no stdin, no
//! network expectation, writes exactly one verdict file into its job
//! directory and diagnostics to stderr. A clean rejection is a normal
//! exit; a non-zero exit means the parser itself failed and the harness
//! reports a crash.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use stz_pdf_core::harness;
use stz_pdf_core::ParseLimits;

#[derive(Parser)]
#[command(name = "stz-pdf-worker", disable_help_subcommand = true)]
struct Args {
    /// Input PDF path; read-only from this process's perspective.
    #[arg(long)]
    input: PathBuf,
    /// Job directory for the verdict file; the only writable location.
    #[arg(long)]
    output: PathBuf,
    /// Serialized parse limits prepared by the controller.
    #[arg(long)]
    limits: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "worker failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let limits_data = fs::read(&args.limits)
        .with_context(|| format!("reading limits {}", args.limits.display()))?;
    let limits: ParseLimits =
        serde_json::from_slice(&limits_data).context("parsing limits")?;
    info!(input = %args.input.display(), "worker starting");
    harness::run_worker(&args.input, &args.output, &limits)?;
    info!("worker verdict written");
    Ok(())
}
