use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use stz_pdf_core::audit::{AuditWriter, JobStatus};
use stz_pdf_core::pipeline::{Attestation, JobRequest, PipelineController};
use stz_pdf_core::{Config, Policy};

#[derive(Parser)]
#[command(name = "stz-pdf", about = "Defense-grade PDF sanitizer")]
struct Args {
    /// Engine configuration (TOML). Requires --config-pub; the config's
    /// detached ECDSA signature is verified before anything runs.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SEC1-encoded P-256 public key for configuration verification.
    #[arg(long, global = true)]
    config_pub: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Sanitize PDFs and write audit records")]
    Sanitize {
        #[arg(value_name = "PDF", required = true)]
        inputs: Vec<PathBuf>,
        /// Explicit output path; only valid with a single input.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value = "operator")]
        operator: String,
        #[arg(long)]
        workstation: Option<String>,
        #[arg(long, default_value = "UNMARKED")]
        classification: String,
        /// Strip-and-log instead of reject-on-first-threat.
        #[arg(long)]
        lenient: bool,
        /// Attest that the source medium is mounted read-only.
        #[arg(long)]
        source_readonly_attested: bool,
        /// Identifier of the attestation source, e.g. the mount monitor.
        #[arg(long, default_value = "cli")]
        attestation_source: String,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Recompute the HMAC of a stored audit record")]
    VerifyAudit {
        #[arg(value_name = "EVENT_ID")]
        event_id: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    match run() {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref(), args.config_pub.as_deref())?;
    match args.command {
        Command::Sanitize {
            inputs,
            out,
            operator,
            workstation,
            classification,
            lenient,
            source_readonly_attested,
            attestation_source,
            json,
        } => {
            if out.is_some() && inputs.len() != 1 {
                bail!("--out requires exactly one input");
            }
            let workstation = workstation
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| "workstation".into());
            let mut controller = PipelineController::new(config)
                .map_err(|e| anyhow!("controller startup: {e}"))?;
            let mut all_clean = true;
            for input in inputs {
                let request = JobRequest {
                    input_path: input,
                    output_path: out.clone(),
                    operator: operator.clone(),
                    workstation_id: workstation.clone(),
                    classification_tag: classification.clone(),
                    policy: lenient.then_some(Policy::Lenient),
                    attestation: Attestation {
                        source_readonly: source_readonly_attested,
                        timestamp: chrono_now(),
                        source: attestation_source.clone(),
                    },
                };
                let result = controller.submit(request);
                if result.status != JobStatus::Success {
                    all_clean = false;
                }
                if json {
                    println!("{}", serde_json::to_string(&result)?);
                } else {
                    print_result(&result);
                }
            }
            Ok(all_clean)
        }
        Command::VerifyAudit { event_id } => {
            let key = config.load_hmac_key().map_err(|e| anyhow!("hmac key: {e}"))?;
            let writer = AuditWriter::open(&config.audit_dir, key)
                .map_err(|e| anyhow!("audit dir: {e}"))?;
            let valid = writer
                .verify_stored(&event_id)
                .map_err(|e| anyhow!("verify {event_id}: {e}"))?;
            if valid {
                println!("{event_id}: MAC valid");
            } else {
                println!("{event_id}: MAC INVALID - record is suspect");
            }
            Ok(valid)
        }
    }
}

fn load_config(config: Option<&std::path::Path>, public_key: Option<&std::path::Path>) -> Result<Config> {
    match (config, public_key) {
        (Some(path), Some(key_path)) => {
            let key = fs::read(key_path)
                .with_context(|| format!("reading public key {}", key_path.display()))?;
            Config::load_signed(path, &key).map_err(|e| anyhow!("config: {e}"))
        }
        (Some(_), None) => bail!("--config requires --config-pub for signature verification"),
        (None, _) => Ok(Config::default()),
    }
}

fn print_result(result: &stz_pdf_core::JobResult) {
    let disposition = match result.status {
        JobStatus::Success => "SUCCESS",
        JobStatus::Rejected => "REJECTED",
        JobStatus::Failed => "FAILED",
        JobStatus::Timeout => "TIMEOUT",
        JobStatus::CompromiseAbort => "COMPROMISE_ABORT",
    };
    print!("{} {disposition}", result.event_id);
    if let Some(taxon) = &result.taxon {
        print!(" {taxon}");
    }
    if let Some(path) = &result.output_path {
        print!(" -> {}", path.display());
    }
    println!();
    if !result.threats_removed.is_empty() {
        println!("  threats removed: {}", result.threats_removed.len());
        for threat in &result.threats_removed {
            println!("    [{:?}] {} at {}", threat.severity, threat.kind, threat.locator);
        }
    }
    if let Some(reason) = &result.failure_reason {
        println!("  reason: {reason}");
    }
}

fn chrono_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
