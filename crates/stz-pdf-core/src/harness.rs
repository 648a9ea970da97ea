//! Isolation harness: runs the whitelist parser in a child process under
//! OS-enforced resource limits.
//!
//! The parent and child exchange nothing but the input path (read-only to
//! the child), one structured verdict file in a per-job temp directory,
//! and captured stderr. A clean rejection is a normal exit with a
//! `rejected` verdict; everything else is treated as a crash of the
//! untrusted parser. The harness never retries.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, Level};

use crate::admit;
use crate::config::{Config, ParseLimits};
use crate::error::IsolationFailure;
use crate::ir::{ThreatSeverity, WorkerVerdict};
use crate::security_log::{SecurityDomain, SecurityEvent};

pub const IR_FILE: &str = "ir.json";
pub const LIMITS_FILE: &str = "limits.json";
pub const WORKER_ENV: &str = "STZ_PDF_WORKER";
const WORKER_BINARY: &str = "stz-pdf-worker";

const WAIT_POLL: Duration = Duration::from_millis(50);
const STDERR_CAPTURE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct IsolationLimits {
    pub memory_limit_bytes: u64,
    pub timeout_ms: u64,
    pub max_output_ir_bytes: u64,
}

impl From<&Config> for IsolationLimits {
    fn from(config: &Config) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            timeout_ms: config.timeout_ms,
            max_output_ir_bytes: config.max_output_ir_bytes,
        }
    }
}

pub struct IsolationHarness {
    worker_path: PathBuf,
    limits: IsolationLimits,
}

/// Result of one isolated parse, together with the job directory so the
/// controller can destroy it after the audit record is finalized.
pub struct IsolatedParse {
    pub verdict: WorkerVerdict,
    pub job_dir: tempfile::TempDir,
}

impl IsolationHarness {
    pub fn new(limits: IsolationLimits) -> Result<Self, IsolationFailure> {
        let worker_path = locate_worker().ok_or_else(|| IsolationFailure::ChildCrash {
            detail: "worker binary not found; set STZ_PDF_WORKER".into(),
        })?;
        Ok(Self { worker_path, limits })
    }

    pub fn with_worker(worker_path: PathBuf, limits: IsolationLimits) -> Self {
        Self { worker_path, limits }
    }

    pub fn parse_isolated(
        &self,
        input_path: &Path,
        parse_limits: &ParseLimits,
    ) -> Result<IsolatedParse, IsolationFailure> {
        let job_dir = tempfile::TempDir::new().map_err(|e| IsolationFailure::ChildCrash {
            detail: format!("job directory: {e}"),
        })?;
        let limits_path = job_dir.path().join(LIMITS_FILE);
        let limits_json =
            serde_json::to_vec(parse_limits).map_err(|e| IsolationFailure::ChildCrash {
                detail: format!("limits serialization: {e}"),
            })?;
        fs::write(&limits_path, limits_json).map_err(|e| IsolationFailure::ChildCrash {
            detail: format!("limits write: {e}"),
        })?;

        let mut command = Command::new(&self.worker_path);
        command
            .arg("--input")
            .arg(input_path)
            .arg("--output")
            .arg(job_dir.path())
            .arg("--limits")
            .arg(&limits_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .env_clear();
        apply_resource_limits(&mut command, self.limits);

        let mut child = command.spawn().map_err(|e| IsolationFailure::ChildCrash {
            detail: format!("spawn: {e}"),
        })?;
        let stderr_reader = spawn_stderr_reader(&mut child);

        let deadline = Instant::now() + Duration::from_millis(self.limits.timeout_ms);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        SecurityEvent {
                            level: Level::WARN,
                            domain: SecurityDomain::Harness,
                            severity: ThreatSeverity::High,
                            kind: "worker_timeout",
                            locator: None,
                            message: "Worker exceeded wall-clock budget, killing",
                        }
                        .emit();
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(IsolationFailure::Timeout);
                    }
                    std::thread::sleep(WAIT_POLL);
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(IsolationFailure::ChildCrash { detail: format!("wait: {e}") });
                }
            }
        };
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            SecurityEvent {
                level: Level::ERROR,
                domain: SecurityDomain::Harness,
                severity: ThreatSeverity::Critical,
                kind: "worker_crash",
                locator: None,
                message: "Worker exited abnormally",
            }
            .emit();
            return Err(IsolationFailure::ChildCrash {
                detail: format!("exit status {status}: {}", String::from_utf8_lossy(&stderr)),
            });
        }

        let verdict = self.read_verdict(job_dir.path())?;
        debug!("worker verdict ingested");
        Ok(IsolatedParse { verdict, job_dir })
    }

    fn read_verdict(&self, job_dir: &Path) -> Result<WorkerVerdict, IsolationFailure> {
        let ir_path = job_dir.join(IR_FILE);
        let meta = fs::metadata(&ir_path).map_err(|_| IsolationFailure::IrInvalid {
            detail: "worker produced no IR file".into(),
        })?;
        if meta.len() > self.limits.max_output_ir_bytes {
            return Err(IsolationFailure::IrInvalid {
                detail: format!("IR file of {} bytes exceeds budget", meta.len()),
            });
        }
        let data = fs::read(&ir_path).map_err(|e| IsolationFailure::IrInvalid {
            detail: format!("IR unreadable: {e}"),
        })?;
        serde_json::from_slice(&data).map_err(|e| IsolationFailure::IrInvalid {
            detail: format!("IR schema violation: {e}"),
        })
    }
}

/// Entry point shared by the worker binary and in-process tests: parse one
/// input under the whitelist and write the verdict file.
pub fn run_worker(input: &Path, output_dir: &Path, limits: &ParseLimits) -> anyhow::Result<()> {
    let verdict = match admit::parse_file(input, limits) {
        Ok(admission) => {
            WorkerVerdict::Ok { document: admission.document, threats: admission.threats }
        }
        Err(rejection) => {
            WorkerVerdict::Rejected { failure: rejection.failure, threats: rejection.threats }
        }
    };
    let payload = serde_json::to_vec(&verdict)?;
    fs::write(output_dir.join(IR_FILE), payload)?;
    Ok(())
}

fn locate_worker() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_ENV) {
        let path = PathBuf::from(path);
        return path.is_file().then_some(path);
    }
    let exe = std::env::current_exe().ok()?;
    let sibling = exe.parent()?.join(WORKER_BINARY);
    sibling.is_file().then_some(sibling)
}

#[cfg(unix)]
fn apply_resource_limits(command: &mut Command, limits: IsolationLimits) {
    use std::os::unix::process::CommandExt;

    let memory = limits.memory_limit_bytes;
    let ir_budget = limits.max_output_ir_bytes;
    // Hard CPU cap one second past the soft cap, like the wall clock a
    // grace beyond the budget.
    let cpu_secs = (limits.timeout_ms / 1000).max(1);
    unsafe {
        command.pre_exec(move || {
            use nix::sys::resource::{setrlimit, Resource};
            let fail = |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);
            setrlimit(Resource::RLIMIT_AS, memory, memory).map_err(fail)?;
            setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs + 1).map_err(fail)?;
            setrlimit(Resource::RLIMIT_FSIZE, ir_budget, ir_budget).map_err(fail)?;
            setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(fail)?;
            // The worker may not spawn further processes.
            setrlimit(Resource::RLIMIT_NPROC, 0, 0).map_err(fail)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_resource_limits(_command: &mut Command, _limits: IsolationLimits) {
    tracing::warn!(
        security = true,
        domain = "stz.harness",
        kind = "rlimits_unavailable",
        "Resource limits are only enforced on unix hosts"
    );
}

fn spawn_stderr_reader(child: &mut Child) -> std::thread::JoinHandle<Vec<u8>> {
    let stderr = child.stderr.take();
    std::thread::spawn(move || {
        let mut out = Vec::new();
        if let Some(mut stderr) = stderr {
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out.len() < STDERR_CAPTURE_BYTES {
                            let take = n.min(STDERR_CAPTURE_BYTES - out.len());
                            out.extend_from_slice(&buf[..take]);
                        }
                        // Keep draining so the child never blocks on a
                        // full pipe.
                    }
                }
            }
        }
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParseLimits;
    use crate::error::ParseFailure;

    fn minimal_hello_pdf() -> Vec<u8> {
        let mut pdf = Vec::new();
        pdf.extend_from_slice(b"%PDF-1.4\n");
        pdf.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        pdf.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
        pdf.extend_from_slice(
            b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
              /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >> endobj\n",
        );
        pdf.extend_from_slice(
            b"4 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
        );
        let content = b"BT /F1 12 Tf 100 700 Td (Hello) Tj ET";
        pdf.extend_from_slice(
            format!("5 0 obj << /Length {} >>\nstream\n", content.len()).as_bytes(),
        );
        pdf.extend_from_slice(content);
        pdf.extend_from_slice(b"\nendstream endobj\n");
        pdf.extend_from_slice(b"trailer << /Root 1 0 R /Size 6 >>\nstartxref\n0\n%%EOF\n");
        pdf
    }

    #[test]
    fn worker_entry_writes_ok_verdict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("hello.pdf");
        fs::write(&input, minimal_hello_pdf()).expect("write input");
        run_worker(&input, dir.path(), &ParseLimits::default()).expect("worker run");
        let data = fs::read(dir.path().join(IR_FILE)).expect("read verdict");
        let verdict: WorkerVerdict = serde_json::from_slice(&data).expect("parse verdict");
        match verdict {
            WorkerVerdict::Ok { document, threats } => {
                assert_eq!(document.pages.len(), 1);
                assert!(threats.is_empty());
            }
            other => panic!("expected ok verdict, got {other:?}"),
        }
    }

    #[test]
    fn worker_entry_writes_rejected_verdict_for_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("junk.bin");
        fs::write(&input, b"MZ\x90\x00not a pdf at all").expect("write input");
        run_worker(&input, dir.path(), &ParseLimits::default()).expect("worker run");
        let data = fs::read(dir.path().join(IR_FILE)).expect("read verdict");
        let verdict: WorkerVerdict = serde_json::from_slice(&data).expect("parse verdict");
        assert!(matches!(
            verdict,
            WorkerVerdict::Rejected { failure: ParseFailure::NotAPdf, .. }
        ));
    }

    #[test]
    fn oversized_ir_is_rejected_on_ingest() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(IR_FILE), vec![b'x'; 4096]).expect("write ir");
        let harness = IsolationHarness::with_worker(
            PathBuf::from("/nonexistent"),
            IsolationLimits {
                memory_limit_bytes: 1,
                timeout_ms: 1000,
                max_output_ir_bytes: 1024,
            },
        );
        match harness.read_verdict(dir.path()) {
            Err(IsolationFailure::IrInvalid { detail }) => {
                assert!(detail.contains("exceeds budget"));
            }
            other => panic!("expected IrInvalid, got {other:?}"),
        }
    }
}
