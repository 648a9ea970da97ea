//! Pipeline controller: the single orchestrator for job lifecycle.
//!
//! One job is in flight at a time; the queue is strictly FIFO. Every job,
//! whether it succeeds or fails, ends with a sealed audit event that is
//! durable before the result is returned. No error path ever produces an
//! output PDF.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, Level};

use crate::audit::{AuditError, AuditEvent, AuditWriter, DocumentRecord, EventIdGenerator, JobStatus};
use crate::config::{Config, ConfigError, Policy};
use crate::error::{IsolationFailure, JobFailure, ParseFailure};
use crate::harness::{IsolationHarness, IsolationLimits};
use crate::ir::{Document, ThreatRecord, ThreatSeverity, WorkerVerdict};
use crate::reconstruct;
use crate::security_log::{SecurityDomain, SecurityEvent};
use crate::validate::validate_document;

const MAX_QUEUE_DEPTH: usize = 256;
const SANITIZED_SUFFIX: &str = "_sanitized";

/// Attestation from the external media-isolation collaborator. The core
/// treats it as an authenticated input and never probes the medium itself.
#[derive(Debug, Clone)]
pub struct Attestation {
    pub source_readonly: bool,
    pub timestamp: String,
    pub source: String,
}

impl Attestation {
    pub fn absent() -> Self {
        Self { source_readonly: false, timestamp: String::new(), source: String::new() }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub input_path: PathBuf,
    /// Explicit output path; derived from the input stem when absent.
    pub output_path: Option<PathBuf>,
    pub operator: String,
    pub workstation_id: String,
    pub classification_tag: String,
    /// Per-job policy override; the configured policy applies when absent.
    pub policy: Option<Policy>,
    pub attestation: Attestation,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub event_id: String,
    pub status: JobStatus,
    pub taxon: Option<String>,
    pub failure_reason: Option<String>,
    pub output_path: Option<PathBuf>,
    pub threats_removed: Vec<ThreatRecord>,
}

/// Controller startup failures; jobs themselves fail through
/// [`JobFailure`].
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("worker unavailable: {0}")]
    Worker(IsolationFailure),
}

pub struct PipelineController {
    config: Config,
    audit: AuditWriter,
    harness: IsolationHarness,
    ids: EventIdGenerator,
    queue: VecDeque<JobRequest>,
    aborted: bool,
}

struct JobSuccess {
    output_path: PathBuf,
    output_sha256: String,
    output_bytes: u64,
}

impl PipelineController {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config.validate()?;
        let key = config.load_hmac_key()?;
        let audit = AuditWriter::open(&config.audit_dir, key)?;
        let harness = IsolationHarness::new(IsolationLimits::from(&config))
            .map_err(ControllerError::Worker)?;
        Ok(Self {
            config,
            audit,
            harness,
            ids: EventIdGenerator::default(),
            queue: VecDeque::new(),
            aborted: false,
        })
    }

    /// Test and embedding seam: supply an explicit harness (e.g. one
    /// pointing at a freshly built worker binary).
    pub fn with_harness(config: Config, audit: AuditWriter, harness: IsolationHarness) -> Self {
        Self {
            config,
            audit,
            harness,
            ids: EventIdGenerator::default(),
            queue: VecDeque::new(),
            aborted: false,
        }
    }

    pub fn enqueue(&mut self, job: JobRequest) -> Result<(), JobRequest> {
        if self.queue.len() >= MAX_QUEUE_DEPTH {
            return Err(job);
        }
        self.queue.push_back(job);
        Ok(())
    }

    pub fn process_next(&mut self) -> Option<JobResult> {
        let job = self.queue.pop_front()?;
        Some(self.submit(job))
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Watchdog signal: finalize a COMPROMISE_ABORT event and refuse all
    /// further jobs.
    pub fn abort(&mut self, reason: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        SecurityEvent {
            level: Level::ERROR,
            domain: SecurityDomain::Pipeline,
            severity: ThreatSeverity::Critical,
            kind: "compromise_abort",
            locator: None,
            message: reason,
        }
        .emit();
        let (event_id, utc_timestamp) = self.ids.next();
        let event = AuditEvent {
            event_id,
            utc_timestamp,
            workstation_id: "-".into(),
            operator: "watchdog".into(),
            classification_tag: "-".into(),
            document: empty_document_record(),
            threats_removed: Vec::new(),
            policy: policy_name(self.config.policy).into(),
            status: JobStatus::CompromiseAbort,
            failure_reason: Some(reason.to_string()),
            hmac_sha256: String::new(),
        };
        if let Ok(sealed) = event.seal(self.audit.hmac_key()) {
            let _ = self.audit.append(&sealed);
        }
    }

    pub fn submit(&mut self, job: JobRequest) -> JobResult {
        let started = Instant::now();
        let (event_id, utc_timestamp) = self.ids.next();
        let policy = job.policy.unwrap_or(self.config.policy);
        let mut threats: Vec<ThreatRecord> = Vec::new();
        let mut document_record = empty_document_record();
        document_record.original_name = file_name_of(&job.input_path);

        let outcome = if self.aborted {
            Err(JobFailure::Aborted)
        } else {
            self.run_job(&job, policy, &mut threats, &mut document_record)
        };
        document_record.processing_ms = started.elapsed().as_millis() as i64;

        let (status, taxon, failure_reason, output_path) = match &outcome {
            Ok(success) => {
                document_record.sanitized_name = Some(file_name_of(&success.output_path));
                document_record.sanitized_sha256 = Some(success.output_sha256.clone());
                document_record.sanitized_bytes = Some(success.output_bytes as i64);
                (JobStatus::Success, None, None, Some(success.output_path.clone()))
            }
            Err(failure) => (
                status_for(failure),
                Some(failure.taxon()),
                Some(failure.to_string()),
                None,
            ),
        };

        let event = AuditEvent {
            event_id: event_id.clone(),
            utc_timestamp,
            workstation_id: job.workstation_id.clone(),
            operator: job.operator.clone(),
            classification_tag: job.classification_tag.clone(),
            document: document_record,
            threats_removed: threats.clone(),
            policy: policy_name(policy).into(),
            status,
            failure_reason: failure_reason.clone(),
            hmac_sha256: String::new(),
        };
        let audit_outcome =
            event.seal(self.audit.hmac_key()).and_then(|sealed| self.audit.append(&sealed));
        if let Err(e) = audit_outcome {
            // An unauditable job is a system failure regardless of how the
            // job itself went.
            return JobResult {
                event_id,
                status: JobStatus::Failed,
                taxon: Some("AUDIT_WRITE_FAILED".into()),
                failure_reason: Some(e.to_string()),
                output_path: None,
                threats_removed: threats,
            };
        }

        info!(
            event_id = %event_id,
            status = ?status,
            threats = threats.len(),
            "job finished"
        );
        JobResult { event_id, status, taxon, failure_reason, output_path, threats_removed: threats }
    }

    fn run_job(
        &mut self,
        job: &JobRequest,
        policy: Policy,
        threats: &mut Vec<ThreatRecord>,
        document_record: &mut DocumentRecord,
    ) -> Result<JobSuccess, JobFailure> {
        // 1. Precondition gate.
        if self.config.source_readonly_required && !job.attestation.source_readonly {
            SecurityEvent {
                level: Level::WARN,
                domain: SecurityDomain::Pipeline,
                severity: ThreatSeverity::High,
                kind: "source_not_readonly",
                locator: Some(&job.attestation.source),
                message: "Source medium lacks a read-only attestation",
            }
            .emit();
            return Err(JobFailure::SourceNotReadonly);
        }
        let input = self.vet_input_path(&job.input_path)?;
        let meta = std::fs::metadata(&input)
            .map_err(|e| JobFailure::Io { detail: format!("input metadata: {e}") })?;
        document_record.original_bytes = meta.len() as i64;
        if meta.len() > self.config.max_input_bytes {
            return Err(JobFailure::Oversize {
                bytes: meta.len(),
                limit: self.config.max_input_bytes,
            });
        }
        let sha256 = sha256_of_file(&input)
            .map_err(|e| JobFailure::Io { detail: format!("input hash: {e}") })?;
        document_record.original_sha256 = sha256;
        if !file_has_pdf_magic(&input)
            .map_err(|e| JobFailure::Io { detail: format!("input read: {e}") })?
        {
            return Err(JobFailure::Parse(ParseFailure::NotAPdf));
        }

        // 2. Output planning.
        let output_path = self.plan_output_path(&input, job.output_path.as_deref())?;

        // 3. Parse under isolation.
        let mut limits = self.config.parse_limits();
        limits.policy = policy;
        let isolated = self
            .harness
            .parse_isolated(&input, &limits)
            .map_err(JobFailure::Isolation)?;
        let mut document = match isolated.verdict {
            WorkerVerdict::Ok { document, threats: worker_threats } => {
                threats.extend(worker_threats);
                document
            }
            WorkerVerdict::Rejected { failure, threats: worker_threats } => {
                threats.extend(worker_threats);
                return Err(JobFailure::Parse(failure));
            }
        };

        // 4. Re-validate the IR; the worker is untrusted.
        if let Err(detail) = validate_document(&document, &limits) {
            scrub_document(&mut document);
            return Err(JobFailure::Isolation(IsolationFailure::IrInvalid { detail }));
        }

        // 5. Reconstruct.
        let outcome =
            reconstruct::reconstruct(&document, &output_path, self.config.max_output_pdf_bytes)
                .map_err(JobFailure::Reconstruct);
        // 7. Cleanup: worker temp dir dies here; decoded document buffers
        // are zeroed before release either way.
        scrub_document(&mut document);
        drop(isolated.job_dir);
        let outcome = outcome?;

        Ok(JobSuccess {
            output_path,
            output_sha256: outcome.sha256,
            output_bytes: outcome.bytes_written,
        })
    }

    fn vet_input_path(&self, path: &Path) -> Result<PathBuf, JobFailure> {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(JobFailure::InputPath { detail: "path traversal component".into() });
        }
        let extension_ok = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !extension_ok {
            return Err(JobFailure::InputPath { detail: "extension is not .pdf".into() });
        }
        let link_meta = std::fs::symlink_metadata(path)
            .map_err(|e| JobFailure::InputPath { detail: format!("unresolvable path: {e}") })?;
        if link_meta.file_type().is_symlink() {
            return Err(JobFailure::InputPath { detail: "input path is a symbolic link".into() });
        }
        let resolved = path
            .canonicalize()
            .map_err(|e| JobFailure::InputPath { detail: format!("unresolvable path: {e}") })?;
        if let Some(root) = &self.config.input_root {
            let root = root
                .canonicalize()
                .map_err(|e| JobFailure::Io { detail: format!("input root: {e}") })?;
            if !resolved.starts_with(&root) {
                return Err(JobFailure::InputPath {
                    detail: "path escapes the declared input root".into(),
                });
            }
        }
        Ok(resolved)
    }

    /// Preferred placement is a sibling of the input named `<stem>_sanitized.pdf`;
    /// a read-only input directory falls back to the configured output
    /// root. The chosen location ends up in the audit record either way.
    fn plan_output_path(
        &self,
        input: &Path,
        explicit: Option<&Path>,
    ) -> Result<PathBuf, JobFailure> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".into());
        let file_name = format!("{stem}{SANITIZED_SUFFIX}.pdf");
        let sibling_dir = input.parent().unwrap_or_else(|| Path::new("."));
        if dir_is_writable(sibling_dir) {
            return Ok(sibling_dir.join(&file_name));
        }
        if let Some(root) = &self.config.output_root {
            std::fs::create_dir_all(root)
                .map_err(|e| JobFailure::Io { detail: format!("output root: {e}") })?;
            return Ok(root.join(file_name));
        }
        Err(JobFailure::Io { detail: "no writable output location".into() })
    }
}

fn dir_is_writable(dir: &Path) -> bool {
    tempfile::tempfile_in(dir).is_ok()
}

fn file_has_pdf_magic(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 5];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic[..] == *crate::admit::PDF_MAGIC)
}

fn sha256_of_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn file_name_of(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "-".into())
}

fn empty_document_record() -> DocumentRecord {
    DocumentRecord {
        original_name: "-".into(),
        original_sha256: "-".into(),
        original_bytes: 0,
        sanitized_name: None,
        sanitized_sha256: None,
        sanitized_bytes: None,
        processing_ms: 0,
    }
}

fn policy_name(policy: Policy) -> &'static str {
    match policy {
        Policy::Aggressive => "AGGRESSIVE",
        Policy::Lenient => "LENIENT",
    }
}

fn status_for(failure: &JobFailure) -> JobStatus {
    match failure {
        JobFailure::SourceNotReadonly | JobFailure::Oversize { .. } | JobFailure::InputPath { .. } => {
            JobStatus::Rejected
        }
        JobFailure::Parse(p) if p.is_input_rejection() => JobStatus::Rejected,
        JobFailure::Parse(_) => JobStatus::Failed,
        JobFailure::Isolation(IsolationFailure::Timeout) => JobStatus::Timeout,
        JobFailure::Isolation(_) => JobStatus::Failed,
        JobFailure::Reconstruct(_) => JobStatus::Failed,
        JobFailure::AuditWriteFailed { .. } | JobFailure::Io { .. } => JobStatus::Failed,
        JobFailure::Aborted => JobStatus::CompromiseAbort,
    }
}

/// Zeroes every buffer that held document-derived bytes before release.
fn scrub_document(document: &mut Document) {
    for page in &mut document.pages {
        for op in &mut page.content_ops {
            match op {
                crate::ir::Op::ShowText { text } => text.fill(0),
                crate::ir::Op::ShowTextArray { items } => {
                    for item in items {
                        if let crate::ir::TextItem::Str { text } = item {
                            text.fill(0);
                        }
                    }
                }
                _ => {}
            }
        }
        for image in page.images.values_mut() {
            image.pixel_data.fill(0);
        }
    }
}
