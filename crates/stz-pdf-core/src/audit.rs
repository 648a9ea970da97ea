//! Tamper-evident dual-format audit trail.
//!
//! Every job produces exactly one event, written as a structured JSON
//! record (authoritative) and a human-readable text summary. Records are
//! append-only, idempotent by event id, MACed with HMAC-SHA256, and fsynced
//! before the job result is returned.
//!
//! Canonical MAC input, pinned here: the compact serde_json encoding of
//! the event object without the `hmac_sha256` field, with object keys in
//! lexicographic order at every nesting level, UTF-8, no insignificant
//! whitespace. Every numeric audit field is an integer, so no float
//! formatting ambiguity enters the MAC.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use fs2::FileExt;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::ir::ThreatRecord;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit directory is locked by another controller")]
    Locked,
    #[error("audit encoding: {0}")]
    Encode(String),
    #[error("hmac key rejected")]
    Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Failed,
    Rejected,
    Timeout,
    CompromiseAbort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentRecord {
    pub original_name: String,
    pub original_sha256: String,
    pub original_bytes: i64,
    pub sanitized_name: Option<String>,
    pub sanitized_sha256: Option<String>,
    pub sanitized_bytes: Option<i64>,
    pub processing_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEvent {
    pub event_id: String,
    pub utc_timestamp: String,
    pub workstation_id: String,
    pub operator: String,
    pub classification_tag: String,
    pub document: DocumentRecord,
    pub threats_removed: Vec<ThreatRecord>,
    pub policy: String,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    /// MAC over all preceding fields; empty until sealed.
    pub hmac_sha256: String,
}

impl AuditEvent {
    /// Computes and stores the MAC. Must be the last mutation before the
    /// event reaches a sink.
    pub fn seal(mut self, key: &[u8]) -> Result<Self, AuditError> {
        self.hmac_sha256 = compute_hmac(key, &self)?;
        Ok(self)
    }

    /// True when the stored MAC matches a fresh computation over the other
    /// fields. Comparison is constant-time.
    pub fn verify(&self, key: &[u8]) -> Result<bool, AuditError> {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuditError::Key)?;
        mac.update(&canonical_bytes(self)?);
        let stored = match hex::decode(&self.hmac_sha256) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        Ok(mac.verify_slice(&stored).is_ok())
    }
}

/// Canonical MAC input for an event; see the module docs for the pinned
/// algorithm.
pub fn canonical_bytes(event: &AuditEvent) -> Result<Vec<u8>, AuditError> {
    let mut value = serde_json::to_value(event).map_err(|e| AuditError::Encode(e.to_string()))?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| AuditError::Encode("event did not encode as an object".into()))?;
    map.remove("hmac_sha256");
    serde_json::to_vec(&value).map_err(|e| AuditError::Encode(e.to_string()))
}

fn compute_hmac(key: &[u8], event: &AuditEvent) -> Result<String, AuditError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuditError::Key)?;
    mac.update(&canonical_bytes(event)?);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Monotonic `STZ-YYYYMMDD-HHMMSSmmm` ids. A same-millisecond collision
/// advances the clock by one millisecond so ids never repeat or regress
/// within a controller.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last: Option<DateTime<Utc>>,
}

impl EventIdGenerator {
    pub fn next(&mut self) -> (String, String) {
        self.next_at(Utc::now())
    }

    pub fn next_at(&mut self, now: DateTime<Utc>) -> (String, String) {
        let stamp = match self.last {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        let event_id = format!("STZ-{}", stamp.format("%Y%m%d-%H%M%S%3f"));
        let utc_timestamp = stamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        (event_id, utc_timestamp)
    }
}

/// Dual-format sink. Holds an exclusive advisory lock on the directory for
/// its lifetime; concurrent controllers must use disjoint directories.
pub struct AuditWriter {
    dir: PathBuf,
    key: Vec<u8>,
    _lock: File,
}

const LOCK_FILE: &str = ".stz.lock";

impl AuditWriter {
    pub fn open(dir: &Path, key: Vec<u8>) -> Result<Self, AuditError> {
        fs::create_dir_all(dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| AuditError::Locked)?;
        Ok(Self { dir: dir.to_path_buf(), key, _lock: lock })
    }

    pub fn hmac_key(&self) -> &[u8] {
        &self.key
    }

    /// Appends one sealed event in both formats. Idempotent by event id:
    /// an already-written record is left untouched and reported as
    /// success. A failed write is retried once before surfacing.
    pub fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let json_path = self.dir.join(format!("{}.json", event.event_id));
        let txt_path = self.dir.join(format!("{}.txt", event.event_id));
        if json_path.exists() {
            info!(event_id = %event.event_id, "audit event already recorded, skipping");
            return Ok(());
        }
        let json = render_json(event)?;
        let txt = render_text(event);
        self.write_durable(&json_path, &json)?;
        self.write_durable(&txt_path, txt.as_bytes())?;
        self.sync_dir()?;
        Ok(())
    }

    /// Reads a stored record back and checks its MAC. `Ok(false)` means
    /// the record is suspect and the chain of custody broken; callers
    /// must report, never repair.
    pub fn verify_stored(&self, event_id: &str) -> Result<bool, AuditError> {
        let data = fs::read(self.dir.join(format!("{event_id}.json")))?;
        let event: AuditEvent =
            serde_json::from_slice(&data).map_err(|e| AuditError::Encode(e.to_string()))?;
        event.verify(&self.key)
    }

    fn write_durable(&self, path: &Path, data: &[u8]) -> Result<(), AuditError> {
        match self.write_atomic(path, data) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(path = %path.display(), error = %first, "audit write failed, retrying once");
                self.write_atomic(path, data).map_err(AuditError::Io)
            }
        }
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn sync_dir(&self) -> Result<(), AuditError> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// JSON file body: the sealed event with keys in canonical order, pretty
/// printed. The key ordering matches the MAC canonicalization so readers
/// can re-derive the MAC input from the file.
fn render_json(event: &AuditEvent) -> Result<Vec<u8>, AuditError> {
    let value = serde_json::to_value(event).map_err(|e| AuditError::Encode(e.to_string()))?;
    let mut out = serde_json::to_vec_pretty(&value).map_err(|e| AuditError::Encode(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

fn render_text(event: &AuditEvent) -> String {
    let rule = "-".repeat(75);
    let doc = &event.document;
    let mut out = String::new();
    out.push_str(&rule);
    out.push_str("\nPDF SANITIZATION REPORT\n");
    out.push_str(&format!("Event: {}\n", event.event_id));
    out.push_str(&format!("Date: {}\n", event.utc_timestamp));
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("Document: {}\n", doc.original_name));
    out.push_str(&format!("Original Size: {} bytes\n", doc.original_bytes));
    out.push_str(&format!(
        "Sanitized Size: {} bytes\n",
        doc.sanitized_bytes.map_or_else(|| "-".into(), |b| b.to_string())
    ));
    out.push_str(&format!("Processing Time: {} ms\n\n", doc.processing_ms));
    out.push_str(&format!("THREATS REMOVED: {} total\n", event.threats_removed.len()));
    for threat in &event.threats_removed {
        out.push_str(&format!("  [{:?}] {}\n", threat.severity, threat.kind));
        out.push_str(&format!("    Locator: {}\n", threat.locator));
        out.push_str(&format!("    Action: {:?}\n", threat.action));
    }
    out.push_str(&format!("\nSANITIZATION STATUS: {:?}\n", event.status));
    if let Some(reason) = &event.failure_reason {
        out.push_str(&format!("Failure Reason: {reason}\n"));
    }
    out.push_str(&format!("Policy: {}\n", event.policy));
    out.push_str(&format!("Original Hash (SHA-256): {}\n", doc.original_sha256));
    out.push_str(&format!(
        "Sanitized Hash (SHA-256): {}\n",
        doc.sanitized_sha256.as_deref().unwrap_or("-")
    ));
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!(
        "Operator: {} | Workstation: {} | Classification: {}\n",
        event.operator, event.workstation_id, event.classification_tag
    ));
    out
}
