use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal parse outcomes. A failing parse never yields a partial IR.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "failure_kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParseFailure {
    #[error("input is not a PDF")]
    NotAPdf,
    #[error("required structure missing: {detail}")]
    Truncated { detail: String },
    #[error("header version {version} exceeds the configured maximum")]
    UnsupportedVersion { version: String },
    #[error("document is encrypted")]
    Encrypted,
    #[error("disallowed construct {kind} at {locator}")]
    DisallowedConstruct { kind: String, locator: String },
    #[error("decompression output budget exceeded")]
    DecompressionBudgetExceeded,
    #[error("{which} limit exceeded")]
    LimitExceeded { which: String },
    #[error("malformed input: {detail}")]
    Malformed { detail: String },
}

impl ParseFailure {
    /// Short taxon for audit records and operator-facing results.
    pub fn taxon(&self) -> &'static str {
        match self {
            ParseFailure::NotAPdf => "NOT_A_PDF",
            ParseFailure::Truncated { .. } => "TRUNCATED",
            ParseFailure::UnsupportedVersion { .. } => "UNSUPPORTED_VERSION",
            ParseFailure::Encrypted => "ENCRYPTED",
            ParseFailure::DisallowedConstruct { .. } => "DISALLOWED_CONSTRUCT",
            ParseFailure::DecompressionBudgetExceeded => "DECOMPRESSION_BUDGET_EXCEEDED",
            ParseFailure::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            ParseFailure::Malformed { .. } => "MALFORMED",
        }
    }

    /// Input rejections fail cleanly; content rejections indicate the
    /// document fought the whitelist.
    pub fn is_input_rejection(&self) -> bool {
        matches!(
            self,
            ParseFailure::NotAPdf
                | ParseFailure::Truncated { .. }
                | ParseFailure::UnsupportedVersion { .. }
                | ParseFailure::Encrypted
        )
    }
}

/// Failures of the isolation boundary itself. Every one of these is fatal
/// for the job and none is retried: an input that crashed the parser once
/// is not safer on a second run.
#[derive(Debug, Error)]
pub enum IsolationFailure {
    #[error("worker exited abnormally: {detail}")]
    ChildCrash { detail: String },
    #[error("worker exceeded the wall-clock budget")]
    Timeout,
    #[error("worker IR failed validation: {detail}")]
    IrInvalid { detail: String },
}

impl IsolationFailure {
    pub fn taxon(&self) -> &'static str {
        match self {
            IsolationFailure::ChildCrash { .. } => "CHILD_CRASH",
            IsolationFailure::Timeout => "TIMEOUT",
            IsolationFailure::IrInvalid { .. } => "IR_INVALID",
        }
    }
}

/// Reconstruction failures are defects to investigate, not attacks.
#[derive(Debug, Error)]
pub enum ReconstructFailure {
    #[error("output io: {0}")]
    Io(#[from] std::io::Error),
    #[error("document has no admissible pages")]
    EmptyDocument,
    #[error("invariant violated during emission: {detail}")]
    InvariantViolation { detail: String },
    #[error("output of {bytes} bytes exceeds budget of {budget}")]
    OutputExceedsBudget { bytes: u64, budget: u64 },
}

impl ReconstructFailure {
    pub fn taxon(&self) -> &'static str {
        match self {
            ReconstructFailure::Io(_) => "IO",
            ReconstructFailure::EmptyDocument => "EMPTY_DOCUMENT",
            ReconstructFailure::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            ReconstructFailure::OutputExceedsBudget { .. } => "OUTPUT_EXCEEDS_BUDGET",
        }
    }
}

/// Everything a job can die of, rolled up for the controller and the audit
/// record. No variant is ever silently downgraded into another.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error("source medium is not attested read-only")]
    SourceNotReadonly,
    #[error("input of {bytes} bytes exceeds the {limit}-byte cap")]
    Oversize { bytes: u64, limit: u64 },
    #[error("input path rejected: {detail}")]
    InputPath { detail: String },
    #[error(transparent)]
    Parse(ParseFailure),
    #[error(transparent)]
    Isolation(IsolationFailure),
    #[error(transparent)]
    Reconstruct(ReconstructFailure),
    #[error("audit write failed: {detail}")]
    AuditWriteFailed { detail: String },
    #[error("io: {detail}")]
    Io { detail: String },
    #[error("controller received a compromise abort")]
    Aborted,
}

impl JobFailure {
    pub fn taxon(&self) -> String {
        match self {
            JobFailure::SourceNotReadonly => "SOURCE_NOT_READONLY".into(),
            JobFailure::Oversize { .. } => "OVERSIZE".into(),
            JobFailure::InputPath { .. } => "INPUT_PATH".into(),
            JobFailure::Parse(p) => p.taxon().into(),
            JobFailure::Isolation(i) => i.taxon().into(),
            JobFailure::Reconstruct(r) => r.taxon().into(),
            JobFailure::AuditWriteFailed { .. } => "AUDIT_WRITE_FAILED".into(),
            JobFailure::Io { .. } => "IO".into(),
            JobFailure::Aborted => "COMPROMISE_ABORT".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failure_round_trips_as_tagged_json() {
        let failure = ParseFailure::DisallowedConstruct {
            kind: "OpenAction".into(),
            locator: "1 0 obj".into(),
        };
        let json = serde_json::to_string(&failure).expect("serialize");
        assert!(json.contains("\"DISALLOWED_CONSTRUCT\""));
        let back: ParseFailure = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, failure);
    }

    #[test]
    fn taxa_match_the_failure_taxonomy() {
        assert_eq!(ParseFailure::NotAPdf.taxon(), "NOT_A_PDF");
        assert_eq!(IsolationFailure::Timeout.taxon(), "TIMEOUT");
        assert_eq!(ReconstructFailure::EmptyDocument.taxon(), "EMPTY_DOCUMENT");
        assert_eq!(JobFailure::Aborted.taxon(), "COMPROMISE_ABORT");
    }

    #[test]
    fn input_rejections_are_classified() {
        assert!(ParseFailure::Encrypted.is_input_rejection());
        assert!(!ParseFailure::DecompressionBudgetExceeded.is_input_rejection());
    }
}
