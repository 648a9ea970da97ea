//! Core of the stz-pdf sanitization engine.
//!
//! The pipeline accepts an untrusted PDF, parses it in an isolated worker
//! under a strict whitelist, re-validates the resulting intermediate
//! representation on the trusted side, rebuilds a byte-new PDF from it, and
//! records every job in a tamper-evident dual-format audit trail. Nothing
//! from the input byte stream ever reaches the output.

pub mod admit;
pub mod audit;
pub mod config;
pub mod error;
pub mod harness;
pub mod ir;
pub mod pipeline;
pub mod reconstruct;
pub mod security_log;
pub mod validate;

pub use crate::config::{Config, ParseLimits, Policy};
pub use crate::error::{IsolationFailure, JobFailure, ParseFailure, ReconstructFailure};
pub use crate::ir::{Document, Page, ThreatRecord, WorkerVerdict};
pub use crate::pipeline::{JobRequest, JobResult, PipelineController};
