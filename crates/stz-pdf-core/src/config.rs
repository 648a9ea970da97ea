use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, Level};

use stz_pdf_pdf::decode::DecodeLimits;
use stz_pdf_pdf::scan::ScanLimits;

use crate::ir::ThreatSeverity;
use crate::security_log::{SecurityDomain, SecurityEvent};

const MAX_CONFIG_BYTES: u64 = 1024 * 1024;
const MAX_INPUT_BYTES_CEILING: u64 = 4 * 1024 * 1024 * 1024;
const MAX_DECODE_BYTES_CEILING: usize = 512 * 1024 * 1024;
const MAX_PAGES_CEILING: usize = 100_000;
const MIN_TIMEOUT_MS: u64 = 1_000;
const MIN_MEMORY_BYTES: u64 = 16 * 1024 * 1024;
const MIN_HMAC_KEY_BYTES: usize = 32;

/// Disposition toward disallowed constructs. AGGRESSIVE rejects the job on
/// the first one; LENIENT strips, logs, and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Policy {
    Aggressive,
    Lenient,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config signature invalid")]
    SignatureInvalid,
    #[error("config schema: {0}")]
    Schema(String),
    #[error("config option {option} out of range")]
    OutOfRange { option: &'static str },
    #[error("hmac key unusable: {0}")]
    HmacKey(String),
}

/// Read-only engine configuration. Loaded once at controller startup and
/// never re-read while jobs are in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub policy: Policy,
    pub memory_limit_bytes: u64,
    pub timeout_ms: u64,
    pub max_input_bytes: u64,
    pub max_pages: usize,
    pub max_ops_per_page: usize,
    pub max_image_pixels: u64,
    pub max_image_dimension: u32,
    pub max_image_bytes: usize,
    pub max_decode_output_bytes: usize,
    pub max_output_ir_bytes: u64,
    pub max_output_pdf_bytes: u64,
    pub max_gstate_depth: usize,
    pub max_page_area: f64,
    /// Highest accepted header version, e.g. "1.7".
    pub max_pdf_version: String,
    /// Image filter chains eligible for admission. Only filters this build
    /// can decode-and-measure are accepted here.
    pub image_filters: Vec<String>,
    pub audit_dir: PathBuf,
    /// Fallback output directory when the input's directory is read-only.
    pub output_root: Option<PathBuf>,
    /// When set, input paths must resolve under this root.
    pub input_root: Option<PathBuf>,
    /// Reference to the HMAC key held by the secure-configuration layer.
    pub hmac_key_ref: PathBuf,
    pub source_readonly_required: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::Aggressive,
            memory_limit_bytes: 500 * 1024 * 1024,
            timeout_ms: 300_000,
            max_input_bytes: 500 * 1024 * 1024,
            max_pages: 10_000,
            max_ops_per_page: 200_000,
            max_image_pixels: 100_000_000,
            max_image_dimension: 20_000,
            max_image_bytes: 256 * 1024 * 1024,
            max_decode_output_bytes: 64 * 1024 * 1024,
            max_output_ir_bytes: 1024 * 1024 * 1024,
            max_output_pdf_bytes: 1024 * 1024 * 1024,
            max_gstate_depth: 64,
            max_page_area: 1.0e10,
            max_pdf_version: "1.7".into(),
            image_filters: vec!["FlateDecode".into(), "DCTDecode".into()],
            audit_dir: PathBuf::from("audit"),
            output_root: None,
            input_root: None,
            hmac_key_ref: PathBuf::from("hmac.key"),
            source_readonly_required: true,
        }
    }
}

impl Config {
    /// Loads an unsigned config file. Intended for tests and embedded use;
    /// production deployments go through [`Config::load_signed`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = fs::metadata(path)?;
        if meta.len() > MAX_CONFIG_BYTES {
            return Err(ConfigError::OutOfRange { option: "config file size" });
        }
        let data = fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&data).map_err(|e| ConfigError::Schema(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a persisted config whose exact bytes are covered by a detached
    /// ECDSA P-256 signature (`<path>.sig`, ASN.1 DER). Refuses to return a
    /// config on any verification failure.
    pub fn load_signed(path: &Path, public_key_sec1: &[u8]) -> Result<Self, ConfigError> {
        let meta = fs::metadata(path)?;
        if meta.len() > MAX_CONFIG_BYTES {
            return Err(ConfigError::OutOfRange { option: "config file size" });
        }
        let data = fs::read(path)?;
        let sig_path = signature_path(path);
        let signature = fs::read(&sig_path)?;
        let key = ring::signature::UnparsedPublicKey::new(
            &ring::signature::ECDSA_P256_SHA256_ASN1,
            public_key_sec1,
        );
        key.verify(&data, &signature).map_err(|_| {
            SecurityEvent {
                level: Level::ERROR,
                domain: SecurityDomain::Config,
                severity: ThreatSeverity::Critical,
                kind: "config_signature_invalid",
                locator: None,
                message: "Configuration signature verification failed",
            }
            .emit();
            ConfigError::SignatureInvalid
        })?;
        let text =
            String::from_utf8(data).map_err(|_| ConfigError::Schema("config is not UTF-8".into()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Schema(e.to_string()))?;
        cfg.validate()?;
        info!(path = %path.display(), "signed configuration loaded");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit_bytes < MIN_MEMORY_BYTES {
            return Err(self.reject("memory_limit_bytes"));
        }
        if self.timeout_ms < MIN_TIMEOUT_MS {
            return Err(self.reject("timeout_ms"));
        }
        if self.max_input_bytes == 0 || self.max_input_bytes > MAX_INPUT_BYTES_CEILING {
            return Err(self.reject("max_input_bytes"));
        }
        if self.max_pages == 0 || self.max_pages > MAX_PAGES_CEILING {
            return Err(self.reject("max_pages"));
        }
        if self.max_ops_per_page == 0 {
            return Err(self.reject("max_ops_per_page"));
        }
        if self.max_decode_output_bytes == 0
            || self.max_decode_output_bytes > MAX_DECODE_BYTES_CEILING
        {
            return Err(self.reject("max_decode_output_bytes"));
        }
        if self.max_image_pixels == 0 || self.max_image_dimension == 0 || self.max_image_bytes == 0
        {
            return Err(self.reject("image limits"));
        }
        if self.max_gstate_depth == 0 || !self.max_page_area.is_finite() || self.max_page_area <= 0.0
        {
            return Err(self.reject("geometry limits"));
        }
        if parse_pdf_version(&self.max_pdf_version).is_none() {
            return Err(self.reject("max_pdf_version"));
        }
        for filter in &self.image_filters {
            // Admission requires decode-and-measure; this build measures
            // Flate and DCT. A config naming anything else is refused
            // rather than silently narrowed.
            if filter != "FlateDecode" && filter != "DCTDecode" {
                return Err(self.reject("image_filters"));
            }
        }
        Ok(())
    }

    fn reject(&self, option: &'static str) -> ConfigError {
        SecurityEvent {
            level: Level::WARN,
            domain: SecurityDomain::Config,
            severity: ThreatSeverity::Low,
            kind: "config_option_out_of_range",
            locator: Some(option),
            message: "Configuration option out of range",
        }
        .emit();
        ConfigError::OutOfRange { option }
    }

    /// Key material for the audit HMAC, resolved through `hmac_key_ref`.
    pub fn load_hmac_key(&self) -> Result<Vec<u8>, ConfigError> {
        let key = fs::read(&self.hmac_key_ref)?;
        if key.len() < MIN_HMAC_KEY_BYTES {
            return Err(ConfigError::HmacKey(format!(
                "key shorter than {MIN_HMAC_KEY_BYTES} bytes"
            )));
        }
        Ok(key)
    }

    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            policy: self.policy,
            max_input_bytes: self.max_input_bytes,
            max_pages: self.max_pages,
            max_ops_per_page: self.max_ops_per_page,
            max_image_pixels: self.max_image_pixels,
            max_image_dimension: self.max_image_dimension,
            max_image_bytes: self.max_image_bytes,
            max_decode_output_bytes: self.max_decode_output_bytes,
            max_gstate_depth: self.max_gstate_depth,
            max_page_area: self.max_page_area,
            max_pdf_version: self.max_pdf_version.clone(),
            image_filters: self.image_filters.clone(),
        }
    }
}

/// The subset of configuration the worker needs, serialized into its job
/// directory so the child never reads the controller's config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParseLimits {
    pub policy: Policy,
    pub max_input_bytes: u64,
    pub max_pages: usize,
    pub max_ops_per_page: usize,
    pub max_image_pixels: u64,
    pub max_image_dimension: u32,
    pub max_image_bytes: usize,
    pub max_decode_output_bytes: usize,
    pub max_gstate_depth: usize,
    pub max_page_area: f64,
    pub max_pdf_version: String,
    pub image_filters: Vec<String>,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Config::default().parse_limits()
    }
}

impl ParseLimits {
    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_decoded_bytes: self.max_decode_output_bytes,
            max_filter_chain_depth: 4,
        }
    }

    pub fn scan_limits(&self) -> ScanLimits {
        ScanLimits { decode: self.decode_limits(), ..ScanLimits::default() }
    }
}

pub(crate) fn signature_path(config_path: &Path) -> PathBuf {
    let mut os = config_path.as_os_str().to_os_string();
    os.push(".sig");
    PathBuf::from(os)
}

/// Parses "M.N" into a comparable pair. PDF versions are single-digit
/// fields, so tuple ordering is the document ordering.
pub fn parse_pdf_version(text: &str) -> Option<(u8, u8)> {
    let (major, minor) = text.split_once('.')?;
    if major.len() != 1 || minor.len() != 1 {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}
