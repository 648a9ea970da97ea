use std::fmt;

use tracing::Level;

use crate::ir::ThreatSeverity;

#[derive(Debug, Clone, Copy)]
pub enum SecurityDomain {
    Parser,
    Content,
    Harness,
    Reconstructor,
    Pipeline,
    Audit,
    Config,
}

impl SecurityDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityDomain::Parser => "stz.parser",
            SecurityDomain::Content => "stz.content",
            SecurityDomain::Harness => "stz.harness",
            SecurityDomain::Reconstructor => "stz.reconstruct",
            SecurityDomain::Pipeline => "stz.pipeline",
            SecurityDomain::Audit => "stz.audit",
            SecurityDomain::Config => "stz.config",
        }
    }
}

impl fmt::Display for SecurityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured security event routed through the diagnostic stream. The
/// audit trail is the durable record; these exist so operators can follow a
/// job live without touching the audit directory.
#[derive(Debug, Clone, Copy)]
pub struct SecurityEvent<'a> {
    pub level: Level,
    pub domain: SecurityDomain,
    pub severity: ThreatSeverity,
    pub kind: &'a str,
    pub locator: Option<&'a str>,
    pub message: &'a str,
}

impl<'a> SecurityEvent<'a> {
    pub fn emit(self) {
        match self.level {
            Level::TRACE => tracing::event!(
                Level::TRACE,
                security = true,
                domain = %self.domain,
                severity = ?self.severity,
                kind = self.kind,
                locator = self.locator,
                "{message}",
                message = self.message
            ),
            Level::DEBUG => tracing::event!(
                Level::DEBUG,
                security = true,
                domain = %self.domain,
                severity = ?self.severity,
                kind = self.kind,
                locator = self.locator,
                "{message}",
                message = self.message
            ),
            Level::INFO => tracing::event!(
                Level::INFO,
                security = true,
                domain = %self.domain,
                severity = ?self.severity,
                kind = self.kind,
                locator = self.locator,
                "{message}",
                message = self.message
            ),
            Level::WARN => tracing::event!(
                Level::WARN,
                security = true,
                domain = %self.domain,
                severity = ?self.severity,
                kind = self.kind,
                locator = self.locator,
                "{message}",
                message = self.message
            ),
            Level::ERROR => tracing::event!(
                Level::ERROR,
                security = true,
                domain = %self.domain,
                severity = ?self.severity,
                kind = self.kind,
                locator = self.locator,
                "{message}",
                message = self.message
            ),
        }
    }
}
