//! Error types for a3s-gate

use crate::security::SecurityReport;
use crate::types::ExecutionMode;
use thiserror::Error;

/// Errors that can occur while gating a request
#[derive(Debug, Error)]
pub enum GateError {
    /// Malformed execution context, rejected before the pipeline runs
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid construction-time configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A check failed at or above the fail-fast severity threshold
    ///
    /// Only check ids and the risk level are rendered; the offending
    /// content never appears in the message.
    #[error("Request refused by security check(s) [{}] (risk: {})", .report.failed_check_ids().join(", "), .report.risk_label())]
    SecurityViolation { report: Box<SecurityReport> },

    /// The executor registered for a mode failed
    #[error("Execution failed in {mode} mode: {reason}")]
    Execution { mode: ExecutionMode, reason: String },

    /// A placeholder could not be resolved to a verified value
    #[error("Failed to resolve placeholder '{placeholder}': {reason}")]
    Resolution { placeholder: String, reason: String },

    /// The audit chain failed verification
    #[error("Audit chain integrity violated at entry {first_invalid_index}")]
    AuditIntegrity { first_invalid_index: usize },

    /// The per-request time budget was exhausted
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The request was cancelled by the caller
    #[error("Request cancelled during {stage}")]
    Cancelled { stage: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (poisoned locks, closed channels)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Stable snake_case tag recorded in audit payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::SecurityViolation { .. } => "security_violation",
            Self::Execution { .. } => "execution",
            Self::Resolution { .. } => "resolution",
            Self::AuditIntegrity { .. } => "audit_integrity",
            Self::Timeout(_) => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Serialization(_) => "serialization",
            Self::ConfigParse(_) => "config_parse",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias for gate operations
pub type Result<T> = std::result::Result<T, GateError>;
