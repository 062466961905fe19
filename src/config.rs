//! Gate configuration
//!
//! Every value is supplied here and handed to components at construction;
//! no component reads defaults of its own.
//!
//! ```toml
//! [mode]
//! local_threshold = 0.8
//! cloud_threshold = 0.3
//! always_confirm = ["credential", "identity"]
//!
//! [security]
//! fail_fast = true
//! fail_fast_severity = "high"
//! disabled_checks = ["SEC-020"]
//! request_timeout_ms = 30000
//! tool_whitelist = ["search"]
//!
//! [overwrite]
//! placeholder_policy = "fail_closed"
//! ```

use crate::error::{GateError, Result};
use crate::mode::ModeThresholds;
use crate::overwrite::PlaceholderPolicy;
use crate::security::{PipelineConfig, Severity};
use crate::sensitivity::{MaxWeight, ProbabilisticOr, ScoreCombiner, SensitivityRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub overwrite: OverwriteConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sensitivity: SensitivityConfig,
}

/// Mode selection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Scores at or above route LOCAL_ONLY (default: 0.8)
    #[serde(default = "default_local_threshold")]
    pub local_threshold: f64,

    /// Scores at or below route CLOUD_SANDBOX (default: 0.3)
    #[serde(default = "default_cloud_threshold")]
    pub cloud_threshold: f64,

    /// Categories that require confirmation when routed locally
    #[serde(default = "default_always_confirm")]
    pub always_confirm: BTreeSet<String>,
}

fn default_local_threshold() -> f64 {
    0.8
}

fn default_cloud_threshold() -> f64 {
    0.3
}

fn default_always_confirm() -> BTreeSet<String> {
    ["credential", "identity"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            local_threshold: default_local_threshold(),
            cloud_threshold: default_cloud_threshold(),
            always_confirm: default_always_confirm(),
        }
    }
}

impl ModeConfig {
    pub fn thresholds(&self) -> Result<ModeThresholds> {
        ModeThresholds::new(self.local_threshold, self.cloud_threshold)
    }
}

/// Security pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// Failures at or above refuse the request (default: high)
    #[serde(default = "default_fail_fast_severity")]
    pub fail_fast_severity: Severity,

    /// Check ids to skip
    #[serde(default)]
    pub disabled_checks: BTreeSet<String>,

    /// Budget shared by checks, executor and data-source reads
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Tools SEC-040 allows
    #[serde(default)]
    pub tool_whitelist: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_fail_fast_severity() -> Severity {
    Severity::High
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            fail_fast_severity: default_fail_fast_severity(),
            disabled_checks: BTreeSet::new(),
            request_timeout_ms: default_request_timeout_ms(),
            tool_whitelist: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            fail_fast: self.fail_fast,
            fail_fast_severity: self.fail_fast_severity,
            disabled_checks: self.disabled_checks.clone(),
            request_timeout: self.request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverwriteConfig {
    #[serde(default)]
    pub placeholder_policy: PlaceholderPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Retry a failed HYBRID execution once in LOCAL_ONLY
    #[serde(default = "default_true")]
    pub hybrid_degrade_to_local: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            hybrid_degrade_to_local: true,
        }
    }
}

/// How matched rule weights are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinerKind {
    #[default]
    ProbabilisticOr,
    MaxWeight,
}

impl CombinerKind {
    pub fn build(&self) -> Box<dyn ScoreCombiner> {
        match self {
            Self::ProbabilisticOr => Box::new(ProbabilisticOr),
            Self::MaxWeight => Box::new(MaxWeight),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityConfig {
    /// Load the built-in multilingual rule table
    #[serde(default = "default_true")]
    pub use_default_rules: bool,

    #[serde(default)]
    pub combiner: CombinerKind,

    /// Extra rules appended after the defaults
    #[serde(default)]
    pub rules: Vec<SensitivityRule>,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            use_default_rules: true,
            combiner: CombinerKind::default(),
            rules: Vec::new(),
        }
    }
}

impl GateConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults if the file does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            GateError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| GateError::Configuration(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.mode.thresholds()?;
        if self.security.request_timeout_ms == 0 {
            return Err(GateError::Configuration(
                "request_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
