//! The security check capability and its result types

use crate::types::{ExecutionContext, ExecutionMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pipeline phase; phases always run in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Identity and permissions
    Entry,
    /// Input content
    Content,
    /// Requested tools and behavior
    Behavior,
    /// Concrete operations about to run
    Execution,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Entry,
        Phase::Content,
        Phase::Behavior,
        Phase::Execution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Content => "content",
            Self::Behavior => "behavior",
            Self::Execution => "execution",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check severity, ordered `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub phase: Phase,
    pub passed: bool,
    /// Short description; never echoes request content
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl CheckResult {
    /// A passing result for `check`
    pub fn pass(check: &(impl SecurityCheck + ?Sized), message: impl Into<String>) -> Self {
        Self {
            check_id: check.check_id().to_string(),
            phase: check.phase(),
            passed: true,
            message: message.into(),
            severity: check.severity(),
            remediation: None,
            details: BTreeMap::new(),
        }
    }

    /// A failing result for `check`
    pub fn fail(check: &(impl SecurityCheck + ?Sized), message: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(check, message)
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// What a check may read
///
/// Checks receive shared references only and cannot mutate the request.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub request: &'a ExecutionContext,
    /// Mode selected for the request, when already decided
    pub mode: Option<ExecutionMode>,
}

impl<'a> CheckContext<'a> {
    pub fn new(request: &'a ExecutionContext, mode: Option<ExecutionMode>) -> Self {
        Self { request, mode }
    }
}

/// A pluggable, side-effect-free security check
///
/// Anything implementing this trait can be registered with the pipeline;
/// the pipeline only relies on the id, phase and severity.
#[async_trait]
pub trait SecurityCheck: Send + Sync {
    /// Stable identifier, e.g. `SEC-010`
    fn check_id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str;

    fn phase(&self) -> Phase;

    fn severity(&self) -> Severity;

    /// Evaluate the request
    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubCheck;

    #[async_trait]
    impl SecurityCheck for StubCheck {
        fn check_id(&self) -> &str {
            "T-001"
        }
        fn name(&self) -> &str {
            "stub"
        }
        fn phase(&self) -> Phase {
            Phase::Behavior
        }
        fn severity(&self) -> Severity {
            Severity::Medium
        }
        async fn check(&self, _ctx: &CheckContext<'_>) -> CheckResult {
            CheckResult::pass(self, "ok")
        }
    }

    #[test]
    fn test_orderings() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Phase::ALL.iter().max(), Some(&Phase::Execution));
        assert!(Phase::Entry < Phase::Content);
    }

    #[test]
    fn test_result_builders() {
        let fail = CheckResult::fail(&StubCheck, "bad")
            .with_remediation("fix it")
            .with_detail("count", serde_json::json!(2));
        assert!(!fail.passed);
        assert_eq!(fail.check_id, "T-001");
        assert_eq!(fail.phase, Phase::Behavior);
        assert_eq!(fail.severity, Severity::Medium);
        assert_eq!(fail.remediation.as_deref(), Some("fix it"));
        assert_eq!(fail.details["count"], 2);
    }

    #[tokio::test]
    async fn test_check_through_trait_object() {
        let check: Box<dyn SecurityCheck> = Box::new(StubCheck);
        let request = ExecutionContext::new("s", "hello");
        let result = check.check(&CheckContext::new(&request, None)).await;
        assert!(result.passed);
        assert_eq!(serde_json::to_value(result.phase).unwrap(), "behavior");
    }
}
