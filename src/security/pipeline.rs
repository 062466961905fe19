//! Phase-ordered, fail-fast check execution

use super::check::{CheckContext, CheckResult, Phase, SecurityCheck, Severity};
use crate::audit::{AuditChain, AuditEventType};
use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Pipeline behavior, supplied at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stop at the first failure at or above `fail_fast_severity`
    pub fail_fast: bool,
    /// Failures at or above this severity refuse the request
    pub fail_fast_severity: Severity,
    /// Check ids that are registered but skipped
    pub disabled_checks: BTreeSet<String>,
    /// Time budget for one `run_all` call
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            fail_fast_severity: Severity::High,
            disabled_checks: BTreeSet::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-phase tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Everything the pipeline executed for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    /// Executed checks in execution order, the fail-fast trigger included
    pub results: Vec<CheckResult>,
    /// Highest severity among failed results; `None` when nothing failed
    pub risk_level: Option<Severity>,
    pub fail_fast_triggered: bool,
    /// Whether a failure reached the refusal threshold
    pub refused: bool,
    pub phase_summary: BTreeMap<Phase, PhaseSummary>,
}

impl SecurityReport {
    fn from_results(results: Vec<CheckResult>, threshold: Severity, fail_fast_triggered: bool) -> Self {
        let risk_level = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.severity)
            .max();
        let refused = risk_level.is_some_and(|level| level >= threshold);

        let mut phase_summary: BTreeMap<Phase, PhaseSummary> = BTreeMap::new();
        for result in &results {
            let summary = phase_summary.entry(result.phase).or_default();
            summary.total += 1;
            if result.passed {
                summary.passed += 1;
            } else {
                summary.failed += 1;
            }
        }

        Self {
            results,
            risk_level,
            fail_fast_triggered,
            refused,
            phase_summary,
        }
    }

    /// No executed check failed
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn failed_check_ids(&self) -> Vec<String> {
        self.failed().map(|r| r.check_id.clone()).collect()
    }

    /// Risk level as text, `none` when nothing failed
    pub fn risk_label(&self) -> &'static str {
        self.risk_level.map(|s| s.as_str()).unwrap_or("none")
    }

    /// Whether a check with this id ran
    pub fn executed(&self, check_id: &str) -> bool {
        self.results.iter().any(|r| r.check_id == check_id)
    }

    /// Plain-text rendering for operators
    pub fn render_text(&self) -> String {
        let rule = "=".repeat(50);
        let mut lines = vec![
            rule.clone(),
            "Security report".to_string(),
            rule.clone(),
            format!(
                "Result: {}",
                if self.passed() { "PASSED" } else { "FAILED" }
            ),
            format!("Risk level: {}", self.risk_label()),
        ];
        if self.fail_fast_triggered {
            lines.push("Fail-fast triggered".to_string());
        }
        for phase in Phase::ALL {
            let Some(summary) = self.phase_summary.get(&phase) else {
                continue;
            };
            lines.push(String::new());
            lines.push(format!(
                "[{}] {}/{} passed",
                phase, summary.passed, summary.total
            ));
            for result in self.results.iter().filter(|r| r.phase == phase) {
                let mark = if result.passed { "ok" } else { "FAIL" };
                lines.push(format!(
                    "  {} {} ({}): {}",
                    mark, result.check_id, result.severity, result.message
                ));
                if let (false, Some(remediation)) = (result.passed, &result.remediation) {
                    lines.push(format!("     fix: {}", remediation));
                }
            }
        }
        lines.push(rule);
        lines.join("\n")
    }

    /// Summary copied into the audit chain: ids and verdicts, no messages
    pub fn audit_payload(&self) -> serde_json::Value {
        let checks: Vec<serde_json::Value> = self
            .results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "check_id": r.check_id,
                    "phase": r.phase,
                    "passed": r.passed,
                    "severity": r.severity,
                })
            })
            .collect();
        serde_json::json!({
            "passed": self.passed(),
            "refused": self.refused,
            "risk_level": self.risk_label(),
            "fail_fast_triggered": self.fail_fast_triggered,
            "checks": checks,
        })
    }
}

/// Collects checks before the registry is frozen
pub struct SecurityPipelineBuilder {
    config: PipelineConfig,
    checks: Vec<Arc<dyn SecurityCheck>>,
}

impl SecurityPipelineBuilder {
    pub fn register(mut self, check: Arc<dyn SecurityCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn register_all(mut self, checks: impl IntoIterator<Item = Arc<dyn SecurityCheck>>) -> Self {
        self.checks.extend(checks);
        self
    }

    /// Freeze the registry
    ///
    /// Fails with `Configuration` on duplicate check ids.
    pub fn build(self, audit: Arc<AuditChain>) -> Result<SecurityPipeline> {
        let mut seen = HashSet::new();
        let mut registry: BTreeMap<Phase, Vec<Arc<dyn SecurityCheck>>> = BTreeMap::new();

        for check in self.checks {
            if !seen.insert(check.check_id().to_string()) {
                return Err(GateError::Configuration(format!(
                    "Duplicate security check id: {}",
                    check.check_id()
                )));
            }
            tracing::info!(
                check_id = check.check_id(),
                name = check.name(),
                phase = %check.phase(),
                severity = %check.severity(),
                enabled = !self.config.disabled_checks.contains(check.check_id()),
                "Security check registered"
            );
            registry.entry(check.phase()).or_default().push(check);
        }

        for id in &self.config.disabled_checks {
            if !seen.contains(id) {
                tracing::warn!(check_id = %id, "Disabled check id is not registered");
            }
        }

        Ok(SecurityPipeline {
            registry,
            config: self.config,
            audit,
        })
    }
}

/// Runs registered checks phase by phase
pub struct SecurityPipeline {
    registry: BTreeMap<Phase, Vec<Arc<dyn SecurityCheck>>>,
    config: PipelineConfig,
    audit: Arc<AuditChain>,
}

impl SecurityPipeline {
    pub fn builder(config: PipelineConfig) -> SecurityPipelineBuilder {
        SecurityPipelineBuilder {
            config,
            checks: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Registered checks in execution order as `(id, phase, severity)`
    pub fn checks(&self) -> Vec<(String, Phase, Severity)> {
        self.registry
            .values()
            .flatten()
            .map(|c| (c.check_id().to_string(), c.phase(), c.severity()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every enabled check within the configured time budget
    pub async fn run_all(&self, ctx: &CheckContext<'_>) -> Result<SecurityReport> {
        self.run_until(ctx, Instant::now() + self.config.request_timeout)
            .await
    }

    /// Run every enabled check against an externally owned deadline
    ///
    /// A check still running at the deadline is recorded as a HIGH failure
    /// and counts toward fail-fast like any other failure. The report is
    /// appended to the audit chain before it is returned.
    pub async fn run_until(
        &self,
        ctx: &CheckContext<'_>,
        deadline: Instant,
    ) -> Result<SecurityReport> {
        let mut results = Vec::new();
        let mut fail_fast_triggered = false;

        'phases: for phase in Phase::ALL {
            let Some(checks) = self.registry.get(&phase) else {
                continue;
            };
            for check in checks {
                if self.config.disabled_checks.contains(check.check_id()) {
                    continue;
                }

                let result = match tokio::time::timeout_at(deadline, check.check(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            request_id = %ctx.request.request_id,
                            check_id = check.check_id(),
                            "Security check timed out"
                        );
                        let mut result = CheckResult::fail(&**check, "check timed out");
                        result.severity = Severity::High;
                        result
                    }
                };

                let aborts = self.config.fail_fast
                    && !result.passed
                    && result.severity >= self.config.fail_fast_severity;
                if !result.passed {
                    tracing::warn!(
                        request_id = %ctx.request.request_id,
                        check_id = %result.check_id,
                        phase = %phase,
                        severity = %result.severity,
                        "Security check failed"
                    );
                }
                results.push(result);

                if aborts {
                    tracing::warn!(
                        request_id = %ctx.request.request_id,
                        check_id = check.check_id(),
                        phase = %phase,
                        "Fail-fast: skipping remaining checks"
                    );
                    fail_fast_triggered = true;
                    break 'phases;
                }
            }
        }

        let report = SecurityReport::from_results(
            results,
            self.config.fail_fast_severity,
            fail_fast_triggered,
        );

        let mut payload = ctx.request.audit_fields();
        if let (Some(obj), serde_json::Value::Object(extra)) =
            (payload.as_object_mut(), report.audit_payload())
        {
            obj.extend(extra);
        }
        self.audit.record(AuditEventType::SecurityCheck, payload)?;

        Ok(report)
    }
}

impl std::fmt::Debug for SecurityPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPipeline")
            .field("checks", &self.checks())
            .field("config", &self.config)
            .finish()
    }
}
