//! Built-in checks
//!
//! | id      | check                 | phase     | severity |
//! |---------|-----------------------|-----------|----------|
//! | SEC-001 | authentication        | entry     | critical |
//! | SEC-002 | authorization         | entry     | critical |
//! | SEC-010 | prompt injection      | content   | high     |
//! | SEC-020 | PII detection         | content   | medium   |
//! | SEC-040 | tool whitelist        | behavior  | critical |
//! | SEC-041 | dangerous tool code   | behavior  | critical |
//! | SEC-030 | SQL injection         | execution | critical |
//! | SEC-031 | SQL read-only         | execution | critical |
//!
//! Checks read request metadata keys `auth_token`, `tool_name`, `tool_code`
//! and `sql`. A check whose input is absent passes.

use super::check::{CheckContext, CheckResult, Phase, SecurityCheck, Severity};
use crate::error::{GateError, Result};
use crate::overwrite::{is_read_only_statement, write_keyword};
use crate::sensitivity::normalize;
use crate::types::ExecutionMode;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const INJECTION_PATTERNS: &[(&str, &str)] = &[
    (
        "ignore_previous_instructions",
        r"ignore\s+(?:all\s+)?(?:previous|prior|above)\s+instructions",
    ),
    ("disregard_above", r"disregard\s+(?:all\s+)?(?:above|previous)"),
    ("system_role_override", r"system:\s*you\s+are"),
    ("system_tag", r"\[system\]"),
    ("forged_system_marker", r"<<\s*(?:system|admin|root)\s*>>"),
    ("forged_delimiter", r"###\s*(?:instruction|system)"),
    ("forget_instructions", r"forget\s+(?:everything|all)"),
    ("role_switch", r"you\s+are\s+now"),
    (
        "ignore_previous_instructions_zh",
        r"忽略(?:之前|先前|以上|上面)(?:的|所有)*(?:指令|指示|規則|规则)",
    ),
];

const PII_PATTERNS: &[(&str, &str)] = &[
    ("email", r"[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}"),
    ("phone", r"(?:\+?86)?1[3-9]\d{9}"),
    ("national_id", r"\d{17}[\dx]"),
    ("credit_card", r"(?:\d{4}[-\s]?){3}\d{4}"),
];

const DANGEROUS_CODE_PATTERNS: &[(&str, &str)] = &[
    ("eval", r"(?i)\beval\s*\("),
    ("exec", r"(?i)\bexec\s*\("),
    ("os_system", r"(?i)\bos\.system\s*\("),
    ("subprocess", r"(?i)\bsubprocess\."),
    ("recursive_delete", r"(?i)\brm\s+-rf\s+/"),
    ("raw_disk_write", r"(?i)\bdd\s+if=.+of=/dev"),
    ("network_transfer", r"(?i)\b(?:curl|wget|nc|netcat|ncat|scp)\s"),
];

const SQL_INJECTION_PATTERNS: &[(&str, &str)] = &[
    ("comment_terminator", r"(?im)--\s*$"),
    ("stacked_query", r"(?i);\s*(?:drop|delete|update|insert)"),
    ("tautology", r#"(?i)'\s*(?:or|and)\s*['"]?\s*\d*\s*=\s*\d*"#),
    ("union_select", r"(?i)union\s+(?:all\s+)?select"),
    ("exec_call", r"(?i)exec\s*\("),
    ("inline_comment", r"/\*!?\s*\*/"),
];

struct PatternTable {
    patterns: Vec<(&'static str, Regex)>,
}

impl PatternTable {
    fn compile(check_id: &str, table: &[(&'static str, &'static str)]) -> Result<Self> {
        let patterns = table
            .iter()
            .map(|(label, pattern)| {
                Regex::new(pattern).map(|re| (*label, re)).map_err(|e| {
                    GateError::Configuration(format!(
                        "{}: invalid pattern '{}': {}",
                        check_id, label, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Labels of every pattern found in `text`
    fn matches(&self, text: &str) -> Vec<&'static str> {
        self.patterns
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(label, _)| *label)
            .collect()
    }

    fn counts(&self, text: &str) -> BTreeMap<&'static str, usize> {
        self.patterns
            .iter()
            .map(|(label, re)| (*label, re.find_iter(text).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

// ─── Entry ───

/// SEC-001: the caller is identified and presents a token
#[derive(Debug, Default)]
pub struct AuthenticationCheck;

#[async_trait]
impl SecurityCheck for AuthenticationCheck {
    fn check_id(&self) -> &str {
        "SEC-001"
    }
    fn name(&self) -> &str {
        "authentication"
    }
    fn phase(&self) -> Phase {
        Phase::Entry
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(user) = ctx.request.user_id.as_deref() else {
            return CheckResult::fail(self, "missing user identity")
                .with_remediation("provide an authenticated user id");
        };
        match ctx.request.meta("auth_token") {
            Some(token) if !token.trim().is_empty() => {
                CheckResult::pass(self, format!("user {} authenticated", user))
            }
            _ => CheckResult::fail(self, "missing authentication token")
                .with_remediation("provide a valid auth_token"),
        }
    }
}

/// Permissions a mode requires
///
/// Every request needs `ai:use`; local execution adds `ai:local`, cloud
/// execution `ai:cloud`, and hybrid (cloud plans, local executes) both.
pub fn required_permissions(mode: Option<ExecutionMode>) -> BTreeSet<&'static str> {
    let mut required = BTreeSet::from(["ai:use"]);
    match mode {
        Some(ExecutionMode::LocalOnly) => {
            required.insert("ai:local");
        }
        Some(ExecutionMode::CloudSandbox) => {
            required.insert("ai:cloud");
        }
        Some(ExecutionMode::Hybrid) => {
            required.insert("ai:local");
            required.insert("ai:cloud");
        }
        None => {}
    }
    required
}

/// SEC-002: the caller holds every permission the selected mode requires
#[derive(Debug, Default)]
pub struct AuthorizationCheck;

#[async_trait]
impl SecurityCheck for AuthorizationCheck {
    fn check_id(&self) -> &str {
        "SEC-002"
    }
    fn name(&self) -> &str {
        "authorization"
    }
    fn phase(&self) -> Phase {
        Phase::Entry
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let granted = &ctx.request.granted_permissions;
        let missing: Vec<&str> = required_permissions(ctx.mode)
            .into_iter()
            .filter(|p| !granted.contains(*p))
            .collect();

        if missing.is_empty() {
            CheckResult::pass(
                self,
                format!("permissions granted ({})", granted.len()),
            )
        } else {
            CheckResult::fail(self, format!("missing permissions: {}", missing.join(", ")))
                .with_detail("missing", json!(missing))
                .with_remediation(format!("request permissions: {}", missing.join(", ")))
        }
    }
}

// ─── Content ───

/// SEC-010: instruction-override attempts in the input
pub struct PromptInjectionCheck {
    table: PatternTable,
}

impl PromptInjectionCheck {
    pub fn new() -> Result<Self> {
        Ok(Self {
            table: PatternTable::compile("SEC-010", INJECTION_PATTERNS)?,
        })
    }
}

#[async_trait]
impl SecurityCheck for PromptInjectionCheck {
    fn check_id(&self) -> &str {
        "SEC-010"
    }
    fn name(&self) -> &str {
        "prompt injection"
    }
    fn phase(&self) -> Phase {
        Phase::Content
    }
    fn severity(&self) -> Severity {
        Severity::High
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let found = self.table.matches(&normalize(&ctx.request.input_content));
        if found.is_empty() {
            CheckResult::pass(self, "no injection patterns")
        } else {
            CheckResult::fail(
                self,
                format!("prompt injection pattern detected: {}", found.join(", ")),
            )
            .with_detail("patterns", json!(found))
            .with_remediation("rephrase the request without instruction overrides")
        }
    }
}

/// SEC-020: reports personal data kinds found in the input
///
/// Informational: always passes, the counts go to the report details.
pub struct PiiDetectionCheck {
    table: PatternTable,
}

impl PiiDetectionCheck {
    pub fn new() -> Result<Self> {
        Ok(Self {
            table: PatternTable::compile("SEC-020", PII_PATTERNS)?,
        })
    }
}

#[async_trait]
impl SecurityCheck for PiiDetectionCheck {
    fn check_id(&self) -> &str {
        "SEC-020"
    }
    fn name(&self) -> &str {
        "pii detection"
    }
    fn phase(&self) -> Phase {
        Phase::Content
    }
    fn severity(&self) -> Severity {
        Severity::Medium
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let counts = self.table.counts(&normalize(&ctx.request.input_content));
        if counts.is_empty() {
            return CheckResult::pass(self, "no personal data detected");
        }
        let kinds: Vec<&str> = counts.keys().copied().collect();
        CheckResult::pass(self, format!("personal data detected: {}", kinds.join(", ")))
            .with_detail("detected", json!(counts))
    }
}

// ─── Behavior ───

/// SEC-040: a requested tool must be whitelisted
pub struct ToolWhitelistCheck {
    whitelist: BTreeSet<String>,
}

impl ToolWhitelistCheck {
    pub fn new(whitelist: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SecurityCheck for ToolWhitelistCheck {
    fn check_id(&self) -> &str {
        "SEC-040"
    }
    fn name(&self) -> &str {
        "tool whitelist"
    }
    fn phase(&self) -> Phase {
        Phase::Behavior
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(tool) = ctx.request.meta("tool_name") else {
            return CheckResult::pass(self, "no tool requested");
        };
        if self.whitelist.is_empty() {
            return CheckResult::fail(self, "no tool whitelist configured")
                .with_remediation("configure security.tool_whitelist");
        }
        if self.whitelist.contains(tool) {
            CheckResult::pass(self, format!("tool '{}' authorized", tool))
        } else {
            CheckResult::fail(self, format!("tool '{}' is not whitelisted", tool))
                .with_detail("tool", json!(tool))
                .with_remediation(format!(
                    "use one of: {}",
                    self.whitelist.iter().cloned().collect::<Vec<_>>().join(", ")
                ))
        }
    }
}

/// SEC-041: tool code must not spawn processes, delete trees or exfiltrate
pub struct DangerousToolCheck {
    table: PatternTable,
}

impl DangerousToolCheck {
    pub fn new() -> Result<Self> {
        Ok(Self {
            table: PatternTable::compile("SEC-041", DANGEROUS_CODE_PATTERNS)?,
        })
    }
}

#[async_trait]
impl SecurityCheck for DangerousToolCheck {
    fn check_id(&self) -> &str {
        "SEC-041"
    }
    fn name(&self) -> &str {
        "dangerous tool code"
    }
    fn phase(&self) -> Phase {
        Phase::Behavior
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(code) = ctx.request.meta("tool_code") else {
            return CheckResult::pass(self, "no tool code");
        };
        let found = self.table.matches(code);
        if found.is_empty() {
            CheckResult::pass(self, "tool code clean")
        } else {
            CheckResult::fail(self, format!("dangerous operation: {}", found.join(", ")))
                .with_detail("operations", json!(found))
                .with_remediation("remove process, filesystem and network primitives")
        }
    }
}

// ─── Execution ───

/// SEC-030: classic SQL injection shapes in the statement to run
pub struct SqlInjectionCheck {
    table: PatternTable,
}

impl SqlInjectionCheck {
    pub fn new() -> Result<Self> {
        Ok(Self {
            table: PatternTable::compile("SEC-030", SQL_INJECTION_PATTERNS)?,
        })
    }
}

#[async_trait]
impl SecurityCheck for SqlInjectionCheck {
    fn check_id(&self) -> &str {
        "SEC-030"
    }
    fn name(&self) -> &str {
        "sql injection"
    }
    fn phase(&self) -> Phase {
        Phase::Execution
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(sql) = ctx.request.meta("sql") else {
            return CheckResult::pass(self, "no sql statement");
        };
        let found = self.table.matches(sql);
        if found.is_empty() {
            CheckResult::pass(self, "sql statement clean")
        } else {
            CheckResult::fail(self, format!("sql injection pattern: {}", found.join(", ")))
                .with_detail("patterns", json!(found))
                .with_remediation("use parameterized queries")
        }
    }
}

/// SEC-031: the statement to run must be a single read
#[derive(Debug, Default)]
pub struct SqlReadOnlyCheck;

#[async_trait]
impl SecurityCheck for SqlReadOnlyCheck {
    fn check_id(&self) -> &str {
        "SEC-031"
    }
    fn name(&self) -> &str {
        "sql read-only"
    }
    fn phase(&self) -> Phase {
        Phase::Execution
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(sql) = ctx.request.meta("sql") else {
            return CheckResult::pass(self, "no sql statement");
        };
        if is_read_only_statement(sql) {
            return CheckResult::pass(self, "read-only statement");
        }
        let result = CheckResult::fail(self, "statement is not a single read")
            .with_remediation("only SELECT queries are allowed");
        match write_keyword(sql) {
            Some(keyword) => result.with_detail("keyword", json!(keyword)),
            None => result,
        }
    }
}

/// All eight built-in checks, in registration order
pub fn default_checks(
    tool_whitelist: impl IntoIterator<Item = impl Into<String>>,
) -> Result<Vec<Arc<dyn SecurityCheck>>> {
    Ok(vec![
        Arc::new(AuthenticationCheck),
        Arc::new(AuthorizationCheck),
        Arc::new(PromptInjectionCheck::new()?),
        Arc::new(PiiDetectionCheck::new()?),
        Arc::new(ToolWhitelistCheck::new(tool_whitelist)),
        Arc::new(DangerousToolCheck::new()?),
        Arc::new(SqlInjectionCheck::new()?),
        Arc::new(SqlReadOnlyCheck),
    ])
}
