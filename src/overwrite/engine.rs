//! Verified-value substitution
//!
//! Generated text may only *propose* where a value goes; the value itself
//! always comes from a registered read-only source. Placeholders are
//! `{{key}}`, `${key}` or `[[key]]` with dotted keys, scanned left to right
//! in one pass. Each distinct placeholder is read at most once per call and
//! never retried.

use super::source::{Connector, DataSource};
use super::transform::Transform;
use crate::audit::{AuditChain, AuditEventType};
use crate::error::{GateError, Result};
use crate::types::ExecutionContext;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

const PLACEHOLDER_PATTERN: &str =
    r"\{\{(\w+(?:\.\w+)*)\}\}|\$\{(\w+(?:\.\w+)*)\}|\[\[(\w+(?:\.\w+)*)\]\]";

/// Maps one placeholder token to a verified read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverwriteRule {
    /// Literal token, e.g. `{{user.balance}}`
    pub placeholder: String,
    /// Name of a registered data source
    pub data_source: String,
    /// Read statement; `{request_id}`, `{session_id}`, `{user_id}` and
    /// metadata keys are substituted as sanitized literals
    pub query_template: String,
    /// Substituted when the read fails
    #[serde(default)]
    pub fallback_value: Option<String>,
    #[serde(default)]
    pub transform: Transform,
}

impl OverwriteRule {
    pub fn new(
        placeholder: impl Into<String>,
        data_source: impl Into<String>,
        query_template: impl Into<String>,
    ) -> Self {
        Self {
            placeholder: placeholder.into(),
            data_source: data_source.into(),
            query_template: query_template.into(),
            fallback_value: None,
            transform: Transform::Identity,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback_value = Some(fallback.into());
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

/// What to do with a placeholder that cannot be resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderPolicy {
    /// Fail the call with `Resolution`
    #[default]
    FailClosed,
    /// Leave the token in place and flag it
    FailOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Verified value substituted
    Resolved,
    /// Read failed; fallback substituted
    Degraded,
    /// Left as-is under the fail-open policy
    Unmatched,
}

/// Per-placeholder outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPlaceholder {
    pub placeholder: String,
    pub key: String,
    pub data_source: Option<String>,
    pub status: ResolutionStatus,
    /// Text substituted into the output, if any
    pub value: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverwriteStats {
    pub total: usize,
    pub resolved: usize,
    pub degraded: usize,
    pub unmatched: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverwriteOutcome {
    pub final_output: String,
    /// One entry per distinct placeholder, in order of first appearance
    pub resolved: Vec<ResolvedPlaceholder>,
    pub stats: OverwriteStats,
}

impl OverwriteOutcome {
    /// Whether any placeholder fell back or stayed unresolved
    pub fn is_degraded(&self) -> bool {
        self.stats.degraded > 0 || self.stats.unmatched > 0
    }
}

struct RegisteredSource {
    source: DataSource,
    connector: Arc<dyn Connector>,
}

/// Substitutes placeholders with values read from registered sources
pub struct OverwriteEngine {
    sources: RwLock<HashMap<String, RegisteredSource>>,
    rules: RwLock<HashMap<String, OverwriteRule>>,
    policy: PlaceholderPolicy,
    read_timeout: Duration,
    audit: Arc<AuditChain>,
    pattern: Regex,
}

impl OverwriteEngine {
    pub fn new(
        policy: PlaceholderPolicy,
        read_timeout: Duration,
        audit: Arc<AuditChain>,
    ) -> Result<Self> {
        let pattern = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|e| GateError::Configuration(format!("Invalid placeholder pattern: {}", e)))?;
        Ok(Self {
            sources: RwLock::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
            policy,
            read_timeout,
            audit,
            pattern,
        })
    }

    pub fn policy(&self) -> PlaceholderPolicy {
        self.policy
    }

    /// Register a source and the connector that reads it
    ///
    /// Writable sources and duplicate names are rejected.
    pub fn register_source(&self, source: DataSource, connector: Arc<dyn Connector>) -> Result<()> {
        source.ensure_read_only()?;
        let mut sources = self
            .sources
            .write()
            .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?;
        if sources.contains_key(&source.name) {
            return Err(GateError::Configuration(format!(
                "Data source '{}' already registered",
                source.name
            )));
        }
        tracing::info!(source = %source.name, kind = ?source.kind, "Data source registered");
        sources.insert(source.name.clone(), RegisteredSource { source, connector });
        Ok(())
    }

    /// Register a rule
    ///
    /// The placeholder must be exactly one well-formed token, its source
    /// must be registered, and no other rule may claim the same token.
    pub fn register_rule(&self, rule: OverwriteRule) -> Result<()> {
        let whole_token = self
            .pattern
            .find(&rule.placeholder)
            .is_some_and(|m| m.start() == 0 && m.end() == rule.placeholder.len());
        if !whole_token {
            return Err(GateError::Configuration(format!(
                "'{}' is not a single placeholder token",
                rule.placeholder
            )));
        }
        rule.transform
            .validate()
            .map_err(|reason| GateError::Configuration(format!("{}: {}", rule.placeholder, reason)))?;

        {
            let sources = self
                .sources
                .read()
                .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?;
            if !sources.contains_key(&rule.data_source) {
                return Err(GateError::Configuration(format!(
                    "Rule '{}' references unknown data source '{}'",
                    rule.placeholder, rule.data_source
                )));
            }
        }

        let mut rules = self
            .rules
            .write()
            .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?;
        if rules.contains_key(&rule.placeholder) {
            return Err(GateError::Configuration(format!(
                "Placeholder '{}' already has a rule",
                rule.placeholder
            )));
        }
        tracing::info!(
            placeholder = %rule.placeholder,
            source = %rule.data_source,
            transform = rule.transform.name(),
            "Overwrite rule registered"
        );
        rules.insert(rule.placeholder.clone(), rule);
        Ok(())
    }

    /// Registered rules, sorted by placeholder
    pub fn rules(&self) -> Vec<OverwriteRule> {
        let mut rules: Vec<OverwriteRule> = self
            .rules
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        rules.sort_by(|a, b| a.placeholder.cmp(&b.placeholder));
        rules
    }

    /// Placeholder tokens in `text`, in order of appearance
    pub fn placeholders<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.pattern.find_iter(text).map(|m| m.as_str()).collect()
    }

    /// Replace every placeholder in `template` using the read timeout as budget
    pub async fn overwrite(
        &self,
        template: &str,
        ctx: &ExecutionContext,
    ) -> Result<OverwriteOutcome> {
        self.overwrite_until(template, ctx, Instant::now() + self.read_timeout)
            .await
    }

    /// Replace every placeholder, bounding reads by `deadline`
    pub async fn overwrite_until(
        &self,
        template: &str,
        ctx: &ExecutionContext,
        deadline: Instant,
    ) -> Result<OverwriteOutcome> {
        let mut output = String::with_capacity(template.len());
        let mut resolved: Vec<ResolvedPlaceholder> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut last = 0;

        for caps in self.pattern.captures_iter(template) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let token = whole.as_str();
            let key = (1..=3)
                .find_map(|i| caps.get(i))
                .map(|m| m.as_str())
                .unwrap_or_default();

            output.push_str(&template[last..whole.start()]);
            last = whole.end();

            let index = match seen.get(token) {
                Some(&index) => index,
                None => {
                    let entry = match self.resolve(token, key, ctx, deadline).await {
                        Ok(entry) => entry,
                        Err(err) => {
                            self.record_failure(ctx, token, &err)?;
                            return Err(err);
                        }
                    };
                    resolved.push(entry);
                    seen.insert(token.to_string(), resolved.len() - 1);
                    resolved.len() - 1
                }
            };
            match &resolved[index].value {
                Some(value) => output.push_str(value),
                None => output.push_str(token),
            }
        }
        output.push_str(&template[last..]);

        let mut stats = OverwriteStats {
            total: resolved.len(),
            ..OverwriteStats::default()
        };
        for entry in &resolved {
            match entry.status {
                ResolutionStatus::Resolved => stats.resolved += 1,
                ResolutionStatus::Degraded => stats.degraded += 1,
                ResolutionStatus::Unmatched => stats.unmatched += 1,
            }
        }

        let outcome = OverwriteOutcome {
            final_output: output,
            resolved,
            stats,
        };
        self.record_outcome(ctx, &outcome)?;
        Ok(outcome)
    }

    async fn resolve(
        &self,
        token: &str,
        key: &str,
        ctx: &ExecutionContext,
        deadline: Instant,
    ) -> Result<ResolvedPlaceholder> {
        let rule = self
            .rules
            .read()
            .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?
            .get(token)
            .cloned();
        let Some(rule) = rule else {
            return self.unresolved(token, key, None, "no overwrite rule registered".into());
        };

        let (source, connector) = {
            let sources = self
                .sources
                .read()
                .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?;
            match sources.get(&rule.data_source) {
                Some(r) => (r.source.clone(), r.connector.clone()),
                None => {
                    return Err(GateError::Configuration(format!(
                        "Data source '{}' is not registered",
                        rule.data_source
                    )))
                }
            }
        };
        source.ensure_read_only()?;

        let (query, params) = render_query(&rule.query_template, ctx);
        let read = match tokio::time::timeout_at(
            deadline,
            connector.execute_readonly(&query, &params),
        )
        .await
        {
            Ok(Ok(value)) => value.into_value(),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("read timed out".to_string()),
        };
        let rendered = read.and_then(|raw| rule.transform.apply(&raw));

        match rendered {
            Ok(value) => Ok(ResolvedPlaceholder {
                placeholder: token.to_string(),
                key: key.to_string(),
                data_source: Some(rule.data_source),
                status: ResolutionStatus::Resolved,
                value: Some(value),
                error: None,
            }),
            Err(reason) => match rule.fallback_value {
                Some(fallback) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        placeholder = %token,
                        source = %rule.data_source,
                        error = %reason,
                        "Placeholder degraded to fallback"
                    );
                    Ok(ResolvedPlaceholder {
                        placeholder: token.to_string(),
                        key: key.to_string(),
                        data_source: Some(rule.data_source),
                        status: ResolutionStatus::Degraded,
                        value: Some(fallback),
                        error: Some(reason),
                    })
                }
                None => self.unresolved(token, key, Some(rule.data_source), reason),
            },
        }
    }

    /// Apply the placeholder policy to a token with no usable value
    fn unresolved(
        &self,
        token: &str,
        key: &str,
        data_source: Option<String>,
        reason: String,
    ) -> Result<ResolvedPlaceholder> {
        match self.policy {
            PlaceholderPolicy::FailClosed => Err(GateError::Resolution {
                placeholder: token.to_string(),
                reason,
            }),
            PlaceholderPolicy::FailOpen => {
                tracing::warn!(placeholder = %token, error = %reason, "Placeholder left unresolved");
                Ok(ResolvedPlaceholder {
                    placeholder: token.to_string(),
                    key: key.to_string(),
                    data_source,
                    status: ResolutionStatus::Unmatched,
                    value: None,
                    error: Some(reason),
                })
            }
        }
    }

    fn record_outcome(&self, ctx: &ExecutionContext, outcome: &OverwriteOutcome) -> Result<()> {
        let placeholders: Vec<serde_json::Value> = outcome
            .resolved
            .iter()
            .map(|r| {
                serde_json::json!({
                    "placeholder": r.placeholder,
                    "data_source": r.data_source,
                    "status": r.status,
                    "error": r.error,
                })
            })
            .collect();
        let mut payload = ctx.audit_fields();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("placeholders".into(), serde_json::json!(placeholders));
            obj.insert("stats".into(), serde_json::json!(outcome.stats));
        }
        self.audit.record(AuditEventType::DataOverwrite, payload)?;
        Ok(())
    }

    fn record_failure(&self, ctx: &ExecutionContext, token: &str, err: &GateError) -> Result<()> {
        tracing::error!(
            request_id = %ctx.request_id,
            placeholder = %token,
            error = %err,
            "Placeholder resolution failed"
        );
        let mut payload = ctx.audit_fields();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("placeholder".into(), serde_json::json!(token));
            obj.insert("error_kind".into(), serde_json::json!(err.kind()));
        }
        self.audit.record(AuditEventType::ResolutionFailed, payload)?;
        Ok(())
    }
}

impl std::fmt::Debug for OverwriteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverwriteEngine")
            .field("rules", &self.rules().len())
            .field("policy", &self.policy)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

/// Keep word characters, whitespace, `.` and `-`
fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '.' || *c == '-' || c.is_whitespace())
        .collect()
}

/// Literal form of a context value: numbers bare, text single-quoted
fn literal(value: &str) -> String {
    let clean = sanitize(value);
    if !clean.is_empty() && clean.parse::<f64>().is_ok_and(|n| n.is_finite()) {
        clean
    } else {
        format!("'{}'", clean)
    }
}

/// Fill `{name}` slots from the request; returns the query and its params
pub fn render_query(template: &str, ctx: &ExecutionContext) -> (String, BTreeMap<String, String>) {
    let mut values: BTreeMap<String, String> = ctx
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    values.insert("request_id".into(), ctx.request_id.clone());
    values.insert("session_id".into(), ctx.session_id.clone());
    if let Some(user) = &ctx.user_id {
        values.insert("user_id".into(), user.clone());
    }

    let mut query = template.to_string();
    let mut params = BTreeMap::new();
    for (key, value) in values {
        let slot = format!("{{{}}}", key);
        if query.contains(&slot) {
            query = query.replace(&slot, &literal(&value));
            params.insert(key, sanitize(&value));
        }
    }
    (query, params)
}
