//! Core request types shared by every stage of the gate
//!
//! All types use snake_case JSON serialization so they can be copied into
//! audit payloads verbatim.

use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Where and how a request is fulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fully local execution, nothing leaves the host
    LocalOnly,
    /// Cloud plans, local executes
    Hybrid,
    /// Lightweight sandboxed cloud execution
    CloudSandbox,
}

impl ExecutionMode {
    /// Stable string form used in logs and audit payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::Hybrid => "hybrid",
            Self::CloudSandbox => "cloud_sandbox",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request context
///
/// Created for one request, read (never mutated) by every stage, and
/// dropped once the response is produced. Only identifiers and derived
/// values are copied into audit payloads; `input_content` is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique request identifier (req-<uuid> when generated)
    pub request_id: String,

    /// Conversation/session identifier
    pub session_id: String,

    /// Authenticated user, if any
    #[serde(default)]
    pub user_id: Option<String>,

    /// Raw user input to classify and check
    pub input_content: String,

    /// Permissions granted to the caller (e.g. `ai:use`, `ai:cloud`)
    #[serde(default)]
    pub granted_permissions: BTreeSet<String>,

    /// Free-form request metadata (auth token, tool name, sql, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl ExecutionContext {
    /// Create a context with a generated request id and the current time
    pub fn new(session_id: impl Into<String>, input_content: impl Into<String>) -> Self {
        Self {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            user_id: None,
            input_content: input_content.into(),
            granted_permissions: BTreeSet::new(),
            metadata: HashMap::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Override the generated request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the user id
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Grant a permission
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.granted_permissions.insert(permission.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata value
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Reject malformed contexts before they enter the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.request_id.trim().is_empty() {
            return Err(GateError::Validation("request_id must not be empty".into()));
        }
        if self.session_id.trim().is_empty() {
            return Err(GateError::Validation("session_id must not be empty".into()));
        }
        if let Some(user) = &self.user_id {
            if user.trim().is_empty() {
                return Err(GateError::Validation(
                    "user_id must not be blank when present".into(),
                ));
            }
        }
        if self.created_at <= 0 {
            return Err(GateError::Validation(format!(
                "created_at must be a positive unix timestamp, got {}",
                self.created_at
            )));
        }
        Ok(())
    }

    /// Identifier fields copied into audit payloads
    pub fn audit_fields(&self) -> serde_json::Value {
        serde_json::json!({
            "request_id": self.request_id,
            "session_id": self.session_id,
            "user_id": self.user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_display_and_serde() {
        assert_eq!(ExecutionMode::LocalOnly.to_string(), "local_only");
        let json = serde_json::to_string(&ExecutionMode::CloudSandbox).unwrap();
        assert_eq!(json, "\"cloud_sandbox\"");
        let parsed: ExecutionMode = serde_json::from_str("\"hybrid\"").unwrap();
        assert_eq!(parsed, ExecutionMode::Hybrid);
    }

    #[test]
    fn test_context_builder() {
        let ctx = ExecutionContext::new("sess-1", "hello")
            .with_user("alice")
            .with_permission("ai:use")
            .with_metadata("auth_token", "t");

        assert!(ctx.request_id.starts_with("req-"));
        assert_eq!(ctx.user_id.as_deref(), Some("alice"));
        assert!(ctx.granted_permissions.contains("ai:use"));
        assert_eq!(ctx.meta("auth_token"), Some("t"));
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let ctx = ExecutionContext::new("", "hi");
        assert!(matches!(ctx.validate(), Err(GateError::Validation(_))));

        let ctx = ExecutionContext::new("s", "hi").with_request_id("  ");
        assert!(matches!(ctx.validate(), Err(GateError::Validation(_))));

        let ctx = ExecutionContext::new("s", "hi").with_user("");
        assert!(ctx.validate().is_err());

        let mut ctx = ExecutionContext::new("s", "hi");
        ctx.created_at = 0;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_audit_fields_exclude_content() {
        let ctx = ExecutionContext::new("sess", "my secret password").with_user("u");
        let fields = ctx.audit_fields();
        assert_eq!(fields["session_id"], "sess");
        assert!(!fields.to_string().contains("password"));
    }
}
