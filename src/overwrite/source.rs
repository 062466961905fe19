//! Verified-value sources and the read-only connector contract

use crate::error::{GateError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

/// Statement keywords that modify data or schema
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "MERGE", "REPLACE",
];

/// First write keyword appearing as a whole word in `sql`, if any
pub fn write_keyword(sql: &str) -> Option<&'static str> {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .find_map(|word| {
            let upper = word.to_ascii_uppercase();
            WRITE_KEYWORDS.iter().copied().find(|k| *k == upper)
        })
}

/// Whether `sql` is a single `SELECT` (or `WITH ... SELECT`) statement
pub fn is_read_only_statement(sql: &str) -> bool {
    let statement = sql.trim().trim_end_matches(';').trim();
    let first = statement
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    matches!(first.as_str(), "SELECT" | "WITH")
        && !statement.contains(';')
        && write_keyword(statement).is_none()
}

/// How a source is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Query,
    Api,
    File,
}

/// A named, read-only source of verified values
///
/// The connection itself is owned by the caller; the engine only holds the
/// connector handle registered alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub kind: SourceKind,
    /// Must be true; registration rejects writable sources
    pub read_only: bool,
}

impl DataSource {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            read_only: true,
        }
    }

    pub(crate) fn ensure_read_only(&self) -> Result<()> {
        if self.read_only {
            Ok(())
        } else {
            Err(GateError::Configuration(format!(
                "Data source '{}' is not read-only",
                self.name
            )))
        }
    }
}

/// Value returned by a read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadValue {
    Row(serde_json::Map<String, serde_json::Value>),
    Scalar(serde_json::Value),
}

impl ReadValue {
    /// The single value a placeholder resolves to
    ///
    /// Rows yield their `value` column, or their only column.
    pub fn into_value(self) -> std::result::Result<serde_json::Value, String> {
        match self {
            Self::Scalar(v) => Ok(v),
            Self::Row(mut row) => {
                if let Some(v) = row.remove("value") {
                    return Ok(v);
                }
                let columns = row.len();
                if columns == 1 {
                    if let Some((_, v)) = row.into_iter().next() {
                        return Ok(v);
                    }
                }
                Err(format!(
                    "row has {} columns and no 'value' column",
                    columns
                ))
            }
        }
    }
}

/// Read-only access to an external system
#[async_trait]
pub trait Connector: Send + Sync {
    /// Execute one read; implementations must reject anything else
    async fn execute_readonly(
        &self,
        query: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<ReadValue>;
}

/// In-memory connector keyed by exact query text
///
/// Rejects non-`SELECT` statements and can be switched into a failing state
/// to simulate an unreachable source.
#[derive(Default)]
pub struct StaticConnector {
    rows: RwLock<HashMap<String, ReadValue>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `value` for `query`
    pub fn with_value(self, query: impl Into<String>, value: ReadValue) -> Self {
        self.insert(query, value);
        self
    }

    pub fn insert(&self, query: impl Into<String>, value: ReadValue) {
        match self.rows.write() {
            Ok(mut rows) => {
                rows.insert(query.into(), value);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(query.into(), value);
            }
        }
    }

    /// Make every subsequent read fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of reads attempted so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn execute_readonly(
        &self,
        query: &str,
        _params: &BTreeMap<String, String>,
    ) -> Result<ReadValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !is_read_only_statement(query) {
            return Err(GateError::Validation(
                "connector refuses non-read statement".into(),
            ));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::Internal("data source unavailable".into()));
        }

        let rows = self
            .rows
            .read()
            .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?;
        rows.get(query)
            .cloned()
            .ok_or_else(|| GateError::Internal("no data for query".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_only_statements() {
        assert!(is_read_only_statement("SELECT 1"));
        assert!(is_read_only_statement("  select name from users;  "));
        assert!(is_read_only_statement(
            "WITH t AS (SELECT 1 AS value) SELECT value FROM t"
        ));
        assert!(is_read_only_statement("SELECT updated_at, created_by FROM t"));

        assert!(!is_read_only_statement("DELETE FROM users"));
        assert!(!is_read_only_statement("SELECT 1; DROP TABLE users"));
        assert!(!is_read_only_statement("SELECT 1; SELECT 2"));
        assert!(!is_read_only_statement("WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x"));
        assert!(!is_read_only_statement("EXPLAIN SELECT 1"));
        assert!(!is_read_only_statement(""));
    }

    #[test]
    fn test_write_keyword() {
        assert_eq!(write_keyword("insert into t values (1)"), Some("INSERT"));
        assert_eq!(write_keyword("SELECT a FROM t"), None);
        assert_eq!(write_keyword("SELECT is_deleted FROM t"), None);
    }

    #[test]
    fn test_data_source_read_only_guard() {
        let source = DataSource::new("db", SourceKind::Query);
        assert!(source.ensure_read_only().is_ok());
        let writable = DataSource {
            read_only: false,
            ..source
        };
        assert!(matches!(
            writable.ensure_read_only(),
            Err(GateError::Configuration(_))
        ));
    }

    #[test]
    fn test_read_value_extraction() {
        assert_eq!(ReadValue::Scalar(json!(5)).into_value().unwrap(), json!(5));

        let row = json!({"value": 1.5, "other": 2});
        let ReadValue::Row(map) = serde_json::from_value(row).unwrap() else {
            panic!("expected row");
        };
        assert_eq!(ReadValue::Row(map).into_value().unwrap(), json!(1.5));

        let single = json!({"balance": 9}).as_object().cloned().unwrap();
        assert_eq!(ReadValue::Row(single).into_value().unwrap(), json!(9));

        let ambiguous = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let err = ReadValue::Row(ambiguous).into_value().unwrap_err();
        assert_eq!(err, "row has 2 columns and no 'value' column");
    }

    #[tokio::test]
    async fn test_static_connector() {
        let connector = StaticConnector::new()
            .with_value("SELECT 1 AS value", ReadValue::Scalar(json!(1)));
        let params = BTreeMap::new();

        assert_eq!(
            connector.execute_readonly("SELECT 1 AS value", &params).await.unwrap(),
            ReadValue::Scalar(json!(1))
        );
        assert!(matches!(
            connector.execute_readonly("UPDATE t SET a = 1", &params).await,
            Err(GateError::Validation(_))
        ));
        assert!(connector.execute_readonly("SELECT 2", &params).await.is_err());

        connector.set_failing(true);
        assert!(connector.execute_readonly("SELECT 1 AS value", &params).await.is_err());
        assert_eq!(connector.calls(), 4);
    }
}
