//! Append-only, hash-chained audit ledger
//!
//! Every entry stores the hash of its predecessor; the first entry links to
//! [`GENESIS_HASH`]. An entry's hash is the lowercase hex SHA-256 of
//!
//! ```text
//! prev_hash | event_type | canonical(payload) | sequence_no | timestamp
//! ```
//!
//! joined with `|` as UTF-8, where `canonical` is compact JSON with object
//! keys sorted at every depth. Hashes can therefore be recomputed from the
//! stored fields alone by any implementation.
//!
//! Appends are serialized by one mutex: sequence assignment, hashing and the
//! push happen under the same lock, so no writer can observe a stale
//! `prev_hash`.

use super::sink::AuditSink;
use crate::error::{GateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

/// `prev_hash` of the first entry
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Well-known event types written by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RequestRejected,
    ValidationFailed,
    ModeDecision,
    SecurityCheck,
    SecurityViolation,
    ExecutionStart,
    ExecutionFailed,
    ExecutionDegraded,
    ExecutionEnd,
    DataOverwrite,
    ResolutionFailed,
    RequestCompleted,
    RequestCancelled,
    RequestTimeout,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestRejected => "request_rejected",
            Self::ValidationFailed => "validation_failed",
            Self::ModeDecision => "mode_decision",
            Self::SecurityCheck => "security_check",
            Self::SecurityViolation => "security_violation",
            Self::ExecutionStart => "execution_start",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionDegraded => "execution_degraded",
            Self::ExecutionEnd => "execution_end",
            Self::DataOverwrite => "data_overwrite",
            Self::ResolutionFailed => "resolution_failed",
            Self::RequestCompleted => "request_completed",
            Self::RequestCancelled => "request_cancelled",
            Self::RequestTimeout => "request_timeout",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain, starting at 0
    pub sequence_no: u64,
    /// RFC 3339 UTC timestamp with millisecond precision
    pub timestamp: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Recompute this entry's hash from its stored fields
    pub fn compute_hash(&self) -> String {
        entry_hash(
            &self.prev_hash,
            &self.event_type,
            &self.payload,
            self.sequence_no,
            &self.timestamp,
        )
    }

    /// Parsed timestamp
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Whether this entry records a refused or failed request
    pub fn is_failure(&self) -> bool {
        FAILURE_EVENTS.iter().any(|t| t.as_str() == self.event_type)
    }
}

/// Result of [`AuditChain::verify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Index of the first entry that fails verification
    pub first_invalid_index: Option<usize>,
    pub total_entries: usize,
}

/// Entry counts by event type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// Criteria for [`AuditChain::search`]; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Inclusive lower bound on the entry timestamp
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the entry timestamp
    pub until: Option<DateTime<Utc>>,
    /// Stop after this many matches, oldest first
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an entry satisfies every set criterion
    ///
    /// An entry whose timestamp does not parse never matches a time bound.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        let field = |name: &str| entry.payload.get(name).and_then(|v| v.as_str());

        if let Some(event_type) = &self.event_type {
            if entry.event_type != *event_type {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if field("user_id") != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if field("session_id") != Some(session_id.as_str()) {
                return false;
            }
        }
        if self.since.is_some() || self.until.is_some() {
            let Some(at) = entry.recorded_at() else {
                return false;
            };
            if self.since.is_some_and(|since| at < since) {
                return false;
            }
            if self.until.is_some_and(|until| at > until) {
                return false;
            }
        }
        true
    }
}

/// Event types that mark a request as refused or failed
const FAILURE_EVENTS: &[AuditEventType] = &[
    AuditEventType::RequestRejected,
    AuditEventType::ValidationFailed,
    AuditEventType::SecurityViolation,
    AuditEventType::ExecutionFailed,
    AuditEventType::ResolutionFailed,
    AuditEventType::RequestCancelled,
    AuditEventType::RequestTimeout,
];

/// Entries shown by [`AuditChain::render_report`] without a session
const REPORT_RECENT: usize = 50;

/// Deterministic JSON: sorted keys at every depth, no whitespace
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a plain string cannot fail.
                out.push_str(
                    &serde_json::to_string(key).unwrap_or_else(|_| format!("\"{}\"", key)),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn entry_hash(
    prev_hash: &str,
    event_type: &str,
    payload: &serde_json::Value,
    sequence_no: u64,
    timestamp: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(payload).as_bytes());
    hasher.update(b"|");
    hasher.update(sequence_no.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}

enum SinkMessage {
    Entry(Box<AuditEntry>),
    /// Answered with the persist failures seen since the previous flush
    Flush(oneshot::Sender<std::result::Result<(), String>>),
}

/// The process-wide audit ledger
///
/// Shared as `Arc<AuditChain>` and handed explicitly to every component
/// that records events.
pub struct AuditChain {
    entries: Mutex<Vec<AuditEntry>>,
    sink: Option<mpsc::UnboundedSender<SinkMessage>>,
}

impl AuditChain {
    /// Create an empty in-memory chain
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    /// Create an empty chain that hands every entry to a durable sink
    ///
    /// Entries are forwarded in chain order by a background task, so
    /// `append` never waits on sink I/O. Must be called inside a tokio
    /// runtime.
    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Result<Self> {
        Self::restore_with_sink(Vec::new(), sink)
    }

    /// Rebuild a chain from persisted entries without validating them
    ///
    /// Call [`verify`](Self::verify) before trusting the result. New
    /// appends continue after the last restored entry.
    pub fn restore(entries: Vec<AuditEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            sink: None,
        }
    }

    /// Rebuild a chain from persisted entries and keep forwarding to a sink
    pub fn restore_with_sink(entries: Vec<AuditEntry>, sink: Arc<dyn AuditSink>) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            GateError::Configuration(format!("Audit sink requires a tokio runtime: {}", e))
        })?;
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkMessage>();

        handle.spawn(async move {
            let mut failed = 0usize;
            let mut last_error: Option<String> = None;
            while let Some(message) = rx.recv().await {
                match message {
                    SinkMessage::Entry(entry) => {
                        if let Err(e) = sink.persist(&entry).await {
                            tracing::error!(
                                sink = sink.name(),
                                sequence_no = entry.sequence_no,
                                error = %e,
                                "Failed to persist audit entry"
                            );
                            failed += 1;
                            last_error = Some(format!("sequence {}: {}", entry.sequence_no, e));
                        }
                    }
                    SinkMessage::Flush(done) => {
                        let outcome = match last_error.take() {
                            None => Ok(()),
                            Some(last) => Err(format!(
                                "{} audit entries failed to persist to {} sink (last {})",
                                failed,
                                sink.name(),
                                last
                            )),
                        };
                        failed = 0;
                        let _ = done.send(outcome);
                    }
                }
            }
        });

        Ok(Self {
            entries: Mutex::new(entries),
            sink: Some(tx),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<AuditEntry>>> {
        self.entries
            .lock()
            .map_err(|e| GateError::Internal(format!("Audit chain lock poisoned: {}", e)))
    }

    /// Append an event; the chain's only mutation
    pub fn append(
        &self,
        event_type: impl AsRef<str>,
        payload: serde_json::Value,
    ) -> Result<AuditEntry> {
        let event_type = event_type.as_ref().to_string();
        let mut entries = self.lock()?;

        let (sequence_no, prev_hash) = match entries.last() {
            Some(last) => (last.sequence_no + 1, last.hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let hash = entry_hash(&prev_hash, &event_type, &payload, sequence_no, &timestamp);

        let entry = AuditEntry {
            sequence_no,
            timestamp,
            event_type,
            payload,
            prev_hash,
            hash,
        };
        entries.push(entry.clone());

        if let Some(sink) = &self.sink {
            if sink.send(SinkMessage::Entry(Box::new(entry.clone()))).is_err() {
                tracing::warn!(
                    sequence_no = entry.sequence_no,
                    "Audit sink task has stopped; entry kept in memory only"
                );
            }
        }
        drop(entries);

        tracing::debug!(
            sequence_no = entry.sequence_no,
            event_type = %entry.event_type,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Append a well-known event type
    pub fn record(
        &self,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Result<AuditEntry> {
        self.append(event_type.as_str(), payload)
    }

    /// Recompute every hash from entry 0 forward
    pub fn verify(&self) -> ChainVerification {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        verify_entries(&entries)
    }

    /// Wait until every entry appended so far has reached the sink
    ///
    /// Fails when any entry handed to the sink since the previous flush
    /// could not be persisted; those entries remain in memory only.
    pub async fn flush(&self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        sink.send(SinkMessage::Flush(tx))
            .map_err(|_| GateError::Internal("Audit sink task has stopped".into()))?;
        rx.await
            .map_err(|_| GateError::Internal("Audit sink task dropped flush".into()))?
            .map_err(GateError::Internal)
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entry at a position
    pub fn get(&self, index: usize) -> Option<AuditEntry> {
        self.lock().ok().and_then(|e| e.get(index).cloned())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the chain has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash of the newest entry, or the genesis hash
    pub fn head_hash(&self) -> String {
        self.lock()
            .ok()
            .and_then(|e| e.last().map(|l| l.hash.clone()))
            .unwrap_or_else(|| GENESIS_HASH.to_string())
    }

    /// Entries whose payload carries the given `request_id`
    pub fn by_request(&self, request_id: &str) -> Vec<AuditEntry> {
        self.filter(|e| e.payload.get("request_id").and_then(|v| v.as_str()) == Some(request_id))
    }

    /// Entries whose payload carries the given `session_id`
    pub fn by_session(&self, session_id: &str) -> Vec<AuditEntry> {
        self.filter(|e| e.payload.get("session_id").and_then(|v| v.as_str()) == Some(session_id))
    }

    /// Entries of one event type
    pub fn by_event_type(&self, event_type: &str) -> Vec<AuditEntry> {
        self.filter(|e| e.event_type == event_type)
    }

    fn filter(&self, predicate: impl Fn(&AuditEntry) -> bool) -> Vec<AuditEntry> {
        self.lock()
            .map(|entries| entries.iter().filter(|e| predicate(e)).cloned().collect())
            .unwrap_or_default()
    }

    /// Counts by event type
    pub fn stats(&self) -> AuditStats {
        let mut stats = AuditStats::default();
        if let Ok(entries) = self.lock() {
            stats.total = entries.len();
            for entry in entries.iter() {
                *stats.by_type.entry(entry.event_type.clone()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Entries matching every criterion of `filter`, oldest first
    pub fn search(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        self.lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| filter.matches(e))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plain-text timeline for operators
    ///
    /// With a session id, every entry of that session; otherwise the most
    /// recent entries of the whole chain.
    pub fn render_report(&self, session_id: Option<&str>) -> String {
        let (title, entries) = match session_id {
            Some(session_id) => (
                format!("Audit report for session {}", session_id),
                self.by_session(session_id),
            ),
            None => {
                let mut entries = self.entries();
                let skip = entries.len().saturating_sub(REPORT_RECENT);
                (
                    "Recent audit entries".to_string(),
                    entries.split_off(skip),
                )
            }
        };

        let rule = "=".repeat(60);
        let mut lines = vec![
            rule.clone(),
            title,
            rule.clone(),
            format!("Entries: {}", entries.len()),
            "-".repeat(60),
        ];
        for entry in &entries {
            let time = entry
                .recorded_at()
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| entry.timestamp.clone());
            let mark = if entry.is_failure() { "FAIL" } else { "ok" };
            lines.push(format!(
                "[{}] #{} {} {}",
                time, entry.sequence_no, mark, entry.event_type
            ));

            let field = |name: &str| entry.payload.get(name).and_then(|v| v.as_str());
            if let Some(request_id) = field("request_id") {
                lines.push(format!("   request: {}", request_id));
            }
            if let Some(mode) = field("executed_mode").or_else(|| field("mode")) {
                lines.push(format!("   mode: {}", mode));
            }
            if let Some(checks) = entry.payload.get("failed_checks").and_then(|v| v.as_array()) {
                let ids: Vec<&str> = checks.iter().filter_map(|c| c.as_str()).collect();
                lines.push(format!("   failed checks: {}", ids.join(", ")));
            }
            if let Some(kind) = field("error_kind") {
                lines.push(format!("   error: {}", kind));
            }
        }
        lines.push(rule);
        lines.join("\n")
    }

    /// Pretty JSON export of the whole chain, hashes included
    pub fn export_json(&self) -> Result<String> {
        let entries = self.lock()?;
        Ok(serde_json::to_string_pretty(&*entries)?)
    }
}

impl Default for AuditChain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("entries", &self.len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Verify a standalone sequence of entries (e.g. loaded from a sink)
pub fn verify_entries(entries: &[AuditEntry]) -> ChainVerification {
    let mut expected_prev = GENESIS_HASH;
    for (index, entry) in entries.iter().enumerate() {
        let intact = entry.sequence_no == index as u64
            && entry.prev_hash == expected_prev
            && entry.hash == entry.compute_hash();
        if !intact {
            tracing::error!(
                index,
                sequence_no = entry.sequence_no,
                "Audit chain verification failed"
            );
            return ChainVerification {
                valid: false,
                first_invalid_index: Some(index),
                total_entries: entries.len(),
            };
        }
        expected_prev = &entry.hash;
    }
    ChainVerification {
        valid: true,
        first_invalid_index: None,
        total_entries: entries.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain_with(n: usize) -> AuditChain {
        let chain = AuditChain::new();
        for i in 0..n {
            chain
                .append(
                    "mode_decision",
                    json!({"request_id": format!("req-{}", i), "score": i}),
                )
                .unwrap();
        }
        chain
    }

    #[test]
    fn test_canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": {"d": [1, {"y": 2, "x": 1}], "c": "s"}});
        let b = json!({"a": {"c": "s", "d": [1, {"x": 1, "y": 2}]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":"s","d":[1,{"x":1,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let v = json!({"k\"ey": "va\nlue", "ü": null});
        assert_eq!(canonical_json(&v), r#"{"k\"ey":"va\nlue","ü":null}"#);
    }

    #[test]
    fn test_known_hash_vector() {
        let entry = AuditEntry {
            sequence_no: 0,
            timestamp: "2026-01-01T00:00:00.000Z".into(),
            event_type: "mode_decision".into(),
            payload: json!({"b": 2, "a": 1}),
            prev_hash: GENESIS_HASH.into(),
            hash: String::new(),
        };
        let preimage = format!(
            "{}|mode_decision|{{\"a\":1,\"b\":2}}|0|2026-01-01T00:00:00.000Z",
            GENESIS_HASH
        );
        let expected = hex::encode(Sha256::digest(preimage.as_bytes()));
        assert_eq!(entry.compute_hash(), expected);
    }

    #[test]
    fn test_append_links_entries() {
        let chain = chain_with(3);
        let entries = chain.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.sequence_no, i as u64);
            assert_eq!(e.hash.len(), 64);
        }
        assert_eq!(chain.head_hash(), entries[2].hash);
    }

    #[test]
    fn test_verify_untouched_chain() {
        assert!(AuditChain::new().verify().valid);
        let v = chain_with(10).verify();
        assert!(v.valid);
        assert_eq!(v.first_invalid_index, None);
        assert_eq!(v.total_entries, 10);
    }

    #[test]
    fn test_tampering_any_field_is_localized() {
        let original = chain_with(6).entries();
        let mutations: [fn(&mut AuditEntry); 6] = [
            |e: &mut AuditEntry| e.sequence_no += 100,
            |e: &mut AuditEntry| e.timestamp = "1999-01-01T00:00:00.000Z".into(),
            |e: &mut AuditEntry| e.event_type = "forged".into(),
            |e: &mut AuditEntry| e.payload["score"] = json!(999),
            |e: &mut AuditEntry| e.prev_hash = "f".repeat(64),
            |e: &mut AuditEntry| e.hash = "0".repeat(64),
        ];
        for target in 0..original.len() {
            for mutate in &mutations {
                let mut entries = original.clone();
                mutate(&mut entries[target]);
                let v = AuditChain::restore(entries).verify();
                assert!(!v.valid);
                assert_eq!(v.first_invalid_index, Some(target));
            }
        }
    }

    #[test]
    fn test_removed_entry_detected() {
        let mut entries = chain_with(5).entries();
        entries.remove(2);
        let v = verify_entries(&entries);
        assert_eq!(v.first_invalid_index, Some(2));
    }

    #[test]
    fn test_restore_resumes_appends() {
        let entries = chain_with(3).entries();
        let chain = AuditChain::restore(entries.clone());
        let next = chain.append("request_completed", json!({})).unwrap();
        assert_eq!(next.sequence_no, 3);
        assert_eq!(next.prev_hash, entries[2].hash);
        assert!(chain.verify().valid);
    }

    #[test]
    fn test_queries_and_stats() {
        let chain = AuditChain::new();
        chain
            .record(
                AuditEventType::ModeDecision,
                json!({"request_id": "r1", "session_id": "s1"}),
            )
            .unwrap();
        chain
            .record(
                AuditEventType::SecurityCheck,
                json!({"request_id": "r1", "session_id": "s1"}),
            )
            .unwrap();
        chain
            .record(
                AuditEventType::ModeDecision,
                json!({"request_id": "r2", "session_id": "s2"}),
            )
            .unwrap();

        assert_eq!(chain.by_request("r1").len(), 2);
        assert_eq!(chain.by_session("s2").len(), 1);
        assert_eq!(chain.by_event_type("mode_decision").len(), 2);
        assert_eq!(chain.get(1).unwrap().event_type, "security_check");

        let stats = chain.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type["mode_decision"], 2);

        let exported: Vec<AuditEntry> = serde_json::from_str(&chain.export_json().unwrap()).unwrap();
        assert_eq!(exported, chain.entries());
    }

    #[test]
    fn test_concurrent_appends_are_gap_free() {
        let chain = Arc::new(AuditChain::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let chain = chain.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        chain
                            .append("execution_end", json!({"thread": t, "i": i}))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entries = chain.entries();
        assert_eq!(entries.len(), 2000);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.sequence_no, i as u64);
        }
        assert!(chain.verify().valid);
    }

    fn request_entries() -> AuditChain {
        let chain = AuditChain::new();
        let events = [
            (AuditEventType::ModeDecision, "r1", "s1", "alice", json!({"mode": "local_only"})),
            (AuditEventType::SecurityViolation, "r1", "s1", "alice", json!({"failed_checks": ["SEC-010"]})),
            (AuditEventType::ModeDecision, "r2", "s2", "bob", json!({"mode": "cloud_sandbox"})),
            (AuditEventType::RequestCompleted, "r2", "s2", "bob", json!({"executed_mode": "cloud_sandbox"})),
            (AuditEventType::ModeDecision, "r3", "s1", "alice", json!({"mode": "hybrid"})),
        ];
        for (event_type, request, session, user, extra) in events {
            let mut payload = json!({"request_id": request, "session_id": session, "user_id": user});
            if let (Some(obj), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
                obj.extend(extra);
            }
            chain.record(event_type, payload).unwrap();
        }
        chain
    }

    #[test]
    fn test_search_filters_combine() {
        let chain = request_entries();

        let alice = chain.search(&AuditFilter::new().user("alice"));
        assert_eq!(alice.len(), 3);
        assert!(alice.iter().all(|e| e.payload["user_id"] == "alice"));

        let decisions = chain.search(&AuditFilter::new().user("alice").event_type("mode_decision"));
        let requests: Vec<_> = decisions.iter().map(|e| e.payload["request_id"].clone()).collect();
        assert_eq!(requests, vec![json!("r1"), json!("r3")]);

        let first_two = chain.search(&AuditFilter::new().event_type("mode_decision").limit(2));
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[1].payload["request_id"], "r2");

        assert_eq!(chain.search(&AuditFilter::new().session("s2")).len(), 2);
        assert!(chain.search(&AuditFilter::new().user("mallory")).is_empty());
        assert_eq!(chain.search(&AuditFilter::new()).len(), 5);
    }

    #[test]
    fn test_search_time_range() {
        let mut entries = request_entries().entries();
        let stamps = [
            "2026-03-01T08:00:00.000Z",
            "2026-03-01T09:00:00.000Z",
            "2026-03-01T10:00:00.000Z",
            "2026-03-01T11:00:00.000Z",
            "not a timestamp",
        ];
        for (entry, stamp) in entries.iter_mut().zip(stamps) {
            entry.timestamp = stamp.into();
        }
        let chain = AuditChain::restore(entries);

        let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        let window = AuditFilter::new()
            .since(at("2026-03-01T09:00:00Z"))
            .until(at("2026-03-01T10:00:00Z"));
        let hits = chain.search(&window);
        let seqs: Vec<u64> = hits.iter().map(|e| e.sequence_no).collect();
        assert_eq!(seqs, vec![1, 2]);

        let later = chain.search(&AuditFilter::new().since(at("2026-03-01T10:30:00Z")));
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].sequence_no, 3);
    }

    #[test]
    fn test_render_report_for_session() {
        let chain = request_entries();
        let report = chain.render_report(Some("s1"));

        assert!(report.contains("Audit report for session s1"));
        assert!(report.contains("Entries: 3"));
        assert!(report.contains("#1 FAIL security_violation"));
        assert!(report.contains("failed checks: SEC-010"));
        assert!(report.contains("mode: hybrid"));
        assert!(!report.contains("r2"));
    }

    #[test]
    fn test_render_report_recent_entries() {
        let chain = chain_with(60);
        let report = chain.render_report(None);
        assert!(report.contains("Recent audit entries"));
        assert!(report.contains("Entries: 50"));
        assert!(report.contains("#59 ok mode_decision"));
        assert!(!report.contains("#9 "));
        assert!(report.contains("#10 ok"));
    }

    struct BrokenSink;

    #[async_trait::async_trait]
    impl AuditSink for BrokenSink {
        async fn persist(&self, _entry: &AuditEntry) -> Result<()> {
            Err(GateError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_flush_reports_persist_failures() {
        let chain = AuditChain::with_sink(Arc::new(BrokenSink)).unwrap();
        chain.append("mode_decision", json!({"i": 0})).unwrap();
        chain.append("mode_decision", json!({"i": 1})).unwrap();

        let Err(GateError::Internal(message)) = chain.flush().await else {
            panic!("flush must surface persist failures");
        };
        assert!(message.contains("2 audit entries"));
        assert!(message.contains("broken"));
        assert!(message.contains("disk full"));

        // Entries stay in memory and failures are reported once
        assert_eq!(chain.len(), 2);
        assert!(chain.verify().valid);
        assert!(chain.flush().await.is_ok());
    }

    #[test]
    fn test_with_sink_requires_runtime() {
        let sink = Arc::new(crate::audit::MemoryAuditSink::default());
        assert!(matches!(
            AuditChain::with_sink(sink),
            Err(GateError::Configuration(_))
        ));
    }
}
