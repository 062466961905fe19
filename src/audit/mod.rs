//! Tamper-evident audit ledger
//!
//! - [`AuditChain`]: in-memory, hash-linked, append-only entry list
//! - [`AuditSink`]: optional durable destination fed in chain order

mod chain;
mod sink;

pub use chain::{
    canonical_json, verify_entries, AuditChain, AuditEntry, AuditEventType, AuditFilter,
    AuditStats, ChainVerification, GENESIS_HASH,
};
pub use sink::{AuditSink, JsonlAuditSink, MemoryAuditSink};
