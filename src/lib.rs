//! # a3s-gate
//!
//! Sensitivity-aware request gate for AI execution.
//!
//! ## Overview
//!
//! `a3s-gate` sits between a caller and the executors that fulfil AI
//! requests. For each request it scores the content for sensitive data,
//! routes it to a local, hybrid or cloud execution mode, runs layered
//! security checks, replaces placeholder values in the output with data read
//! from verified sources, and records every step in a tamper-evident
//! hash-chained audit log.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_gate::{AuditChain, ExecutionContext, ExecutionMode, FnExecutor, GateConfig, Orchestrator};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_gate::Result<()> {
//! let audit = Arc::new(AuditChain::new());
//! let gate = Orchestrator::from_config(&GateConfig::default(), audit.clone())?;
//! gate.register_executor(
//!     ExecutionMode::CloudSandbox,
//!     Arc::new(FnExecutor::new(|_ctx, _decision| async { Ok("Sunny".to_string()) })),
//! )?;
//!
//! let ctx = ExecutionContext::new("session-1", "What's the weather?")
//!     .with_user("alice")
//!     .with_metadata("auth_token", "token")
//!     .with_permission("ai:use")
//!     .with_permission("ai:cloud");
//!
//! let response = gate.process(ctx).await?;
//! assert_eq!(response.executed_mode, ExecutionMode::CloudSandbox);
//! assert!(audit.verify().valid);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SensitivityAnalyzer**: weighted multilingual rules, combined score in `[0, 1]`
//! - **ModeDecisionEngine**: thresholds the score into an [`ExecutionMode`]
//! - **SecurityPipeline**: entry, content, behavior and execution phase checks
//! - **OverwriteEngine**: resolves placeholders from read-only data sources
//! - **AuditChain**: append-only SHA-256 chain with optional durable sink
//! - **Orchestrator**: sequences the above for each request

pub mod audit;
pub mod config;
pub mod error;
pub mod logging;
pub mod mode;
pub mod orchestrator;
pub mod overwrite;
pub mod security;
pub mod sensitivity;
pub mod types;

// Re-export core types
pub use audit::{
    AuditChain, AuditEntry, AuditEventType, AuditFilter, AuditSink, ChainVerification,
    JsonlAuditSink, MemoryAuditSink, GENESIS_HASH,
};
pub use config::GateConfig;
pub use error::{GateError, Result};
pub use logging::init_logging;
pub use mode::{ModeDecision, ModeDecisionEngine, ModeThresholds};
pub use orchestrator::{
    ExecutionStats, Executor, FnExecutor, GateResponse, Orchestrator, OrchestratorOptions,
};
pub use overwrite::{
    Connector, DataSource, OverwriteEngine, OverwriteRule, PlaceholderPolicy, SourceKind,
    StaticConnector, Transform,
};
pub use security::{
    CheckContext, CheckResult, Phase, PipelineConfig, SecurityCheck, SecurityPipeline,
    SecurityReport, Severity,
};
pub use sensitivity::{SensitivityAnalysis, SensitivityAnalyzer, SensitivityRule};
pub use types::{ExecutionContext, ExecutionMode};
