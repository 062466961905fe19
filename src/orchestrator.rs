//! Per-request orchestration
//!
//! ```text
//! validate → decide mode → security checks → executor → overwrite → complete
//! ```
//!
//! Stages run strictly in sequence within a request; the orchestrator itself
//! is shared across concurrent requests. Every caller-visible failure is
//! written to the audit chain before it is returned.

use crate::audit::{AuditChain, AuditEventType, ChainVerification};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::mode::{ModeDecision, ModeDecisionEngine};
use crate::overwrite::{OverwriteEngine, ResolvedPlaceholder};
use crate::security::{default_checks, CheckContext, SecurityPipeline, SecurityReport};
use crate::sensitivity::{default_rules, SensitivityAnalyzer};
use crate::types::{ExecutionContext, ExecutionMode};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fulfils a request in one execution mode
///
/// Output may contain placeholders; their values are supplied afterwards
/// by the overwrite engine, never by the executor.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, decision: &ModeDecision) -> Result<String>;
}

type ExecutorFn =
    dyn Fn(ExecutionContext, ModeDecision) -> BoxFuture<'static, Result<String>> + Send + Sync;

/// Adapts an async closure into an [`Executor`]
pub struct FnExecutor {
    f: Box<ExecutorFn>,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ExecutionContext, ModeDecision) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx, decision| f(ctx, decision).boxed()),
        }
    }
}

#[async_trait]
impl Executor for FnExecutor {
    async fn execute(&self, ctx: &ExecutionContext, decision: &ModeDecision) -> Result<String> {
        (self.f)(ctx.clone(), decision.clone()).await
    }
}

/// Orchestration settings not owned by a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Budget for one request, shared by checks, executor and reads
    pub request_timeout: Duration,
    /// Retry a failed HYBRID execution once in LOCAL_ONLY
    pub hybrid_degrade_to_local: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            hybrid_degrade_to_local: true,
        }
    }
}

/// Successful result of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResponse {
    pub request_id: String,
    pub decision: ModeDecision,
    /// Mode that actually produced the output
    pub executed_mode: ExecutionMode,
    /// Executor output with every placeholder resolved
    pub output: String,
    pub security: SecurityReport,
    pub resolved: Vec<ResolvedPlaceholder>,
    /// Execution fell back to LOCAL_ONLY or a placeholder used its fallback
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Completed requests by the mode that produced their output
    pub by_mode: BTreeMap<ExecutionMode, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Stage {
    Validate,
    Decide,
    Security,
    Execute,
    Overwrite,
    Complete,
}

impl Stage {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Validate,
            1 => Self::Decide,
            2 => Self::Security,
            3 => Self::Execute,
            4 => Self::Overwrite,
            _ => Self::Complete,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Decide => "decide",
            Self::Security => "security",
            Self::Execute => "execute",
            Self::Overwrite => "overwrite",
            Self::Complete => "complete",
        }
    }
}

struct StageCell(AtomicU8);

impl StageCell {
    fn new() -> Self {
        Self(AtomicU8::new(Stage::Validate as u8))
    }

    fn set(&self, stage: Stage) {
        self.0.store(stage as u8, Ordering::SeqCst);
    }

    fn get(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Sequences mode decision, checks, execution and overwrite per request
pub struct Orchestrator {
    engine: ModeDecisionEngine,
    pipeline: SecurityPipeline,
    overwrite: OverwriteEngine,
    audit: Arc<AuditChain>,
    executors: RwLock<HashMap<ExecutionMode, Arc<dyn Executor>>>,
    options: OrchestratorOptions,
    halted: AtomicBool,
    first_invalid_index: AtomicUsize,
    stats: Mutex<ExecutionStats>,
}

impl Orchestrator {
    /// Assemble from prebuilt components sharing one audit chain
    pub fn new(
        engine: ModeDecisionEngine,
        pipeline: SecurityPipeline,
        overwrite: OverwriteEngine,
        audit: Arc<AuditChain>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            engine,
            pipeline,
            overwrite,
            audit,
            executors: RwLock::new(HashMap::new()),
            options,
            halted: AtomicBool::new(false),
            first_invalid_index: AtomicUsize::new(0),
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    /// Build every component from configuration with the built-in checks
    pub fn from_config(config: &GateConfig, audit: Arc<AuditChain>) -> Result<Self> {
        config.validate()?;

        let mut rules = if config.sensitivity.use_default_rules {
            default_rules()
        } else {
            Vec::new()
        };
        rules.extend(config.sensitivity.rules.iter().cloned());
        let analyzer = Arc::new(SensitivityAnalyzer::with_combiner(
            rules,
            config.sensitivity.combiner.build(),
        )?);

        let engine = ModeDecisionEngine::new(
            analyzer,
            config.mode.thresholds()?,
            config.mode.always_confirm.iter().cloned(),
        )?;
        let pipeline = SecurityPipeline::builder(config.security.pipeline_config())
            .register_all(default_checks(config.security.tool_whitelist.iter().cloned())?)
            .build(audit.clone())?;
        let overwrite = OverwriteEngine::new(
            config.overwrite.placeholder_policy,
            config.security.request_timeout(),
            audit.clone(),
        )?;

        Ok(Self::new(
            engine,
            pipeline,
            overwrite,
            audit,
            OrchestratorOptions {
                request_timeout: config.security.request_timeout(),
                hybrid_degrade_to_local: config.execution.hybrid_degrade_to_local,
            },
        ))
    }

    /// Register (or replace) the executor for a mode
    pub fn register_executor(&self, mode: ExecutionMode, executor: Arc<dyn Executor>) -> Result<()> {
        let mut executors = self
            .executors
            .write()
            .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?;
        if executors.insert(mode, executor).is_some() {
            tracing::warn!(mode = %mode, "Executor replaced");
        } else {
            tracing::info!(mode = %mode, "Executor registered");
        }
        Ok(())
    }

    pub fn engine(&self) -> &ModeDecisionEngine {
        &self.engine
    }

    pub fn pipeline(&self) -> &SecurityPipeline {
        &self.pipeline
    }

    /// The overwrite engine, for registering sources and rules
    pub fn overwrite(&self) -> &OverwriteEngine {
        &self.overwrite
    }

    pub fn audit(&self) -> &Arc<AuditChain> {
        &self.audit
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Verify the audit chain; a broken chain halts this instance
    pub fn verify_integrity(&self) -> Result<ChainVerification> {
        let verification = self.audit.verify();
        if let Some(index) = verification.first_invalid_index {
            self.first_invalid_index.store(index, Ordering::SeqCst);
            self.halted.store(true, Ordering::SeqCst);
            tracing::error!(
                first_invalid_index = index,
                total_entries = verification.total_entries,
                "Audit chain integrity violated; refusing new requests"
            );
            self.audit.record(
                AuditEventType::RequestRejected,
                serde_json::json!({
                    "stage": "integrity_check",
                    "error_kind": "audit_integrity",
                    "first_invalid_index": index,
                    "total_entries": verification.total_entries,
                }),
            )?;
            return Err(GateError::AuditIntegrity {
                first_invalid_index: index,
            });
        }
        Ok(verification)
    }

    /// Process one request
    pub async fn process(&self, ctx: ExecutionContext) -> Result<GateResponse> {
        self.process_with_cancellation(ctx, CancellationToken::new())
            .await
    }

    /// Process one request, abandoning it when `token` is cancelled
    ///
    /// Cancellation and timeout drop the in-flight stage (data-source reads
    /// are read-only, so nothing external is left half-done) and append a
    /// `request_cancelled` or `request_timeout` entry.
    pub async fn process_with_cancellation(
        &self,
        ctx: ExecutionContext,
        token: CancellationToken,
    ) -> Result<GateResponse> {
        if self.is_halted() {
            let index = self.first_invalid_index.load(Ordering::SeqCst);
            self.record(
                AuditEventType::RequestRejected,
                &ctx,
                serde_json::json!({"stage": "admission", "error_kind": "audit_integrity"}),
            )?;
            return Err(GateError::AuditIntegrity {
                first_invalid_index: index,
            });
        }

        self.update_stats(|s| s.total += 1);
        let deadline = Instant::now() + self.options.request_timeout;
        let stage = StageCell::new();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let stage = stage.get().as_str();
                tracing::warn!(request_id = %ctx.request_id, stage, "Request cancelled");
                self.record(
                    AuditEventType::RequestCancelled,
                    &ctx,
                    serde_json::json!({"stage": stage}),
                )?;
                Err(GateError::Cancelled { stage: stage.to_string() })
            }
            result = self.run(&ctx, deadline, &stage) => result,
            _ = tokio::time::sleep_until(deadline) => {
                let stage = stage.get().as_str();
                tracing::warn!(request_id = %ctx.request_id, stage, "Request timed out");
                self.record(
                    AuditEventType::RequestTimeout,
                    &ctx,
                    serde_json::json!({"stage": stage}),
                )?;
                Err(GateError::Timeout(format!(
                    "request {} exceeded {} ms during {}",
                    ctx.request_id,
                    self.options.request_timeout.as_millis(),
                    stage
                )))
            }
        };

        match &result {
            Ok(response) => {
                let mode = response.executed_mode;
                self.update_stats(|s| {
                    s.succeeded += 1;
                    *s.by_mode.entry(mode).or_insert(0) += 1;
                });
            }
            Err(err) => {
                self.update_stats(|s| s.failed += 1);
                // Component failures already have their own entry.
                let recorded = matches!(
                    err,
                    GateError::Validation(_)
                        | GateError::SecurityViolation { .. }
                        | GateError::Execution { .. }
                        | GateError::Resolution { .. }
                        | GateError::Cancelled { .. }
                        | GateError::Timeout(_)
                );
                if !recorded {
                    self.record(
                        AuditEventType::RequestRejected,
                        &ctx,
                        serde_json::json!({"stage": stage.get().as_str(), "error_kind": err.kind()}),
                    )?;
                }
            }
        }
        result
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        deadline: Instant,
        stage: &StageCell,
    ) -> Result<GateResponse> {
        stage.set(Stage::Validate);
        if let Err(err) = ctx.validate() {
            tracing::warn!(request_id = %ctx.request_id, error = %err, "Request rejected");
            self.record(
                AuditEventType::ValidationFailed,
                ctx,
                serde_json::json!({"error": err.to_string()}),
            )?;
            return Err(err);
        }

        stage.set(Stage::Decide);
        let decision = self.engine.decide(&ctx.input_content, ctx);
        self.record(AuditEventType::ModeDecision, ctx, decision.audit_payload())?;

        stage.set(Stage::Security);
        let report = self
            .pipeline
            .run_until(&CheckContext::new(ctx, Some(decision.mode)), deadline)
            .await?;
        if report.refused {
            self.record(
                AuditEventType::SecurityViolation,
                ctx,
                serde_json::json!({
                    "failed_checks": report.failed_check_ids(),
                    "risk_level": report.risk_label(),
                    "fail_fast_triggered": report.fail_fast_triggered,
                }),
            )?;
            return Err(GateError::SecurityViolation {
                report: Box::new(report),
            });
        }

        stage.set(Stage::Execute);
        let (executed_mode, raw_output, execution_degraded) =
            self.execute(ctx, &decision).await?;

        stage.set(Stage::Overwrite);
        let outcome = self
            .overwrite
            .overwrite_until(&raw_output, ctx, deadline)
            .await?;

        stage.set(Stage::Complete);
        let degraded = execution_degraded || outcome.is_degraded();
        self.record(
            AuditEventType::RequestCompleted,
            ctx,
            serde_json::json!({
                "mode": decision.mode,
                "executed_mode": executed_mode,
                "degraded": degraded,
                "placeholders": outcome.stats,
            }),
        )?;
        tracing::info!(
            request_id = %ctx.request_id,
            mode = %executed_mode,
            degraded,
            "Request completed"
        );

        Ok(GateResponse {
            request_id: ctx.request_id.clone(),
            decision,
            executed_mode,
            output: outcome.final_output,
            security: report,
            resolved: outcome.resolved,
            degraded,
        })
    }

    /// Run the executor, degrading a failed HYBRID run to LOCAL_ONLY once
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        decision: &ModeDecision,
    ) -> Result<(ExecutionMode, String, bool)> {
        let first = self.execute_in(ctx, decision).await;
        let err = match first {
            Ok(output) => return Ok((decision.mode, output, false)),
            Err(err) => err,
        };

        let can_degrade = decision.mode == ExecutionMode::Hybrid
            && self.options.hybrid_degrade_to_local
            && self.executor_for(ExecutionMode::LocalOnly)?.is_some();
        if !can_degrade {
            return Err(err);
        }

        tracing::warn!(
            request_id = %ctx.request_id,
            error = %err,
            "Hybrid execution failed, degrading to local"
        );
        self.record(
            AuditEventType::ExecutionDegraded,
            ctx,
            serde_json::json!({
                "from": ExecutionMode::Hybrid,
                "to": ExecutionMode::LocalOnly,
                "error_kind": err.kind(),
            }),
        )?;

        let local = ModeDecision {
            mode: ExecutionMode::LocalOnly,
            reason: format!("degraded from hybrid: {}", decision.reason),
            ..decision.clone()
        };
        let output = self.execute_in(ctx, &local).await?;
        Ok((ExecutionMode::LocalOnly, output, true))
    }

    /// One attempt in the decision's mode; failures are audited here
    async fn execute_in(&self, ctx: &ExecutionContext, decision: &ModeDecision) -> Result<String> {
        let mode = decision.mode;
        let result = match self.executor_for(mode)? {
            Some(executor) => {
                self.record(
                    AuditEventType::ExecutionStart,
                    ctx,
                    serde_json::json!({"mode": mode}),
                )?;
                executor.execute(ctx, decision).await
            }
            None => Err(GateError::Execution {
                mode,
                reason: "no executor registered".into(),
            }),
        };

        match result {
            Ok(output) => {
                self.record(
                    AuditEventType::ExecutionEnd,
                    ctx,
                    serde_json::json!({"mode": mode, "output_chars": output.chars().count()}),
                )?;
                Ok(output)
            }
            Err(err) => {
                let err = match err {
                    GateError::Execution { .. } => err,
                    other => GateError::Execution {
                        mode,
                        reason: other.to_string(),
                    },
                };
                tracing::warn!(request_id = %ctx.request_id, mode = %mode, error = %err, "Execution failed");
                self.record(
                    AuditEventType::ExecutionFailed,
                    ctx,
                    serde_json::json!({"mode": mode, "error_kind": err.kind()}),
                )?;
                Err(err)
            }
        }
    }

    fn executor_for(&self, mode: ExecutionMode) -> Result<Option<Arc<dyn Executor>>> {
        let executors = self
            .executors
            .read()
            .map_err(|e| GateError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(executors.get(&mode).cloned())
    }

    /// Append an event carrying the request's identifiers plus `extra`
    fn record(
        &self,
        event_type: AuditEventType,
        ctx: &ExecutionContext,
        extra: serde_json::Value,
    ) -> Result<()> {
        let mut payload = ctx.audit_fields();
        if let (Some(obj), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            obj.extend(extra);
        }
        self.audit.record(event_type, payload)?;
        Ok(())
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutionStats)) {
        match self.stats.lock() {
            Ok(mut stats) => f(&mut stats),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("engine", &self.engine)
            .field("pipeline", &self.pipeline)
            .field("overwrite", &self.overwrite)
            .field("options", &self.options)
            .field("halted", &self.is_halted())
            .finish()
    }
}
