//! Layered security checks
//!
//! Checks are grouped into four phases that always run in order:
//! `entry → content → behavior → execution`. Within a phase, checks run in
//! registration order. With fail-fast enabled, the first failure at or above
//! the configured severity stops the run; everything executed up to and
//! including that failure is kept in the [`SecurityReport`].

mod check;
pub mod checks;
mod pipeline;

pub use check::{CheckContext, CheckResult, Phase, SecurityCheck, Severity};
pub use checks::{default_checks, required_permissions};
pub use pipeline::{
    PhaseSummary, PipelineConfig, SecurityPipeline, SecurityPipelineBuilder, SecurityReport,
};
