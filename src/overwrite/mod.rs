//! Deterministic replacement of generated values with verified data
//!
//! - [`OverwriteEngine`]: placeholder scan, single-pass resolution, policy
//! - [`Connector`] / [`DataSource`]: read-only access to external systems
//! - [`Transform`]: named rendering of raw values

mod engine;
mod source;
mod transform;

pub use engine::{
    render_query, OverwriteEngine, OverwriteOutcome, OverwriteRule, OverwriteStats,
    PlaceholderPolicy, ResolutionStatus, ResolvedPlaceholder,
};
pub use source::{
    is_read_only_statement, write_keyword, Connector, DataSource, ReadValue, SourceKind,
    StaticConnector,
};
pub use transform::Transform;
