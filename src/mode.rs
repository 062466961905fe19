//! Execution mode selection
//!
//! `decide` is a pure function of the content, the analyzer's rule table
//! and the configured thresholds: replaying the same input against the
//! same table always yields the same decision.
//!
//! | score                          | mode            |
//! |--------------------------------|-----------------|
//! | `score >= local_threshold`     | `LOCAL_ONLY`    |
//! | `score <= cloud_threshold`     | `CLOUD_SANDBOX` |
//! | otherwise                      | `HYBRID`        |

use crate::error::{GateError, Result};
use crate::sensitivity::SensitivityAnalyzer;
use crate::types::{ExecutionContext, ExecutionMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Outcome of mode selection for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeDecision {
    pub mode: ExecutionMode,
    /// Combined sensitivity score in `[0, 1]`
    pub sensitivity_score: f64,
    pub matched_categories: BTreeSet<String>,
    /// Set when routing local and an always-confirm category matched
    pub requires_confirmation: bool,
    pub reason: String,
}

impl ModeDecision {
    /// Human-readable explanation for display to the user
    pub fn explain(&self) -> String {
        let mut lines = vec![
            format!("Execution mode: {}", self.mode),
            format!("Sensitivity score: {:.2}/1.00", self.sensitivity_score),
        ];
        if !self.matched_categories.is_empty() {
            let categories: Vec<&str> =
                self.matched_categories.iter().map(String::as_str).collect();
            lines.push(format!("Matched categories: {}", categories.join(", ")));
        }
        lines.push(format!("Reason: {}", self.reason));
        if self.requires_confirmation {
            lines.push("User confirmation required".to_string());
        }
        lines.join("\n")
    }

    /// Decision payload copied into the audit chain
    pub fn audit_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": self.mode,
            "sensitivity_score": self.sensitivity_score,
            "matched_categories": self.matched_categories,
            "requires_confirmation": self.requires_confirmation,
            "reason": self.reason,
        })
    }
}

/// Score thresholds partitioning `[0, 1]` into the three modes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeThresholds {
    pub local_threshold: f64,
    pub cloud_threshold: f64,
}

impl ModeThresholds {
    /// Validate and build thresholds
    ///
    /// Requires `0 <= cloud_threshold < local_threshold <= 1`.
    pub fn new(local_threshold: f64, cloud_threshold: f64) -> Result<Self> {
        let thresholds = Self {
            local_threshold,
            cloud_threshold,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Check ordering and range
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("local_threshold", self.local_threshold),
            ("cloud_threshold", self.cloud_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(GateError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.cloud_threshold >= self.local_threshold {
            return Err(GateError::Configuration(format!(
                "cloud_threshold ({}) must be lower than local_threshold ({})",
                self.cloud_threshold, self.local_threshold
            )));
        }
        Ok(())
    }

    /// Map a score to exactly one mode
    pub fn classify(&self, score: f64) -> ExecutionMode {
        if score >= self.local_threshold {
            ExecutionMode::LocalOnly
        } else if score <= self.cloud_threshold {
            ExecutionMode::CloudSandbox
        } else {
            ExecutionMode::Hybrid
        }
    }
}

/// Chooses an execution mode from sensitivity analysis
#[derive(Debug)]
pub struct ModeDecisionEngine {
    analyzer: Arc<SensitivityAnalyzer>,
    thresholds: ModeThresholds,
    always_confirm: BTreeSet<String>,
}

impl ModeDecisionEngine {
    /// Create an engine
    ///
    /// Fails with `Configuration` unless `cloud_threshold < local_threshold`.
    pub fn new(
        analyzer: Arc<SensitivityAnalyzer>,
        thresholds: ModeThresholds,
        always_confirm: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self> {
        thresholds.validate()?;
        Ok(Self {
            analyzer,
            thresholds,
            always_confirm: always_confirm.into_iter().map(Into::into).collect(),
        })
    }

    /// The analyzer backing this engine
    pub fn analyzer(&self) -> &Arc<SensitivityAnalyzer> {
        &self.analyzer
    }

    /// Configured thresholds
    pub fn thresholds(&self) -> ModeThresholds {
        self.thresholds
    }

    /// Categories that force confirmation when routed locally
    pub fn always_confirm(&self) -> &BTreeSet<String> {
        &self.always_confirm
    }

    /// Decide the mode for a request's content
    ///
    /// The context is accepted for tracing only; it never influences the
    /// decision.
    pub fn decide(&self, content: &str, context: &ExecutionContext) -> ModeDecision {
        let analysis = self.analyzer.analyze(content);
        let decision = self.decide_score(analysis.score, analysis.categories);

        tracing::info!(
            request_id = %context.request_id,
            mode = %decision.mode,
            score = decision.sensitivity_score,
            categories = ?decision.matched_categories,
            requires_confirmation = decision.requires_confirmation,
            "Mode decided"
        );
        decision
    }

    /// Pure threshold policy over a precomputed score
    pub fn decide_score(&self, score: f64, categories: BTreeSet<String>) -> ModeDecision {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let mode = self.thresholds.classify(score);

        let reason = match mode {
            ExecutionMode::LocalOnly => format!(
                "sensitivity {:.2} at or above local threshold {:.2}",
                score, self.thresholds.local_threshold
            ),
            ExecutionMode::CloudSandbox => format!(
                "sensitivity {:.2} at or below cloud threshold {:.2}",
                score, self.thresholds.cloud_threshold
            ),
            ExecutionMode::Hybrid => format!(
                "sensitivity {:.2} between cloud threshold {:.2} and local threshold {:.2}",
                score, self.thresholds.cloud_threshold, self.thresholds.local_threshold
            ),
        };

        let requires_confirmation = mode == ExecutionMode::LocalOnly
            && categories.iter().any(|c| self.always_confirm.contains(c));

        ModeDecision {
            mode,
            sensitivity_score: score,
            matched_categories: categories,
            requires_confirmation,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensitivity::SensitivityRule;

    fn engine(local: f64, cloud: f64) -> ModeDecisionEngine {
        ModeDecisionEngine::new(
            Arc::new(SensitivityAnalyzer::with_default_rules().unwrap()),
            ModeThresholds::new(local, cloud).unwrap(),
            ["credential", "identity"],
        )
        .unwrap()
    }

    fn ctx(content: &str) -> ExecutionContext {
        ExecutionContext::new("sess-1", content)
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        assert!(matches!(
            ModeThresholds::new(0.3, 0.3),
            Err(GateError::Configuration(_))
        ));
        assert!(ModeThresholds::new(0.2, 0.8).is_err());
        assert!(ModeThresholds::new(1.2, 0.3).is_err());
        assert!(ModeThresholds::new(0.8, -0.1).is_err());
        assert!(ModeThresholds::new(0.8, 0.3).is_ok());

        let bad = ModeThresholds {
            local_threshold: 0.2,
            cloud_threshold: 0.5,
        };
        let analyzer = Arc::new(SensitivityAnalyzer::new(Vec::new()).unwrap());
        assert!(ModeDecisionEngine::new(analyzer, bad, Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_credential_routes_local_with_confirmation() {
        let engine = engine(0.8, 0.3);
        let content = "我的密碼是 123456";
        let decision = engine.decide(content, &ctx(content));
        assert_eq!(decision.mode, ExecutionMode::LocalOnly);
        assert!((decision.sensitivity_score - 0.95).abs() < 1e-9);
        assert!(decision.requires_confirmation);
        assert!(decision.matched_categories.contains("credential"));
    }

    #[test]
    fn test_benign_routes_cloud() {
        let engine = engine(0.8, 0.3);
        let content = "今天天氣如何？";
        let decision = engine.decide(content, &ctx(content));
        assert_eq!(decision.mode, ExecutionMode::CloudSandbox);
        assert_eq!(decision.sensitivity_score, 0.0);
        assert!(!decision.requires_confirmation);
    }

    #[test]
    fn test_middle_band_routes_hybrid() {
        let analyzer = Arc::new(
            SensitivityAnalyzer::new(vec![SensitivityRule::new("contract", 0.6, "business", "en")])
                .unwrap(),
        );
        let engine = ModeDecisionEngine::new(
            analyzer,
            ModeThresholds::new(0.8, 0.3).unwrap(),
            ["credential"],
        )
        .unwrap();
        let decision = engine.decide("review this contract", &ctx("x"));
        assert_eq!(decision.mode, ExecutionMode::Hybrid);
        assert!(!decision.requires_confirmation);
    }

    #[test]
    fn test_local_without_confirm_category() {
        let engine = engine(0.8, 0.3);
        let content = "please rm -rf the build dir";
        let decision = engine.decide(content, &ctx(content));
        assert_eq!(decision.mode, ExecutionMode::LocalOnly);
        assert!(!decision.requires_confirmation);
    }

    #[test]
    fn test_partition_is_exhaustive_and_disjoint() {
        let threshold_pairs = [(0.8, 0.3), (0.5, 0.49), (1.0, 0.0), (0.31, 0.3)];
        for (lt, ct) in threshold_pairs {
            let engine = engine(lt, ct);
            for i in 0..=1000 {
                let s = i as f64 / 1000.0;
                let mode = engine.decide_score(s, BTreeSet::new()).mode;
                let expected = if s >= lt {
                    ExecutionMode::LocalOnly
                } else if s <= ct {
                    ExecutionMode::CloudSandbox
                } else {
                    ExecutionMode::Hybrid
                };
                assert_eq!(mode, expected, "score {} with lt={} ct={}", s, lt, ct);
            }
        }
    }

    #[test]
    fn test_decision_is_replayable() {
        let engine = engine(0.8, 0.3);
        let content = "transfer my balance to account number 42";
        let first = engine.decide(content, &ctx(content));
        let second = engine.decide(content, &ExecutionContext::new("other", "ignored"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_explain_mentions_mode_and_confirmation() {
        let engine = engine(0.8, 0.3);
        let mut categories = BTreeSet::new();
        categories.insert("credential".to_string());
        let decision = engine.decide_score(0.95, categories);
        let text = decision.explain();
        assert!(text.contains("local_only"));
        assert!(text.contains("credential"));
        assert!(text.contains("confirmation"));
    }
}
