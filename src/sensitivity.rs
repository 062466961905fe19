//! Sensitivity scoring for free text
//!
//! Scores input against a data-driven rule table of
//! `(pattern, weight, category, locale)` entries. Every locale's rules are
//! applied to every input; there is no language detection, so a sentence
//! mixing scripts is checked against all of them.
//!
//! Matched weights are folded into one score by a [`ScoreCombiner`]. The
//! default is [`ProbabilisticOr`]: `1 − Π(1 − wᵢ)` over distinct matched
//! rules, so one strong match dominates and several medium matches compound
//! toward 1 without ever leaving `[0, 1]`.

use crate::error::{GateError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::RwLock;
use unicode_normalization::UnicodeNormalization;

/// One row of the sensitivity rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityRule {
    /// Regex applied case-insensitively to normalized text
    pub pattern: String,
    /// Contribution in `[0, 1]`
    pub weight: f64,
    /// Category label (credential, financial, identity, ...)
    pub category: String,
    /// Locale tag the pattern was written for (`zh-Hant`, `en`, `any`, ...)
    pub locale: String,
}

impl SensitivityRule {
    /// Create a new rule
    pub fn new(
        pattern: impl Into<String>,
        weight: f64,
        category: impl Into<String>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            weight,
            category: category.into(),
            locale: locale.into(),
        }
    }

    fn key(&self) -> (&str, &str, &str) {
        (&self.pattern, &self.category, &self.locale)
    }
}

/// A rule that matched during analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub category: String,
    pub locale: String,
    pub weight: f64,
    pub pattern: String,
}

/// Result of scoring one piece of text
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensitivityAnalysis {
    /// Combined score in `[0, 1]`
    pub score: f64,
    /// Distinct rules that matched, in table order
    pub matched: Vec<RuleMatch>,
    /// Categories of the matched rules
    pub categories: BTreeSet<String>,
}

impl SensitivityAnalysis {
    /// Whether any identity (PII) rule matched
    pub fn has_pii(&self) -> bool {
        self.categories.contains("identity")
    }

    /// Whether any credential rule matched
    pub fn has_credential(&self) -> bool {
        self.categories.contains("credential")
    }
}

/// Folds matched rule weights into a single score
///
/// Implementations must return a value in `[0, 1]` for weights in `[0, 1]`
/// and `0.0` for an empty slice.
pub trait ScoreCombiner: Send + Sync {
    /// Combine the weights of distinct matched rules
    fn combine(&self, weights: &[f64]) -> f64;

    /// Name for logs
    fn name(&self) -> &str;
}

/// `1 − Π(1 − wᵢ)`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbabilisticOr;

impl ScoreCombiner for ProbabilisticOr {
    fn combine(&self, weights: &[f64]) -> f64 {
        let miss: f64 = weights
            .iter()
            .map(|w| 1.0 - w.clamp(0.0, 1.0))
            .product();
        (1.0 - miss).clamp(0.0, 1.0)
    }

    fn name(&self) -> &str {
        "probabilistic_or"
    }
}

/// Highest single weight wins
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxWeight;

impl ScoreCombiner for MaxWeight {
    fn combine(&self, weights: &[f64]) -> f64 {
        weights
            .iter()
            .fold(0.0_f64, |acc, w| acc.max(w.clamp(0.0, 1.0)))
    }

    fn name(&self) -> &str {
        "max_weight"
    }
}

/// Case-fold and NFKC-normalize text before matching
pub fn normalize(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

struct CompiledRule {
    rule: SensitivityRule,
    regex: Regex,
}

fn compile(rule: SensitivityRule) -> Result<CompiledRule> {
    if !rule.weight.is_finite() || !(0.0..=1.0).contains(&rule.weight) {
        return Err(GateError::Configuration(format!(
            "Sensitivity rule weight must be within [0, 1], got {} for pattern '{}'",
            rule.weight, rule.pattern
        )));
    }
    if rule.category.trim().is_empty() {
        return Err(GateError::Configuration(format!(
            "Sensitivity rule '{}' has an empty category",
            rule.pattern
        )));
    }
    // Patterns see NFKC text; case is handled by the (?i) flag so escapes
    // like \D or \S keep their meaning.
    let pattern: String = rule.pattern.nfkc().collect();
    let regex = Regex::new(&format!("(?i){}", pattern)).map_err(|e| {
        GateError::Configuration(format!(
            "Invalid sensitivity pattern '{}': {}",
            rule.pattern, e
        ))
    })?;
    Ok(CompiledRule { rule, regex })
}

/// Scores text against an appendable rule table
pub struct SensitivityAnalyzer {
    rules: RwLock<Vec<CompiledRule>>,
    combiner: Box<dyn ScoreCombiner>,
}

impl SensitivityAnalyzer {
    /// Create an analyzer over the given rules with probabilistic-OR
    pub fn new(rules: Vec<SensitivityRule>) -> Result<Self> {
        Self::with_combiner(rules, Box::new(ProbabilisticOr))
    }

    /// Create an analyzer with the built-in multilingual rule table
    pub fn with_default_rules() -> Result<Self> {
        Self::new(default_rules())
    }

    /// Create an analyzer with a custom combination function
    pub fn with_combiner(
        rules: Vec<SensitivityRule>,
        combiner: Box<dyn ScoreCombiner>,
    ) -> Result<Self> {
        let analyzer = Self {
            rules: RwLock::new(Vec::with_capacity(rules.len())),
            combiner,
        };
        for rule in rules {
            analyzer.add_rule(rule)?;
        }
        Ok(analyzer)
    }

    /// Append a rule at runtime
    ///
    /// Returns `false` if an identical rule (same pattern, category and
    /// locale) is already present.
    pub fn add_rule(&self, rule: SensitivityRule) -> Result<bool> {
        let compiled = compile(rule)?;
        let mut rules = self
            .rules
            .write()
            .map_err(|e| GateError::Internal(format!("Rule table lock poisoned: {}", e)))?;
        if rules.iter().any(|r| r.rule.key() == compiled.rule.key()) {
            return Ok(false);
        }
        tracing::debug!(
            category = %compiled.rule.category,
            locale = %compiled.rule.locale,
            weight = compiled.rule.weight,
            "Sensitivity rule added"
        );
        rules.push(compiled);
        Ok(true)
    }

    /// Snapshot of the current rule table
    pub fn rules(&self) -> Vec<SensitivityRule> {
        match self.rules.read() {
            Ok(rules) => rules.iter().map(|r| r.rule.clone()).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|r| r.rule.clone())
                .collect(),
        }
    }

    /// Number of rules in the table
    pub fn len(&self) -> usize {
        self.rules.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the active combiner
    pub fn combiner_name(&self) -> &str {
        self.combiner.name()
    }

    /// Score a piece of text
    pub fn analyze(&self, text: &str) -> SensitivityAnalysis {
        if text.trim().is_empty() {
            return SensitivityAnalysis::default();
        }
        let normalized = normalize(text);

        let rules = match self.rules.read() {
            Ok(rules) => rules,
            Err(poisoned) => poisoned.into_inner(),
        };

        let matched: Vec<RuleMatch> = rules
            .iter()
            .filter(|r| r.regex.is_match(&normalized))
            .map(|r| RuleMatch {
                category: r.rule.category.clone(),
                locale: r.rule.locale.clone(),
                weight: r.rule.weight,
                pattern: r.rule.pattern.clone(),
            })
            .collect();

        let weights: Vec<f64> = matched.iter().map(|m| m.weight).collect();
        let score = self.combiner.combine(&weights).clamp(0.0, 1.0);
        let categories = matched.iter().map(|m| m.category.clone()).collect();

        SensitivityAnalysis {
            score,
            matched,
            categories,
        }
    }
}

impl std::fmt::Debug for SensitivityAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensitivityAnalyzer")
            .field("rules", &self.len())
            .field("combiner", &self.combiner.name())
            .finish()
    }
}

/// Built-in multilingual rule table
///
/// Traditional Chinese, Simplified Chinese and English variants are kept as
/// separate rows so each can be tuned or removed independently.
pub fn default_rules() -> Vec<SensitivityRule> {
    let rows: &[(&str, f64, &str, &str)] = &[
        // credentials
        ("密碼|密鑰", 0.95, "credential", "zh-Hant"),
        ("密码|密钥", 0.95, "credential", "zh-Hans"),
        (
            r"\bpassw(or)?d\b|private[ _-]?key|api[ _-]?key|secret[ _-]?key",
            0.95,
            "credential",
            "en",
        ),
        // financial
        ("信用卡", 0.9, "financial", "zh"),
        (r"credit[ _-]?card|\bcvv\b", 0.9, "financial", "en"),
        (r"\b\d{16}\b", 0.9, "financial", "any"),
        ("轉帳|匯款", 0.85, "financial", "zh-Hant"),
        ("转账|汇款", 0.85, "financial", "zh-Hans"),
        (r"\btransfer\b|\bbalance\b", 0.85, "financial", "en"),
        ("銀行帳號", 0.8, "financial", "zh-Hant"),
        ("银行账号", 0.8, "financial", "zh-Hans"),
        (r"account[ _-]?number", 0.8, "financial", "en"),
        // identity
        ("身份證|身分證", 0.95, "identity", "zh-Hant"),
        ("身份证|身分证", 0.95, "identity", "zh-Hans"),
        (r"\bid[ _-]?card\b", 0.95, "identity", "en"),
        ("護照", 0.9, "identity", "zh-Hant"),
        ("护照", 0.9, "identity", "zh-Hans"),
        (r"\bpassport\b", 0.9, "identity", "en"),
        ("手機號", 0.7, "identity", "zh-Hant"),
        ("手机号", 0.7, "identity", "zh-Hans"),
        (r"\bphone\b", 0.7, "identity", "en"),
        (r"\b1[3-9]\d{9}\b", 0.7, "identity", "any"),
        ("地址|住址", 0.6, "identity", "zh"),
        (r"\baddress\b", 0.6, "identity", "en"),
        ("姓名", 0.5, "identity", "zh"),
        (r"\bfull name\b", 0.5, "identity", "en"),
        // system operations
        ("刪除", 0.85, "system", "zh-Hant"),
        ("删除", 0.85, "system", "zh-Hans"),
        (r"\b(delete|drop|truncate)\b", 0.85, "system", "en"),
        ("修改", 0.75, "system", "zh"),
        (r"\b(update|alter)\b", 0.75, "system", "en"),
        ("執行", 0.7, "system", "zh-Hant"),
        ("执行", 0.7, "system", "zh-Hans"),
        (r"\b(exec|eval)\b", 0.7, "system", "en"),
        (r"rm\s+-rf|chmod\s+777", 0.95, "system", "any"),
        // business
        ("營業額", 0.75, "business", "zh-Hant"),
        ("营业额", 0.75, "business", "zh-Hans"),
        (r"\b(revenue|profit)\b", 0.75, "business", "en"),
        ("客戶名單", 0.8, "business", "zh-Hant"),
        ("客户名单", 0.8, "business", "zh-Hans"),
        (r"customer[ _-]?list", 0.8, "business", "en"),
        ("合約", 0.6, "business", "zh-Hant"),
        ("合约", 0.6, "business", "zh-Hans"),
        (r"\b(contract|agreement)\b", 0.6, "business", "en"),
    ];

    rows.iter()
        .map(|(pattern, weight, category, locale)| {
            SensitivityRule::new(*pattern, *weight, *category, *locale)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SensitivityAnalyzer {
        SensitivityAnalyzer::with_default_rules().unwrap()
    }

    #[test]
    fn test_empty_input_scores_zero() {
        let result = analyzer().analyze("");
        assert_eq!(result.score, 0.0);
        assert!(result.matched.is_empty());
        assert_eq!(analyzer().analyze("   \n").score, 0.0);
    }

    #[test]
    fn test_traditional_chinese_credential() {
        let result = analyzer().analyze("我的密碼是 123456");
        assert!((result.score - 0.95).abs() < 1e-9);
        assert!(result.has_credential());
        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].locale, "zh-Hant");
    }

    #[test]
    fn test_benign_chinese_scores_zero() {
        let result = analyzer().analyze("今天天氣如何？");
        assert_eq!(result.score, 0.0);
        assert!(result.categories.is_empty());
    }

    #[test]
    fn test_mixed_language_input_hits_every_locale() {
        let result = analyzer().analyze("Please 轉帳 to my account number");
        let locales: BTreeSet<_> = result.matched.iter().map(|m| m.locale.as_str()).collect();
        assert!(locales.contains("zh-Hant"));
        assert!(locales.contains("en"));
        assert!(result.score > 0.85);
    }

    #[test]
    fn test_case_folding_and_width_normalization() {
        // Full-width Latin letters fold to ASCII under NFKC.
        let result = analyzer().analyze("ＰＡＳＳＷＯＲＤ reset");
        assert!(result.has_credential());

        let result = analyzer().analyze("My PassPort expired");
        assert!(result.has_pii());
    }

    #[test]
    fn test_probabilistic_or_compounds() {
        let combiner = ProbabilisticOr;
        assert_eq!(combiner.combine(&[]), 0.0);
        assert!((combiner.combine(&[0.95]) - 0.95).abs() < 1e-12);
        assert!((combiner.combine(&[0.5, 0.5]) - 0.75).abs() < 1e-12);
        assert!((combiner.combine(&[0.6, 0.6, 0.6]) - 0.936).abs() < 1e-12);
        assert_eq!(combiner.combine(&[1.0, 0.2]), 1.0);
    }

    #[test]
    fn test_max_weight_combiner() {
        let combiner = MaxWeight;
        assert_eq!(combiner.combine(&[]), 0.0);
        assert_eq!(combiner.combine(&[0.5, 0.9, 0.2]), 0.9);
    }

    #[test]
    fn test_combiner_is_swappable() {
        let rules = vec![
            SensitivityRule::new("alpha", 0.5, "a", "en"),
            SensitivityRule::new("beta", 0.5, "b", "en"),
        ];
        let or = SensitivityAnalyzer::new(rules.clone()).unwrap();
        let max = SensitivityAnalyzer::with_combiner(rules, Box::new(MaxWeight)).unwrap();
        assert!((or.analyze("alpha beta").score - 0.75).abs() < 1e-12);
        assert_eq!(max.analyze("alpha beta").score, 0.5);
        assert_eq!(max.combiner_name(), "max_weight");
    }

    #[test]
    fn test_rule_counted_once_per_input() {
        let analyzer =
            SensitivityAnalyzer::new(vec![SensitivityRule::new("token", 0.5, "c", "en")]).unwrap();
        let result = analyzer.analyze("token token token");
        assert_eq!(result.matched.len(), 1);
        assert!((result.score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_add_rule_at_runtime() {
        let analyzer = SensitivityAnalyzer::new(Vec::new()).unwrap();
        assert!(analyzer.is_empty());
        assert_eq!(analyzer.analyze("project falcon").score, 0.0);

        assert!(analyzer
            .add_rule(SensitivityRule::new("falcon", 0.7, "business", "en"))
            .unwrap());
        assert!(!analyzer
            .add_rule(SensitivityRule::new("falcon", 0.7, "business", "en"))
            .unwrap());
        assert_eq!(analyzer.len(), 1);
        assert!((analyzer.analyze("Project FALCON").score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let analyzer = SensitivityAnalyzer::new(Vec::new()).unwrap();
        assert!(analyzer
            .add_rule(SensitivityRule::new("x", 1.5, "c", "en"))
            .is_err());
        assert!(analyzer
            .add_rule(SensitivityRule::new("x", f64::NAN, "c", "en"))
            .is_err());
        assert!(analyzer
            .add_rule(SensitivityRule::new("(", 0.5, "c", "en"))
            .is_err());
        assert!(analyzer
            .add_rule(SensitivityRule::new("x", 0.5, " ", "en"))
            .is_err());
    }

    #[test]
    fn test_score_always_in_unit_interval() {
        let analyzer = analyzer();
        let inputs = [
            "",
            "hello",
            "password credit card passport delete revenue 4111111111111111",
            "密碼 密码 身份證 护照 刪除 rm -rf / chmod 777",
            "🦞🦞🦞",
        ];
        for input in inputs {
            let score = analyzer.analyze(input).score;
            assert!((0.0..=1.0).contains(&score), "{} -> {}", input, score);
        }
    }
}
