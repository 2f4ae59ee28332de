// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// Types used by more than one module live here. Module-private types stay in their module.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A caller-supplied population name. It may not match any catalog identifier
/// verbatim (different platform suffix, historic spelling, missing era token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasRequest(String);

impl AliasRequest {
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AliasRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AliasRequest {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How an alias was mapped onto a catalog identifier. The declaration order is the
/// precedence order: earlier methods are always preferred and, for equal string
/// similarity, always report a higher confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMethod {
    Exact,
    SuffixVariant,
    GeographicContext,
    CulturalContext,
    StringDistance,
    AiAssisted,
    Fallback,
}

impl MatchMethod {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::SuffixVariant => "suffix-variant",
            Self::GeographicContext => "geographic-context",
            Self::CulturalContext => "cultural-context",
            Self::StringDistance => "string-distance",
            Self::AiAssisted => "ai-assisted",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// The outcome of resolving one alias. Created once per alias per session and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub alias: String,
    pub resolved_id: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub method: MatchMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl MatchResult {
    pub fn new(alias: &str, resolved_id: &str, confidence: f64, method: MatchMethod) -> Self {
        Self {
            alias: alias.to_string(),
            resolved_id: resolved_id.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            method,
            rationale: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// The three priority bands of the curated selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Essential,
    Supporting,
    Context,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Essential, Tier::Supporting, Tier::Context];

    pub fn index(self) -> usize {
        match self {
            Self::Essential => 0,
            Self::Supporting => 1,
            Self::Context => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Essential => "essential",
            Self::Supporting => "supporting",
            Self::Context => "context",
        })
    }
}

/// A catalog population together with the score that placed it in a tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPopulation {
    pub id: String,
    pub score: f64,
    /// Position in the catalog listing; the stable tie-break.
    pub catalog_index: usize,
}

/// One member of the proxy set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneticProxy {
    pub population_id: String,
    /// `1 - combined distance`, in `[0, 1]`.
    pub similarity: f64,
    /// Normalised share of the set; all weights sum to 1.
    pub weight: f64,
    pub distance: f64,
    pub shared_variants: usize,
}

/// The weighted set of reference populations standing in for the personal sample.
/// Construction goes through `proxy::identify_proxies`, which guarantees a
/// non-empty set with unique ids and weights summing to 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct GeneticProxySet {
    proxies: Vec<GeneticProxy>,
}

impl GeneticProxySet {
    pub(crate) fn from_normalised(proxies: Vec<GeneticProxy>) -> Self {
        Self { proxies }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GeneticProxy> {
        self.proxies.iter()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// The most similar proxy.
    pub fn top(&self) -> Option<&GeneticProxy> {
        self.proxies.first()
    }

    pub fn get(&self, population_id: &str) -> Option<&GeneticProxy> {
        self.proxies
            .iter()
            .find(|proxy| proxy.population_id == population_id)
    }

    pub fn weight_sum(&self) -> f64 {
        self.proxies.iter().map(|proxy| proxy.weight).sum()
    }
}

/// Which orchestration pass produced a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Global,
    Focused,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Global => "global",
            Self::Focused => "focused",
        })
    }
}

/// Goodness-of-fit bands used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitQuality {
    Excellent,
    Good,
    Marginal,
    Poor,
}

impl FitQuality {
    pub fn from_p_value(p_value: f64) -> Self {
        if p_value > 0.05 {
            Self::Excellent
        } else if p_value > 0.01 {
            Self::Good
        } else if p_value > 0.001 {
            Self::Marginal
        } else {
            Self::Poor
        }
    }
}

/// Weights outside `[-WEIGHT_TOLERANCE, 1 + WEIGHT_TOLERANCE]` make a fit infeasible.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// One successfully executed admixture model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AncestryModel {
    pub phase: Phase,
    pub proxy_used: String,
    pub config_name: String,
    /// Component label for each source, parallel to `source_ids`.
    pub components: Vec<String>,
    pub source_ids: Vec<String>,
    pub outgroup_ids: Vec<String>,
    pub weights: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub p_value: f64,
}

impl AncestryModel {
    pub fn fit_quality(&self) -> FitQuality {
        FitQuality::from_p_value(self.p_value)
    }

    /// A model contributes to consensus only when every number is finite and every
    /// weight is a feasible proportion.
    pub fn is_usable(&self) -> bool {
        self.p_value.is_finite()
            && self.weights.len() == self.source_ids.len()
            && self.std_errors.len() == self.source_ids.len()
            && self.std_errors.iter().all(|se| se.is_finite() && *se >= 0.0)
            && self
                .weights
                .iter()
                .all(|w| w.is_finite() && *w >= -WEIGHT_TOLERANCE && *w <= 1.0 + WEIGHT_TOLERANCE)
    }

    /// The grouping key for consensus: the ordered source configuration.
    pub fn source_key(&self) -> String {
        self.source_ids.join("+")
    }
}

/// A model execution that did not produce a fit. Kept for provenance only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelFailure {
    pub phase: Phase,
    pub proxy_used: String,
    pub config_name: String,
    pub source_ids: Vec<String>,
    pub reason: String,
}

pub type ModelOutcome = Result<AncestryModel, ModelFailure>;

/// Significance of a component estimate relative to its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignificanceLabel {
    HighlySignificant,
    Significant,
    Suggestive,
    NotSignificant,
}

impl SignificanceLabel {
    pub fn from_z(z: f64) -> Self {
        if z >= 3.0 {
            Self::HighlySignificant
        } else if z >= 2.0 {
            Self::Significant
        } else if z >= 1.0 {
            Self::Suggestive
        } else {
            Self::NotSignificant
        }
    }

    /// One step down, used when an input population was only loosely resolved.
    pub fn demoted(self) -> Self {
        match self {
            Self::HighlySignificant => Self::Significant,
            Self::Significant => Self::Suggestive,
            Self::Suggestive | Self::NotSignificant => Self::NotSignificant,
        }
    }
}

/// How strongly independent secondary tests back a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorroborationLevel {
    Strong,
    Moderate,
    Weak,
    Conflicting,
}

impl CorroborationLevel {
    pub fn from_counts(agreeing: usize, conflicting: usize) -> Self {
        if conflicting > 0 && conflicting >= agreeing {
            Self::Conflicting
        } else if agreeing >= 2 {
            Self::Strong
        } else if agreeing == 1 {
            Self::Moderate
        } else {
            Self::Weak
        }
    }
}

/// Whether a component came from the primary method or from the degraded path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStatus {
    Calculated,
    Estimated,
}

/// One line of the final ancestry breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusComponent {
    pub component_name: String,
    pub point_estimate_pct: f64,
    pub std_error_pct: f64,
    /// `(lower, upper)` in percent, clamped to `[0, 100]`.
    pub confidence_interval: (f64, f64),
    pub significance_label: SignificanceLabel,
    pub corroboration_level: CorroborationLevel,
    pub status: EstimateStatus,
    pub low_confidence_resolution: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(weights: Vec<f64>) -> AncestryModel {
        AncestryModel {
            phase: Phase::Focused,
            proxy_used: "Proxy".into(),
            config_name: "three_way".into(),
            components: vec!["A".into(), "B".into()],
            source_ids: vec!["PopA".into(), "PopB".into()],
            outgroup_ids: vec![],
            weights,
            std_errors: vec![0.02, 0.02],
            p_value: 0.2,
        }
    }

    #[test]
    fn match_methods_order_by_precedence() {
        assert!(MatchMethod::Exact < MatchMethod::SuffixVariant);
        assert!(MatchMethod::SuffixVariant < MatchMethod::GeographicContext);
        assert!(MatchMethod::CulturalContext < MatchMethod::StringDistance);
        assert!(MatchMethod::StringDistance < MatchMethod::AiAssisted);
        assert_eq!(MatchMethod::SuffixVariant.to_string(), "suffix-variant");
    }

    #[test]
    fn match_result_confidence_is_clamped() {
        let result = MatchResult::new("a", "b", 1.7, MatchMethod::AiAssisted);
        assert_eq!(result.confidence, 1.0);
        let result = MatchResult::new("a", "b", -0.2, MatchMethod::AiAssisted);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn infeasible_weights_make_a_model_unusable() {
        assert!(model(vec![0.6, 0.4]).is_usable());
        assert!(!model(vec![1.2, -0.2]).is_usable());
        assert!(!model(vec![f64::NAN, 0.4]).is_usable());
    }

    #[test]
    fn corroboration_levels_follow_counts() {
        assert_eq!(CorroborationLevel::from_counts(2, 0), CorroborationLevel::Strong);
        assert_eq!(CorroborationLevel::from_counts(1, 0), CorroborationLevel::Moderate);
        assert_eq!(CorroborationLevel::from_counts(0, 0), CorroborationLevel::Weak);
        assert_eq!(CorroborationLevel::from_counts(1, 1), CorroborationLevel::Conflicting);
        assert_eq!(CorroborationLevel::from_counts(3, 1), CorroborationLevel::Strong);
    }

    #[test]
    fn fit_quality_bands() {
        assert_eq!(FitQuality::from_p_value(0.08), FitQuality::Excellent);
        assert_eq!(FitQuality::from_p_value(0.03), FitQuality::Good);
        assert_eq!(FitQuality::from_p_value(0.005), FitQuality::Marginal);
        assert_eq!(FitQuality::from_p_value(1e-6), FitQuality::Poor);
    }

    #[test]
    fn significance_demotes_one_step() {
        assert_eq!(SignificanceLabel::from_z(3.5), SignificanceLabel::HighlySignificant);
        assert_eq!(
            SignificanceLabel::HighlySignificant.demoted(),
            SignificanceLabel::Significant
        );
        assert_eq!(
            SignificanceLabel::NotSignificant.demoted(),
            SignificanceLabel::NotSignificant
        );
    }
}
