//! The structured artifact written at the end of an analysis. Field names are part
//! of the output contract; downstream reporting reads them verbatim.

use crate::consensus::{ConsensusResult, PrimaryModel};
use crate::memory::{ExtractionSet, MemoryBudget, ScaledSelection, ScalingDecision, ScalingState};
use crate::orchestrate::{OrchestrationReport, UnexpectedAncestry};
use crate::proxy::CandidateDistance;
use crate::types::{
    AncestryModel, ConsensusComponent, EstimateStatus, FitQuality, GeneticProxy, GeneticProxySet,
    MatchMethod, MatchResult, ModelOutcome, Phase, Tier,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// How many of the ranked candidate distances the export lists.
pub const CLOSEST_POPULATIONS: usize = 20;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write export to {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to serialise export: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelOutcomeKind {
    Success,
    Failure,
}

/// One executed model, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRecord {
    pub phase: Phase,
    pub proxy: String,
    pub config: String,
    pub sources: Vec<String>,
    pub outcome: ModelOutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit_quality: Option<FitQuality>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub weights: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ModelOutcome> for ModelRecord {
    fn from(outcome: &ModelOutcome) -> Self {
        match outcome {
            Ok(model) => Self {
                phase: model.phase,
                proxy: model.proxy_used.clone(),
                config: model.config_name.clone(),
                sources: model.source_ids.clone(),
                outcome: ModelOutcomeKind::Success,
                p_value: Some(model.p_value),
                fit_quality: Some(model.fit_quality()),
                weights: model.weights.clone(),
                error: None,
            },
            Err(failure) => Self {
                phase: failure.phase,
                proxy: failure.proxy_used.clone(),
                config: failure.config_name.clone(),
                sources: failure.source_ids.clone(),
                outcome: ModelOutcomeKind::Failure,
                p_value: None,
                fit_quality: None,
                weights: Vec::new(),
                error: Some(failure.reason.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestModelSummary {
    pub config: String,
    pub phase: Phase,
    pub proxy: String,
    pub sources: Vec<String>,
    pub p_value: f64,
    pub fit_quality: FitQuality,
}

impl From<&AncestryModel> for BestModelSummary {
    fn from(model: &AncestryModel) -> Self {
        Self {
            config: model.config_name.clone(),
            phase: model.phase,
            proxy: model.proxy_used.clone(),
            sources: model.source_ids.clone(),
            p_value: model.p_value,
            fit_quality: model.fit_quality(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BestModelsExport {
    pub overall: Option<BestModelSummary>,
    pub global: Option<BestModelSummary>,
    pub focused: Option<BestModelSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionRecord {
    pub alias: String,
    pub id: String,
    pub confidence: f64,
    pub method: MatchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl From<&MatchResult> for ResolutionRecord {
    fn from(result: &MatchResult) -> Self {
        Self {
            alias: result.alias.clone(),
            id: result.resolved_id.clone(),
            confidence: result.confidence,
            method: result.method,
            rationale: result.rationale.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosestPopulation {
    pub population: String,
    pub distance: f64,
    pub similarity: f64,
    pub shared_variants: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coverage {
    pub essential: usize,
    pub supporting: usize,
    pub context: usize,
    pub expansion: usize,
    pub removed: usize,
    pub total_populations: usize,
    pub baseline_memory: f64,
    pub estimated_memory: f64,
    /// Populations statistics are extracted for, selection and model plan together.
    pub extracted_populations: usize,
    pub extraction_memory: f64,
    pub limits: MemoryBudget,
    pub final_state: ScalingState,
    pub decisions: Vec<ScalingDecision>,
}

impl Coverage {
    pub fn from_selection(
        selection: &ScaledSelection,
        extraction: &ExtractionSet,
        limits: &MemoryBudget,
    ) -> Self {
        Self {
            essential: selection.tier(Tier::Essential).len(),
            supporting: selection.tier(Tier::Supporting).len(),
            context: selection.tier(Tier::Context).len(),
            expansion: selection.expansion.len(),
            removed: selection.removed.len(),
            total_populations: selection.len(),
            baseline_memory: selection.baseline,
            estimated_memory: selection.estimated_cost,
            extracted_populations: extraction.len(),
            extraction_memory: extraction.estimated_cost,
            limits: *limits,
            final_state: selection.final_state,
            decisions: selection.decisions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisExport {
    pub sample_id: String,
    pub generated_at: String,
    pub profile: String,
    pub status: EstimateStatus,
    pub components: Vec<ConsensusComponent>,
    pub primary_model: Option<PrimaryModel>,
    pub models: Vec<ModelRecord>,
    pub best_models: BestModelsExport,
    pub proxies: Vec<GeneticProxy>,
    pub closest_populations: Vec<ClosestPopulation>,
    pub unexpected_ancestry: Vec<UnexpectedAncestry>,
    pub resolutions: Vec<ResolutionRecord>,
    pub coverage: Coverage,
}

/// Borrowed results of a finished analysis.
pub struct ExportInputs<'a> {
    pub sample_id: &'a str,
    pub profile: &'a str,
    pub consensus: &'a ConsensusResult,
    pub report: &'a OrchestrationReport,
    pub proxies: &'a GeneticProxySet,
    pub distances: &'a [CandidateDistance],
    pub resolutions: &'a [MatchResult],
    pub selection: &'a ScaledSelection,
    pub extraction: &'a ExtractionSet,
    pub budget: &'a MemoryBudget,
}

impl AnalysisExport {
    pub fn assemble(inputs: &ExportInputs<'_>, generated_at: DateTime<Utc>) -> Self {
        let best = &inputs.report.best;
        Self {
            sample_id: inputs.sample_id.to_string(),
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            profile: inputs.profile.to_string(),
            status: inputs.consensus.status,
            components: inputs.consensus.components.clone(),
            primary_model: inputs.consensus.primary.clone(),
            models: inputs.report.outcomes().map(ModelRecord::from).collect(),
            best_models: BestModelsExport {
                overall: best.overall.as_ref().map(BestModelSummary::from),
                global: best.global.as_ref().map(BestModelSummary::from),
                focused: best.focused.as_ref().map(BestModelSummary::from),
            },
            proxies: inputs.proxies.iter().cloned().collect(),
            closest_populations: inputs
                .distances
                .iter()
                .take(CLOSEST_POPULATIONS)
                .map(|candidate| ClosestPopulation {
                    population: candidate.population_id.clone(),
                    distance: candidate.distance,
                    similarity: candidate.similarity,
                    shared_variants: candidate.shared_variants,
                })
                .collect(),
            unexpected_ancestry: inputs.report.interpretation.unexpected.clone(),
            resolutions: inputs.resolutions.iter().map(ResolutionRecord::from).collect(),
            coverage: Coverage::from_selection(inputs.selection, inputs.extraction, inputs.budget),
        }
    }

    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), ExportError> {
        let json = self.to_json()?;
        fs::write(path, json).map_err(|source| ExportError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelFailure;

    #[test]
    fn model_records_keep_failures() {
        let failure: ModelOutcome = Err(ModelFailure {
            phase: Phase::Focused,
            proxy_used: "Pathan.DG".into(),
            config_name: "four_way_bmac".into(),
            source_ids: vec!["Iran_GanjDareh_N".into()],
            reason: "singular matrix".into(),
        });
        let record = ModelRecord::from(&failure);
        assert_eq!(record.outcome, ModelOutcomeKind::Failure);
        assert_eq!(record.error.as_deref(), Some("singular matrix"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert!(json.get("p_value").is_none());
    }

    #[test]
    fn successful_records_carry_fit_quality() {
        let success: ModelOutcome = Ok(AncestryModel {
            phase: Phase::Global,
            proxy_used: "Pathan.DG".into(),
            config_name: "global_screen".into(),
            components: vec!["Steppe".into()],
            source_ids: vec!["Yamnaya_Samara".into()],
            outgroup_ids: vec![],
            weights: vec![1.0],
            std_errors: vec![0.01],
            p_value: 0.2,
        });
        let json = serde_json::to_value(ModelRecord::from(&success)).unwrap();
        assert_eq!(json["fit_quality"], "excellent");
        assert_eq!(json["phase"], "global");
        assert_eq!(json["outcome"], "success");
    }

    #[test]
    fn resolution_records_use_stable_names() {
        let result = MatchResult::new("Yamnaya", "Russia_Samara_EBA_Yamnaya", 0.83, MatchMethod::CulturalContext);
        let json = serde_json::to_value(ResolutionRecord::from(&result)).unwrap();
        assert_eq!(json["id"], "Russia_Samara_EBA_Yamnaya");
        assert_eq!(json["method"], "cultural-context");
    }
}
