// ========================================================================================
//
//                              Consensus and Confidence Engine
//
// ========================================================================================
//
// Usable focused models are grouped by their exact source configuration. The group
// with the best combined fit becomes the primary model; its pooled estimates are
// then widened or narrowed according to how many independent secondary tests back
// each component.

use crate::orchestrate::{Interpretation, SecondaryKind, SecondaryTest};
use crate::types::{
    AncestryModel, ConsensusComponent, CorroborationLevel, EstimateStatus, FitQuality,
    GeneticProxySet, SignificanceLabel,
};
use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConsensusError {
    #[error("No usable admixture model was produced; nothing can be reported.")]
    NoUsableModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    pub f3_z_threshold: f64,
    pub ratio_agreement_tolerance: f64,
    pub ratio_conflict_tolerance: f64,
    pub confidence_z: f64,
    pub strong_factor: f64,
    pub moderate_factor: f64,
    pub weak_factor: f64,
    pub conflicting_factor: f64,
    /// Applied to the global standard errors on the degraded path.
    pub fallback_factor: f64,
    pub p_value_floor: f64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            f3_z_threshold: 3.0,
            ratio_agreement_tolerance: 0.10,
            ratio_conflict_tolerance: 0.25,
            confidence_z: 1.96,
            strong_factor: 0.8,
            moderate_factor: 1.0,
            weak_factor: 1.5,
            conflicting_factor: 2.0,
            fallback_factor: 1.5,
            p_value_floor: 1e-300,
        }
    }
}

impl ConsensusSettings {
    pub fn uncertainty_factor(&self, level: CorroborationLevel) -> f64 {
        match level {
            CorroborationLevel::Strong => self.strong_factor,
            CorroborationLevel::Moderate => self.moderate_factor,
            CorroborationLevel::Weak => self.weak_factor,
            CorroborationLevel::Conflicting => self.conflicting_factor,
        }
    }
}

/// Weighted mean and pooled standard error of `(weight, value, std_error)` triples.
///
/// Weights are normalised first; when they sum to zero every value counts equally.
/// The standard error combines the within-model variance with the spread between
/// models: `sqrt(sum w*se^2 + sum w*(x - mean)^2)`.
pub fn pooled_estimate(values: &[(f64, f64, f64)]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let total: f64 = values.iter().map(|(w, ..)| w.max(0.0)).sum();
    let weights: Vec<f64> = if total > 0.0 {
        values.iter().map(|(w, ..)| w.max(0.0) / total).collect()
    } else {
        vec![1.0 / values.len() as f64; values.len()]
    };
    let mean: f64 = weights.iter().zip(values).map(|(w, (_, x, _))| w * x).sum();
    let variance: f64 = weights
        .iter()
        .zip(values)
        .map(|(w, (_, x, se))| w * se * se + w * (x - mean).powi(2))
        .sum();
    Some((mean, variance.sqrt()))
}

/// Models sharing one exact source configuration, pooled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelGroup {
    pub source_key: String,
    pub components: Vec<String>,
    pub source_ids: Vec<String>,
    pub config_names: Vec<String>,
    pub model_count: usize,
    pub weights: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub geometric_p: f64,
}

impl ModelGroup {
    pub fn fit_quality(&self) -> FitQuality {
        FitQuality::from_p_value(self.geometric_p)
    }
}

fn geometric_mean_p(p_values: impl Iterator<Item = f64>, floor: f64) -> f64 {
    let logs: Vec<f64> = p_values.map(|p| p.max(floor).ln()).collect();
    if logs.is_empty() {
        return 0.0;
    }
    (logs.iter().sum::<f64>() / logs.len() as f64).exp()
}

/// Groups usable focused models by source key, in key order.
pub fn group_models(
    models: &[&AncestryModel],
    proxies: &GeneticProxySet,
    settings: &ConsensusSettings,
) -> Vec<ModelGroup> {
    let by_key = models
        .iter()
        .copied()
        .filter(|model| model.is_usable())
        .into_group_map_by(|model| model.source_key());
    by_key
        .into_iter()
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(source_key, members)| {
            let first = members[0];
            let (weights, std_errors): (Vec<f64>, Vec<f64>) = (0..first.source_ids.len())
                .map(|idx| {
                    let values: Vec<(f64, f64, f64)> = members
                        .iter()
                        .map(|&m| {
                            let similarity = proxies.get(&m.proxy_used).map_or(0.0, |p| p.similarity);
                            (similarity, m.weights[idx], m.std_errors[idx])
                        })
                        .collect();
                    pooled_estimate(&values).unwrap_or((0.0, 0.0))
                })
                .unzip();
            ModelGroup {
                source_key,
                components: first.components.clone(),
                source_ids: first.source_ids.clone(),
                config_names: members.iter().map(|m| m.config_name.clone()).unique().collect(),
                model_count: members.len(),
                weights,
                std_errors,
                geometric_p: geometric_mean_p(members.iter().map(|m| m.p_value), settings.p_value_floor),
            }
        })
        .collect()
}

/// Highest geometric p; ties go to more models, then the smaller key.
pub fn primary_group(groups: &[ModelGroup]) -> Option<&ModelGroup> {
    groups.iter().min_by(|a, b| {
        b.geometric_p
            .partial_cmp(&a.geometric_p)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.model_count.cmp(&a.model_count))
            .then_with(|| a.source_key.cmp(&b.source_key))
    })
}

/// `(agreeing, conflicting)` secondary tests for one source of the primary group.
pub fn corroboration_counts(
    source_id: &str,
    point: f64,
    source_key: &str,
    tests: &[SecondaryTest],
    settings: &ConsensusSettings,
) -> (usize, usize) {
    let mut agreeing = 0;
    let mut conflicting = 0;
    for test in tests.iter().filter(|t| t.source_key == source_key) {
        let z = test.statistic.z;
        match &test.kind {
            SecondaryKind::F3 { a, b } if a == source_id || b == source_id => {
                if z <= -settings.f3_z_threshold {
                    agreeing += 1;
                } else if z >= settings.f3_z_threshold {
                    conflicting += 1;
                }
            }
            SecondaryKind::Ratio { source, .. } if source == source_id => {
                let gap = (test.statistic.estimate - point).abs();
                if gap <= settings.ratio_agreement_tolerance {
                    agreeing += 1;
                } else if gap > settings.ratio_conflict_tolerance {
                    conflicting += 1;
                }
            }
            _ => {}
        }
    }
    (agreeing, conflicting)
}

/// Builds one reported component from a proportion and its standard error.
fn component(
    name: &str,
    point: f64,
    std_error: f64,
    level: CorroborationLevel,
    status: EstimateStatus,
    low_confidence_resolution: bool,
    settings: &ConsensusSettings,
) -> ConsensusComponent {
    let point_pct = point * 100.0;
    let se_pct = std_error * 100.0;
    let half_width = settings.confidence_z * se_pct;
    let z = if std_error > 0.0 {
        point / std_error
    } else if point > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    let mut label = SignificanceLabel::from_z(z);
    if low_confidence_resolution {
        label = label.demoted();
    }
    ConsensusComponent {
        component_name: name.to_string(),
        point_estimate_pct: point_pct,
        std_error_pct: se_pct,
        confidence_interval: (
            (point_pct - half_width).clamp(0.0, 100.0),
            (point_pct + half_width).clamp(0.0, 100.0),
        ),
        significance_label: label,
        corroboration_level: level,
        status,
        low_confidence_resolution,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimaryModel {
    pub source_ids: Vec<String>,
    pub config_names: Vec<String>,
    pub geometric_p: f64,
    pub fit_quality: FitQuality,
    pub model_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusResult {
    pub status: EstimateStatus,
    pub components: Vec<ConsensusComponent>,
    pub primary: Option<PrimaryModel>,
    pub groups: Vec<ModelGroup>,
}

/// Everything the consensus step reads.
pub struct ConsensusInputs<'a> {
    pub focused: &'a [&'a AncestryModel],
    pub proxies: &'a GeneticProxySet,
    pub tests: &'a [SecondaryTest],
    pub interpretation: &'a Interpretation,
    pub low_confidence_ids: &'a BTreeSet<String>,
}

pub fn build_consensus(
    inputs: &ConsensusInputs<'_>,
    settings: &ConsensusSettings,
) -> Result<ConsensusResult, ConsensusError> {
    let groups = group_models(inputs.focused, inputs.proxies, settings);
    let Some(primary) = primary_group(&groups) else {
        return fallback(inputs, settings);
    };
    info!(
        "Primary model {} from {} fit(s), geometric p = {:.3e}",
        primary.source_key, primary.model_count, primary.geometric_p
    );

    let components = primary
        .components
        .iter()
        .zip(&primary.source_ids)
        .enumerate()
        .map(|(idx, (name, source_id))| {
            let point = primary.weights[idx];
            let (agreeing, conflicting) =
                corroboration_counts(source_id, point, &primary.source_key, inputs.tests, settings);
            let level = CorroborationLevel::from_counts(agreeing, conflicting);
            let adjusted_se = primary.std_errors[idx] * settings.uncertainty_factor(level);
            component(
                name,
                point,
                adjusted_se,
                level,
                EstimateStatus::Calculated,
                inputs.low_confidence_ids.contains(source_id),
                settings,
            )
        })
        .collect();

    let primary_model = PrimaryModel {
        source_ids: primary.source_ids.clone(),
        config_names: primary.config_names.clone(),
        geometric_p: primary.geometric_p,
        fit_quality: primary.fit_quality(),
        model_count: primary.model_count,
    };
    Ok(ConsensusResult {
        status: EstimateStatus::Calculated,
        components,
        primary: Some(primary_model),
        groups,
    })
}

fn fallback(
    inputs: &ConsensusInputs<'_>,
    settings: &ConsensusSettings,
) -> Result<ConsensusResult, ConsensusError> {
    let breakdown = &inputs.interpretation.breakdown;
    if breakdown.is_empty() {
        return Err(ConsensusError::NoUsableModel);
    }
    warn!(
        "No usable focused model; reporting the global breakdown of {} model(s) as estimated",
        inputs.interpretation.models_used
    );
    let components = breakdown
        .iter()
        .map(|share| {
            component(
                &share.component,
                share.proportion,
                share.std_error * settings.fallback_factor,
                CorroborationLevel::Weak,
                EstimateStatus::Estimated,
                false,
                settings,
            )
        })
        .collect();
    Ok(ConsensusResult {
        status: EstimateStatus::Estimated,
        components,
        primary: None,
        groups: Vec::new(),
    })
}
