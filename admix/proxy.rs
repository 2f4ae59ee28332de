// ========================================================================================
//
//                                 Proxy Identification
//
// ========================================================================================
//
// A single genome cannot supply the group-level statistics the admixture models need,
// so the models run on reference populations that look most like the individual.
// Every candidate is scored with three distances over the shared sites:
//
//   d1  mean |x - p|                            (dosage vs. frequency)
//   d2  1 - mean(x*p + (1-x)*(1-p))             (allele-sharing distance)
//   d3  1 - mean(P_HWE(genotype | p))           (genotype improbability)
//
// where x is the individual's allele count / 2 and p the population frequency of the
// same allele. The weighted sum is the combined distance; similarity = 1 - distance.

use crate::genotype::{PersonalGenotypes, PopulationFrequencies};
use crate::types::{GeneticProxy, GeneticProxySet};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_PROXY_LIMIT: usize = 3;
pub const MAX_PROXY_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(
        "No proxy available: none of the {candidates} candidate populations shares at least {min_shared} sites with the sample."
    )]
    NoProxyAvailable { candidates: usize, min_shared: usize },
    #[error("Invalid proxy settings: {0}")]
    InvalidSettings(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub max_proxies: usize,
    /// Fewer candidates than this still proceed, with a warning.
    pub min_proxies: usize,
    pub min_shared_variants: usize,
    /// Weights of d1, d2 and d3. Must sum to 1.
    pub metric_weights: [f64; 3],
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_proxies: 5,
            min_proxies: 3,
            min_shared_variants: 500,
            metric_weights: [0.4, 0.4, 0.2],
        }
    }
}

impl ProxySettings {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if !(MIN_PROXY_LIMIT..=MAX_PROXY_LIMIT).contains(&self.max_proxies) {
            return Err(ProxyError::InvalidSettings(format!(
                "max_proxies must be between {MIN_PROXY_LIMIT} and {MAX_PROXY_LIMIT} (got {})",
                self.max_proxies
            )));
        }
        if self.min_proxies == 0 || self.min_proxies > self.max_proxies {
            return Err(ProxyError::InvalidSettings(format!(
                "min_proxies must be between 1 and max_proxies (got {})",
                self.min_proxies
            )));
        }
        let sum: f64 = self.metric_weights.iter().sum();
        let non_negative = self.metric_weights.iter().all(|w| w.is_finite() && *w >= 0.0);
        if !non_negative || (sum - 1.0).abs() > 1e-6 {
            return Err(ProxyError::InvalidSettings(format!(
                "metric weights must be non-negative and sum to 1 (got {:?})",
                self.metric_weights
            )));
        }
        Ok(())
    }
}

/// Distance of one candidate population from the sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateDistance {
    pub population_id: String,
    /// d1, d2, d3.
    pub metrics: [f64; 3],
    pub distance: f64,
    pub similarity: f64,
    pub shared_variants: usize,
    #[serde(skip)]
    order: usize,
}

fn hwe_probability(dosage: f64, p: f64) -> f64 {
    let copies = (dosage * 2.0).round() as u8;
    match copies {
        2 => p * p,
        1 => 2.0 * p * (1.0 - p),
        _ => (1.0 - p) * (1.0 - p),
    }
}

/// Scores one population, or `None` when too few sites are shared.
pub fn distance_to(
    genotypes: &PersonalGenotypes,
    population: &PopulationFrequencies,
    settings: &ProxySettings,
) -> Option<CandidateDistance> {
    let mut shared = 0usize;
    let mut sums = [0.0f64; 3];
    for (rsid, allele, p) in population.sites() {
        let Some(x) = genotypes.dosage(rsid, allele) else {
            continue;
        };
        shared += 1;
        sums[0] += (x - p).abs();
        sums[1] += x * p + (1.0 - x) * (1.0 - p);
        sums[2] += hwe_probability(x, p);
    }
    if shared == 0 || shared < settings.min_shared_variants {
        return None;
    }
    let n = shared as f64;
    let metrics = [sums[0] / n, 1.0 - sums[1] / n, 1.0 - sums[2] / n].map(|m| m.clamp(0.0, 1.0));
    let distance = metrics
        .iter()
        .zip(settings.metric_weights)
        .map(|(metric, weight)| metric * weight)
        .sum::<f64>()
        .clamp(0.0, 1.0);
    Some(CandidateDistance {
        population_id: population.population_id.clone(),
        metrics,
        distance,
        similarity: 1.0 - distance,
        shared_variants: shared,
        order: 0,
    })
}

/// Every candidate that shares enough sites, most similar first. Ties keep the
/// input (catalog) order. Duplicate population ids keep their first occurrence.
pub fn rank_candidates(
    genotypes: &PersonalGenotypes,
    candidates: &[PopulationFrequencies],
    settings: &ProxySettings,
) -> Vec<CandidateDistance> {
    let mut ranked: Vec<CandidateDistance> = candidates
        .par_iter()
        .enumerate()
        .filter_map(|(order, population)| {
            distance_to(genotypes, population, settings).map(|mut scored| {
                scored.order = order;
                scored
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(a.order.cmp(&b.order))
    });
    let mut seen = ahash::AHashSet::new();
    ranked.retain(|candidate| seen.insert(candidate.population_id.clone()));
    ranked
}

/// Picks the top `max_proxies` candidates and normalises their similarities into
/// weights that sum to 1. An all-zero similarity set gets equal weights.
pub fn identify_proxies(
    genotypes: &PersonalGenotypes,
    candidates: &[PopulationFrequencies],
    settings: &ProxySettings,
) -> Result<(GeneticProxySet, Vec<CandidateDistance>), ProxyError> {
    settings.validate()?;
    let ranked = rank_candidates(genotypes, candidates, settings);
    if ranked.is_empty() {
        return Err(ProxyError::NoProxyAvailable {
            candidates: candidates.len(),
            min_shared: settings.min_shared_variants,
        });
    }
    let top = &ranked[..ranked.len().min(settings.max_proxies)];
    if top.len() < settings.min_proxies {
        warn!(
            "Only {} proxy population(s) qualified (at least {} recommended); continuing with reduced robustness",
            top.len(),
            settings.min_proxies
        );
    }
    let total: f64 = top.iter().map(|c| c.similarity).sum();
    let proxies: Vec<GeneticProxy> = top
        .iter()
        .map(|candidate| GeneticProxy {
            population_id: candidate.population_id.clone(),
            similarity: candidate.similarity,
            weight: if total > 0.0 {
                candidate.similarity / total
            } else {
                1.0 / top.len() as f64
            },
            distance: candidate.distance,
            shared_variants: candidate.shared_variants,
        })
        .collect();
    for proxy in &proxies {
        info!(
            "Proxy {}: similarity {:.4}, weight {:.3}, {} shared sites",
            proxy.population_id, proxy.similarity, proxy.weight, proxy.shared_variants
        );
    }
    Ok((GeneticProxySet::from_normalised(proxies), ranked))
}
