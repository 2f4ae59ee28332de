// ========================================================================================
//
//                                     Tiered Curation
//
// ========================================================================================
//
// Scores every catalog population against the profile's rule table, fills the three
// priority tiers under their caps, force-includes the must-have populations, and
// ranks everything eligible but unselected as the reserve the memory controller
// draws from when there is room to grow.

use crate::catalog::{Catalog, CatalogEntry};
use crate::profile::{SuffixMultipliers, TierRule};
use crate::types::{ScoredPopulation, Tier};
use ahash::AHashSet;
use itertools::Itertools;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use thiserror::Error;

const FRACTION_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum CurateError {
    #[error("Tier fractions must each lie in [0, 1] and sum to 1 (got {0:?}).")]
    InvalidFractions([f64; 3]),
    #[error("The global population cap must be positive.")]
    ZeroCap,
    #[error(
        "{count} must-have populations do not fit the essential tier cap of {cap}. Raise the global cap or shorten the must-have list."
    )]
    TooManyMustHaves { count: usize, cap: usize },
    #[error("Must-have population '{0}' is not in the catalog.")]
    UnknownMustHave(String),
}

/// Size limits for the curated selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierSettings {
    pub global_cap: usize,
    /// Essential, supporting, context.
    pub fractions: [f64; 3],
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            global_cap: 400,
            fractions: [0.70, 0.20, 0.10],
        }
    }
}

impl TierSettings {
    pub fn validate(&self) -> Result<(), CurateError> {
        if self.global_cap == 0 {
            return Err(CurateError::ZeroCap);
        }
        let in_range = self
            .fractions
            .iter()
            .all(|f| f.is_finite() && (0.0..=1.0).contains(f));
        let sum: f64 = self.fractions.iter().sum();
        if !in_range || (sum - 1.0).abs() > FRACTION_TOLERANCE {
            return Err(CurateError::InvalidFractions(self.fractions));
        }
        Ok(())
    }

    /// `floor(global_cap * fraction)` per tier; the rounding remainder goes to the
    /// essential tier so the caps always add up to the global cap.
    pub fn caps(&self) -> [usize; 3] {
        let mut caps = [0usize; 3];
        for tier in Tier::ALL {
            caps[tier.index()] =
                (self.global_cap as f64 * self.fractions[tier.index()] + FRACTION_TOLERANCE).floor()
                    as usize;
        }
        let assigned: usize = caps.iter().sum();
        caps[Tier::Essential.index()] += self.global_cap.saturating_sub(assigned);
        caps
    }
}

/// Evaluates the declarative rule table. A population's tier score is the sum of the
/// rules it matches for that tier, scaled by its sample-quality multiplier.
pub struct TierScorer<'a> {
    rules: &'a [TierRule],
    multipliers: &'a SuffixMultipliers,
}

impl<'a> TierScorer<'a> {
    pub fn new(rules: &'a [TierRule], multipliers: &'a SuffixMultipliers) -> Self {
        Self { rules, multipliers }
    }

    pub fn score(&self, entry: &CatalogEntry) -> [f64; 3] {
        let mut scores = [0.0; 3];
        for rule in self.rules.iter().filter(|rule| rule.matches(&entry.id)) {
            scores[rule.tier.index()] += rule.score;
        }
        let multiplier = self.multipliers.for_class(entry.suffix);
        scores.map(|score| score * multiplier)
    }
}

/// Higher score first, then earlier catalog position.
fn by_priority(a: &ScoredPopulation, b: &ScoredPopulation) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.catalog_index.cmp(&b.catalog_index))
}

/// The curator's output. Tiers are disjoint and each is sorted by priority.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredSelection {
    tiers: [Vec<ScoredPopulation>; 3],
    caps: [usize; 3],
    must_haves: BTreeSet<String>,
    /// Eligible but unselected populations, best first.
    reserve: Vec<ScoredPopulation>,
}

impl TieredSelection {
    pub fn tier(&self, tier: Tier) -> &[ScoredPopulation] {
        &self.tiers[tier.index()]
    }

    pub fn cap(&self, tier: Tier) -> usize {
        self.caps[tier.index()]
    }

    pub fn global_cap(&self) -> usize {
        self.caps.iter().sum()
    }

    pub fn reserve(&self) -> &[ScoredPopulation] {
        &self.reserve
    }

    pub fn is_must_have(&self, id: &str) -> bool {
        self.must_haves.contains(id)
    }

    pub fn must_haves(&self) -> impl Iterator<Item = &str> {
        self.must_haves.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tiers.iter().flatten().any(|pop| pop.id == id)
    }

    /// Essential tier first, then supporting, then context.
    pub fn ids(&self) -> Vec<String> {
        self.tiers
            .iter()
            .flatten()
            .map(|pop| pop.id.clone())
            .collect()
    }

    pub(crate) fn into_parts(self) -> ([Vec<ScoredPopulation>; 3], BTreeSet<String>, Vec<ScoredPopulation>) {
        (self.tiers, self.must_haves, self.reserve)
    }
}

/// Builds the tiered selection. `must_haves` are resolved catalog ids.
pub fn curate(
    catalog: &Catalog,
    scorer: &TierScorer<'_>,
    settings: &TierSettings,
    must_haves: &[String],
) -> Result<TieredSelection, CurateError> {
    settings.validate()?;
    let caps = settings.caps();

    let must_have_ids: Vec<&String> = must_haves.iter().unique().collect();
    if let Some(unknown) = must_have_ids.iter().find(|id| !catalog.contains(id)) {
        return Err(CurateError::UnknownMustHave((*unknown).clone()));
    }
    let essential_cap = caps[Tier::Essential.index()];
    if must_have_ids.len() > essential_cap {
        return Err(CurateError::TooManyMustHaves {
            count: must_have_ids.len(),
            cap: essential_cap,
        });
    }
    let must_have_set: BTreeSet<String> = must_have_ids.iter().map(|id| (*id).clone()).collect();

    let scores: Vec<[f64; 3]> = catalog
        .entries()
        .par_iter()
        .map(|entry| scorer.score(entry))
        .collect();

    let scored = |idx: usize, score: f64| ScoredPopulation {
        id: catalog.entries()[idx].id.clone(),
        score,
        catalog_index: idx,
    };

    let mut taken: AHashSet<usize> = AHashSet::new();
    let mut tiers: [Vec<ScoredPopulation>; 3] = Default::default();
    for tier in Tier::ALL {
        let mut eligible: Vec<ScoredPopulation> = scores
            .iter()
            .enumerate()
            .filter(|(idx, score)| score[tier.index()] > 0.0 && !taken.contains(idx))
            .map(|(idx, score)| scored(idx, score[tier.index()]))
            .collect();
        eligible.sort_by(by_priority);
        eligible.truncate(caps[tier.index()]);
        taken.extend(eligible.iter().map(|pop| pop.catalog_index));
        debug!(
            "Tier {tier}: {} of cap {} selected",
            eligible.len(),
            caps[tier.index()]
        );
        tiers[tier.index()] = eligible;
    }

    let essential = &mut tiers[Tier::Essential.index()];
    for id in &must_have_ids {
        let Some(idx) = catalog.index_of(id) else {
            continue;
        };
        if taken.insert(idx) {
            debug!("Force-including must-have population '{id}'");
            essential.push(scored(idx, scores[idx][Tier::Essential.index()]));
        }
    }
    essential.sort_by(by_priority);
    while essential.len() > essential_cap {
        let Some(position) = essential
            .iter()
            .rposition(|pop| !must_have_set.contains(&pop.id))
        else {
            break;
        };
        let evicted = essential.remove(position);
        taken.remove(&evicted.catalog_index);
        debug!(
            "Evicted '{}' (score {:.3}) to make room for must-haves",
            evicted.id, evicted.score
        );
    }

    let mut reserve: Vec<ScoredPopulation> = scores
        .iter()
        .enumerate()
        .filter(|(idx, _)| !taken.contains(idx))
        .filter_map(|(idx, score)| {
            let best = score.iter().copied().fold(0.0, f64::max);
            (best > 0.0).then(|| scored(idx, best))
        })
        .collect();
    reserve.sort_by(by_priority);

    let selection = TieredSelection {
        tiers,
        caps,
        must_haves: must_have_set,
        reserve,
    };
    info!(
        "Curated {} populations (essential {}, supporting {}, context {}); {} in reserve",
        selection.len(),
        selection.tier(Tier::Essential).len(),
        selection.tier(Tier::Supporting).len(),
        selection.tier(Tier::Context).len(),
        selection.reserve.len()
    );
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{KeywordTable, MatchKind};

    fn rule(pattern: &str, tier: Tier, score: f64) -> TierRule {
        TierRule {
            pattern: pattern.into(),
            match_kind: MatchKind::Contains,
            tier,
            score,
            category: String::new(),
        }
    }

    fn catalog(ids: &[&str]) -> Catalog {
        Catalog::from_ids(ids, &KeywordTable::default()).unwrap()
    }

    fn settings(global_cap: usize, fractions: [f64; 3]) -> TierSettings {
        TierSettings {
            global_cap,
            fractions,
        }
    }

    #[test]
    fn caps_sum_to_global_cap() {
        let settings = TierSettings {
            global_cap: 7,
            fractions: [0.70, 0.20, 0.10],
        };
        let caps = settings.caps();
        assert_eq!(caps.iter().sum::<usize>(), 7);
        assert_eq!(caps, [6, 1, 0]);
        assert_eq!(TierSettings::default().caps(), [280, 80, 40]);
    }

    #[test]
    fn fractions_are_validated() {
        let bad = TierSettings {
            global_cap: 10,
            fractions: [0.7, 0.2, 0.2],
        };
        assert!(matches!(bad.validate(), Err(CurateError::InvalidFractions(_))));
        let zero = TierSettings {
            global_cap: 0,
            ..TierSettings::default()
        };
        assert!(matches!(zero.validate(), Err(CurateError::ZeroCap)));
    }

    #[test]
    fn scores_are_summed_and_scaled_by_suffix_class() {
        let rules = vec![
            rule("iran", Tier::Essential, 3.0),
            rule("_n", Tier::Essential, 1.0),
            rule("iran", Tier::Context, 0.5),
        ];
        let multipliers = SuffixMultipliers::default();
        let scorer = TierScorer::new(&rules, &multipliers);
        let catalog = catalog(&["Iran_N.AG", "Iran_N_lc.SG"]);
        let full = scorer.score(&catalog.entries()[0]);
        let low = scorer.score(&catalog.entries()[1]);
        assert_eq!(full, [4.0, 0.0, 0.5]);
        assert_eq!(low, [2.0, 0.0, 0.25]);
    }

    #[test]
    fn tiers_are_disjoint_and_capped() {
        let rules = vec![
            rule("iran", Tier::Essential, 5.0),
            rule("iran", Tier::Supporting, 5.0),
            rule("pak", Tier::Supporting, 2.0),
            rule("dg", Tier::Context, 1.0),
        ];
        let multipliers = SuffixMultipliers::default();
        let scorer = TierScorer::new(&rules, &multipliers);
        let catalog = catalog(&[
            "Iran_A", "Iran_B", "Iran_C", "Iran_D", "Pak_A", "Pak_B", "Pak_C", "Mbuti.DG",
            "Han.DG", "Ami.DG",
        ]);
        let selection = curate(&catalog, &scorer, &settings(8, [0.5, 0.3, 0.2]), &[]).unwrap();
        assert_eq!(selection.cap(Tier::Essential), 5);
        assert_eq!(selection.cap(Tier::Supporting), 2);
        assert_eq!(selection.cap(Tier::Context), 1);
        assert_eq!(selection.tier(Tier::Essential).len(), 4);
        assert!(selection.tier(Tier::Supporting).iter().all(|p| p.id.starts_with("Pak")));
        assert!(selection.tier(Tier::Supporting).len() <= selection.cap(Tier::Supporting));
        assert!(selection.tier(Tier::Context).len() <= selection.cap(Tier::Context));
        let ids = selection.ids();
        assert_eq!(ids.iter().unique().count(), ids.len());
        assert!(selection.len() <= selection.global_cap());
        assert!(selection.reserve().iter().any(|p| p.id == "Pak_C" || p.id == "Ami.DG"));
    }

    #[test]
    fn ties_break_by_catalog_order() {
        let rules = vec![rule("pop", Tier::Essential, 1.0)];
        let multipliers = SuffixMultipliers::default();
        let scorer = TierScorer::new(&rules, &multipliers);
        let catalog = catalog(&["Pop_C", "Pop_A", "Pop_B"]);
        let selection = curate(&catalog, &scorer, &settings(2, [1.0, 0.0, 0.0]), &[]).unwrap();
        let essential: Vec<&str> = selection
            .tier(Tier::Essential)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(essential, vec!["Pop_C", "Pop_A"]);
        assert_eq!(selection.reserve()[0].id, "Pop_B");
    }

    #[test]
    fn must_haves_evict_the_lowest_scored_essential() {
        let rules = vec![
            rule("high", Tier::Essential, 3.0),
            rule("low", Tier::Essential, 1.0),
        ];
        let multipliers = SuffixMultipliers::default();
        let scorer = TierScorer::new(&rules, &multipliers);
        let catalog = catalog(&["High_1", "High_2", "Low_1", "Mbuti.DG"]);
        let selection = curate(
            &catalog,
            &scorer,
            &settings(3, [1.0, 0.0, 0.0]),
            &["Mbuti.DG".to_string()],
        )
        .unwrap();
        assert_eq!(selection.cap(Tier::Essential), 3);
        assert!(selection.contains("Mbuti.DG"));
        assert!(selection.is_must_have("Mbuti.DG"));
        assert!(!selection.contains("Low_1"));
        assert_eq!(selection.reserve()[0].id, "Low_1");
        assert_eq!(selection.must_haves().collect::<Vec<_>>(), vec!["Mbuti.DG"]);
    }

    #[test]
    fn must_haves_beyond_the_essential_cap_are_rejected() {
        let rules = vec![rule("pop", Tier::Essential, 1.0)];
        let multipliers = SuffixMultipliers::default();
        let scorer = TierScorer::new(&rules, &multipliers);
        let catalog = catalog(&["Pop_A", "Pop_B", "Pop_C"]);
        let must = vec!["Pop_A".to_string(), "Pop_B".to_string(), "Pop_C".to_string()];
        let narrow = settings(4, [0.5, 0.5, 0.0]);
        let err = curate(&catalog, &scorer, &narrow, &must).unwrap_err();
        assert!(matches!(err, CurateError::TooManyMustHaves { count: 3, cap: 2 }));

        let unknown = curate(&catalog, &scorer, &narrow, &["Nope".to_string()]);
        assert!(matches!(unknown, Err(CurateError::UnknownMustHave(_))));
    }

    #[test]
    fn curation_is_deterministic() {
        let rules = vec![
            rule("a", Tier::Essential, 1.0),
            rule("b", Tier::Supporting, 1.0),
            rule("c", Tier::Context, 1.0),
        ];
        let multipliers = SuffixMultipliers::default();
        let scorer = TierScorer::new(&rules, &multipliers);
        let ids: Vec<String> = (0..60).map(|i| format!("Pop_{}_{i}", ["a", "b", "c"][i % 3])).collect();
        let catalog = Catalog::from_ids(&ids, &KeywordTable::default()).unwrap();
        let first = curate(&catalog, &scorer, &settings(20, [0.5, 0.3, 0.2]), &[]).unwrap();
        let second = curate(&catalog, &scorer, &settings(20, [0.5, 0.3, 0.2]), &[]).unwrap();
        assert_eq!(first, second);
    }
}
