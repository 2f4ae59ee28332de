// ========================================================================================
//
//                                 Hybrid Name Resolution
//
// ========================================================================================
//
// Maps loosely specified population names onto catalog identifiers. Rule-based tiers
// are tried in strict precedence order and the first tier that reaches the accept
// threshold wins. Whatever is still below the threshold afterwards is deduplicated
// and sent, in fixed-size batches, to the optional assisted resolver. All results
// land in a per-run cache so repeat lookups never recompute.

use crate::assist::{AssistedMatch, AssistedResolver};
use crate::catalog::Catalog;
use crate::profile::{KeywordTable, TargetProfile};
use crate::shared::retry::{RetryPolicy, with_retries};
use crate::types::{AliasRequest, MatchMethod, MatchResult};
use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Tunables for the rule-based tiers and the assisted batch size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// A tier whose confidence reaches this value ends the search.
    pub accept_threshold: f64,
    pub suffix_confidence: f64,
    /// Minimum raw similarity for a geographic-context candidate.
    pub geographic_threshold: f64,
    /// Minimum raw similarity for a cultural-context candidate.
    pub cultural_threshold: f64,
    /// Trailing platform or publication markers stripped before suffix matching.
    pub platform_suffixes: Vec<String>,
    /// Trailing era tokens stripped after the platform markers.
    pub era_tokens: Vec<String>,
    /// Suffixes re-attached to each stem during suffix-variant matching.
    pub candidate_suffixes: Vec<String>,
    pub assist_batch_size: usize,
    /// How many nearest catalog ids per alias are shown to the assisted resolver.
    pub assist_candidates_per_alias: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        let strings =
            |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            accept_threshold: 0.8,
            suffix_confidence: 0.95,
            geographic_threshold: 0.7,
            cultural_threshold: 0.6,
            platform_suffixes: strings(&[
                ".AG", ".DG", ".SG", ".HO", ".WGA", "_published", "_lc", ".LC",
            ]),
            era_tokens: strings(&[
                "_N", "_EN", "_MN", "_LN", "_C", "_CA", "_BA", "_EBA", "_MBA", "_LBA", "_MLBA",
                "_IA", "_EIA", "_HG", "_Meso", "_Medieval", "_Historic",
            ]),
            candidate_suffixes: strings(&[".AG", ".DG", ".SG", ".HO", ".WGA", "_published"]),
            assist_batch_size: 10,
            assist_candidates_per_alias: 20,
        }
    }
}

/// Session-scoped resolution cache. Reads are lock-free across shards; inserts are
/// idempotent, so two callers racing on the same alias keep whichever result landed
/// first.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: DashMap<String, MatchResult>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alias: &str) -> Option<MatchResult> {
        self.entries.get(alias).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    /// Inserts `result` unless the alias is already cached, and returns the cached
    /// value either way.
    pub fn insert(&self, result: MatchResult) -> MatchResult {
        self.entries
            .entry(result.alias.clone())
            .or_insert(result)
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All cached results, sorted by alias for stable reporting.
    pub fn snapshot(&self) -> Vec<MatchResult> {
        let mut results: Vec<MatchResult> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        results.sort_by(|a, b| a.alias.cmp(&b.alias));
        results
    }
}

/// Lower-cases and unifies separators so that `Iran_N.AG` and `iran-n ag` compare
/// on their letters, not their punctuation.
fn normalise(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '.' | '-' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Similarity in `[0, 1]`; `distance = 1 - similarity`.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    strsim::jaro_winkler(&normalise(a), &normalise(b))
}

/// Converts raw similarity into a method confidence. Each similarity-based method
/// has its own ceiling and discount so that, for equal similarity, confidence
/// strictly decreases down the precedence list and never reaches the fixed
/// confidence of a suffix-variant hit.
pub fn method_confidence(method: MatchMethod, similarity: f64) -> f64 {
    let similarity = similarity.clamp(0.0, 1.0);
    match method {
        MatchMethod::Exact => 1.0,
        MatchMethod::GeographicContext => similarity.min(0.94),
        MatchMethod::CulturalContext => (similarity * 0.98).min(0.93),
        MatchMethod::StringDistance => (similarity * 0.95).min(0.92),
        MatchMethod::SuffixVariant | MatchMethod::AiAssisted | MatchMethod::Fallback => similarity,
    }
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    if suffix.is_empty() || name.len() <= suffix.len() {
        return None;
    }
    let cut = name.len() - suffix.len();
    if !name.is_char_boundary(cut) || !name[cut..].eq_ignore_ascii_case(suffix) {
        return None;
    }
    Some(&name[..cut])
}

/// Rule-based resolver bound to one catalog and one profile's keyword tables.
pub struct NameResolver<'a> {
    catalog: &'a Catalog,
    geographic: &'a KeywordTable,
    cultural: &'a KeywordTable,
    settings: &'a ResolverSettings,
    lowercase_index: AHashMap<String, usize>,
    geographic_members: Vec<Vec<usize>>,
    cultural_members: Vec<Vec<usize>>,
}

impl<'a> NameResolver<'a> {
    pub fn new(catalog: &'a Catalog, profile: &'a TargetProfile, settings: &'a ResolverSettings) -> Self {
        let mut lowercase_index = AHashMap::with_capacity(catalog.len());
        for (idx, id) in catalog.ids().enumerate() {
            lowercase_index.entry(id.to_lowercase()).or_insert(idx);
        }
        let members = |table: &KeywordTable| -> Vec<Vec<usize>> {
            table
                .groups
                .iter()
                .map(|group| {
                    catalog
                        .ids()
                        .enumerate()
                        .filter(|(_, id)| group.matches(id))
                        .map(|(idx, _)| idx)
                        .collect()
                })
                .collect()
        };
        Self {
            catalog,
            geographic: &profile.geographic_keywords,
            cultural: &profile.cultural_keywords,
            settings,
            lowercase_index,
            geographic_members: members(&profile.geographic_keywords),
            cultural_members: members(&profile.cultural_keywords),
        }
    }

    fn id_at(&self, idx: usize) -> &'a str {
        self.catalog.entries()[idx].id.as_str()
    }

    /// Steps 1-5: exact, suffix-variant, geographic, cultural, global string
    /// distance. Always returns a candidate because the catalog is never empty.
    pub fn resolve_rules(&self, alias: &str) -> MatchResult {
        if self.catalog.contains(alias) {
            return MatchResult::new(alias, alias, 1.0, MatchMethod::Exact);
        }
        if let Some(hit) = self.suffix_variant(alias) {
            return hit;
        }

        let accept = self.settings.accept_threshold;
        let mut best: Option<MatchResult> = None;
        let context_tiers = [
            (
                self.geographic,
                &self.geographic_members,
                self.settings.geographic_threshold,
                MatchMethod::GeographicContext,
            ),
            (
                self.cultural,
                &self.cultural_members,
                self.settings.cultural_threshold,
                MatchMethod::CulturalContext,
            ),
        ];
        for (table, members, threshold, method) in context_tiers {
            if let Some(candidate) = self.context_match(alias, table, members, threshold, method) {
                if candidate.confidence >= accept {
                    return candidate;
                }
                best = Some(prefer(best, candidate));
            }
        }

        let global = self.string_distance(alias);
        if global.confidence >= accept {
            return global;
        }
        prefer(best, global)
    }

    fn suffix_variant(&self, alias: &str) -> Option<MatchResult> {
        for stem in self.stems(alias) {
            let bare = std::iter::once(stem.clone());
            let suffixed = self
                .settings
                .candidate_suffixes
                .iter()
                .map(|suffix| format!("{stem}{suffix}"));
            for candidate in bare.chain(suffixed) {
                if let Some(&idx) = self.lowercase_index.get(&candidate.to_lowercase()) {
                    let resolved = self.id_at(idx);
                    return Some(MatchResult::new(
                        alias,
                        resolved,
                        self.settings.suffix_confidence,
                        MatchMethod::SuffixVariant,
                    ));
                }
            }
        }
        None
    }

    /// The alias itself, then the alias with platform markers removed, then with
    /// one trailing era token removed. Duplicates are dropped.
    fn stems(&self, alias: &str) -> Vec<String> {
        let mut stems = vec![alias.to_string()];
        let mut current = alias;
        while let Some(stripped) = self
            .settings
            .platform_suffixes
            .iter()
            .find_map(|suffix| strip_suffix_ignore_case(current, suffix))
        {
            current = stripped;
            stems.push(current.to_string());
        }
        if let Some(stripped) = self
            .settings
            .era_tokens
            .iter()
            .find_map(|token| strip_suffix_ignore_case(current, token))
        {
            stems.push(stripped.to_string());
        }
        let mut seen = AHashSet::new();
        stems.retain(|stem| seen.insert(stem.to_lowercase()));
        stems
    }

    fn context_match(
        &self,
        alias: &str,
        table: &KeywordTable,
        members: &[Vec<usize>],
        threshold: f64,
        method: MatchMethod,
    ) -> Option<MatchResult> {
        let mut candidate_indices: Vec<usize> = table
            .groups
            .iter()
            .zip(members)
            .filter(|(group, _)| group.matches(alias))
            .flat_map(|(_, indices)| indices.iter().copied())
            .collect();
        if candidate_indices.is_empty() {
            return None;
        }
        candidate_indices.sort_unstable();
        candidate_indices.dedup();

        let (idx, similarity) = self.closest(alias, candidate_indices.into_iter())?;
        if similarity <= threshold {
            return None;
        }
        Some(MatchResult::new(
            alias,
            self.id_at(idx),
            method_confidence(method, similarity),
            method,
        ))
    }

    fn string_distance(&self, alias: &str) -> MatchResult {
        match self.closest(alias, 0..self.catalog.len()) {
            Some((idx, similarity)) => MatchResult::new(
                alias,
                self.id_at(idx),
                method_confidence(MatchMethod::StringDistance, similarity),
                MatchMethod::StringDistance,
            ),
            None => MatchResult::new(alias, alias, 0.0, MatchMethod::StringDistance),
        }
    }

    /// The most similar catalog index. Ties keep the earliest catalog position.
    fn closest(&self, alias: &str, indices: impl Iterator<Item = usize>) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for idx in indices {
            let similarity = name_similarity(alias, self.id_at(idx));
            match best {
                Some((_, current)) if similarity <= current => {}
                _ => best = Some((idx, similarity)),
            }
        }
        best
    }

    /// The `limit` catalog ids most similar to `alias`, most similar first.
    pub fn nearest_ids(&self, alias: &str, limit: usize) -> Vec<String> {
        let mut scored: Vec<(usize, f64)> = (0..self.catalog.len())
            .map(|idx| (idx, name_similarity(alias, self.id_at(idx))))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(limit)
            .map(|(idx, _)| self.id_at(idx).to_string())
            .collect()
    }

    /// Resolves every alias, consulting and filling `cache`. Results come back in
    /// input order; duplicate aliases are resolved once.
    pub fn resolve_all(
        &self,
        aliases: &[AliasRequest],
        cache: &ResolutionCache,
        assistant: Option<&dyn AssistedResolver>,
        policy: &RetryPolicy,
    ) -> Vec<MatchResult> {
        let mut seen = AHashSet::new();
        let pending: Vec<&AliasRequest> = aliases
            .iter()
            .filter(|alias| !cache.contains(alias.as_str()))
            .filter(|alias| seen.insert(alias.as_str()))
            .collect();

        let rule_results: Vec<MatchResult> = pending
            .par_iter()
            .map(|alias| self.resolve_rules(alias.as_str()))
            .collect();

        let accept = self.settings.accept_threshold;
        let mut low_confidence = Vec::new();
        for result in rule_results {
            if result.confidence >= accept {
                debug!(
                    "Resolved '{}' -> '{}' ({}, {:.3})",
                    result.alias, result.resolved_id, result.method, result.confidence
                );
                cache.insert(result);
            } else {
                low_confidence.push(result);
            }
        }

        if !low_confidence.is_empty() {
            info!(
                "{} alias(es) below confidence {:.2}; {}",
                low_confidence.len(),
                accept,
                if assistant.is_some() {
                    "requesting assisted resolution"
                } else {
                    "no assisted resolver configured, keeping best rule-based matches"
                }
            );
            for result in self.assist(low_confidence, assistant, policy) {
                cache.insert(result);
            }
        }

        aliases
            .iter()
            .filter_map(|alias| cache.get(alias.as_str()))
            .collect()
    }

    fn assist(
        &self,
        fuzzy: Vec<MatchResult>,
        assistant: Option<&dyn AssistedResolver>,
        policy: &RetryPolicy,
    ) -> Vec<MatchResult> {
        let Some(assistant) = assistant else {
            return fuzzy.into_iter().map(as_fallback).collect();
        };

        let batch_size = self.settings.assist_batch_size.max(1);
        let mut resolved = Vec::with_capacity(fuzzy.len());
        for chunk in fuzzy.chunks(batch_size) {
            let requests: Vec<AliasRequest> =
                chunk.iter().map(|r| AliasRequest::new(r.alias.as_str())).collect();
            let mut candidate_seen = AHashSet::new();
            let candidates: Vec<String> = requests
                .iter()
                .flat_map(|alias| {
                    self.nearest_ids(alias.as_str(), self.settings.assist_candidates_per_alias)
                })
                .filter(|id| candidate_seen.insert(id.clone()))
                .collect();

            let response = with_retries("assisted name resolution", policy, || {
                assistant.resolve_batch(&requests, &candidates)
            });
            match response {
                Ok(matches) => {
                    let by_alias: AHashMap<&str, &AssistedMatch> =
                        matches.iter().map(|m| (m.alias.as_str(), m)).collect();
                    for fallback in chunk {
                        match by_alias.get(fallback.alias.as_str()) {
                            Some(assisted) if self.catalog.contains(&assisted.resolved_id) => {
                                let mut result = MatchResult::new(
                                    &fallback.alias,
                                    &assisted.resolved_id,
                                    assisted.confidence,
                                    MatchMethod::AiAssisted,
                                );
                                if let Some(rationale) = &assisted.rationale {
                                    result = result.with_rationale(rationale.clone());
                                }
                                resolved.push(result);
                            }
                            Some(assisted) => {
                                warn!(
                                    "Assisted resolver proposed '{}' for '{}', which is not in the catalog",
                                    assisted.resolved_id, fallback.alias
                                );
                                resolved.push(as_fallback(fallback.clone()));
                            }
                            None => resolved.push(as_fallback(fallback.clone())),
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "Assisted resolution unavailable for {} alias(es): {err}",
                        chunk.len()
                    );
                    resolved.extend(chunk.iter().cloned().map(as_fallback));
                }
            }
        }
        resolved
    }
}

fn as_fallback(mut result: MatchResult) -> MatchResult {
    result.method = MatchMethod::Fallback;
    result
}

/// Keeps the higher-confidence result; on a tie the earlier (more precise) method.
fn prefer(current: Option<MatchResult>, candidate: MatchResult) -> MatchResult {
    match current {
        Some(existing) if existing.confidence > candidate.confidence => existing,
        Some(existing)
            if existing.confidence == candidate.confidence && existing.method <= candidate.method =>
        {
            existing
        }
        _ => candidate,
    }
}
