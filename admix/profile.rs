// ========================================================================================
//
//                              Target Profiles and Rule Tables
//
// ========================================================================================
//
// A target profile is pure data: which ancestry components are expected, which
// populations anchor them, which outgroups calibrate the models, and the keyword
// and tier tables that drive name resolution and curation. New regions or eras are
// added by editing a profile file, never by adding branches to the scorer.

use crate::catalog::SuffixClass;
use crate::types::Tier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

const SOUTH_ASIA_PROFILE: &str = include_str!("profiles/south_asia.toml");

/// The minimum number of outgroups an admixture model needs to be identifiable.
pub const MIN_OUTGROUPS: usize = 4;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read profile file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML profile: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Unknown built-in profile '{0}'. Available profiles: south_asia.")]
    UnknownBuiltin(String),
    #[error(
        "Profile '{profile}' lists only {found} {role} outgroups; at least {min} are required.",
        min = MIN_OUTGROUPS
    )]
    InsufficientOutgroups {
        profile: String,
        role: &'static str,
        found: usize,
    },
    #[error("Profile '{0}' must declare at least one global source and one baseline model.")]
    MissingModels(String),
    #[error("Profile '{profile}': model '{model}' has no sources.")]
    EmptyModel { profile: String, model: String },
}

/// A population standing in for one named ancestry component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub component: String,
    pub population: String,
}

impl SourceSpec {
    pub fn new(component: &str, population: &str) -> Self {
        Self {
            component: component.to_string(),
            population: population.to_string(),
        }
    }
}

/// A named admixture model configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub sources: Vec<SourceSpec>,
}

/// A category of ancestry that is not part of the profile's core, and the
/// populations to add when the global screen detects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnexpectedCategory {
    pub name: String,
    /// Global component labels whose excess triggers this category.
    pub triggers: Vec<String>,
    pub populations: Vec<SourceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordGroup {
    pub group: String,
    pub keywords: Vec<String>,
}

impl KeywordGroup {
    /// Case-insensitive substring test against every keyword.
    pub fn matches(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
    }
}

/// An ordered keyword table. Groups are tried in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordTable {
    pub groups: Vec<KeywordGroup>,
}

impl KeywordTable {
    pub fn matching_groups<'a>(&'a self, text: &str) -> Vec<&'a KeywordGroup> {
        self.groups.iter().filter(|group| group.matches(text)).collect()
    }

    pub fn first_match(&self, text: &str) -> Option<&KeywordGroup> {
        self.groups.iter().find(|group| group.matches(text))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Contains,
    Prefix,
    Suffix,
    Exact,
}

/// One row of the curation rule table: populations matching `pattern` gain `score`
/// towards `tier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub pattern: String,
    #[serde(default = "default_match_kind")]
    pub match_kind: MatchKind,
    pub tier: Tier,
    pub score: f64,
    #[serde(default)]
    pub category: String,
}

fn default_match_kind() -> MatchKind {
    MatchKind::Contains
}

impl TierRule {
    pub fn matches(&self, population_id: &str) -> bool {
        let id = population_id.to_lowercase();
        let pattern = self.pattern.to_lowercase();
        match self.match_kind {
            MatchKind::Contains => id.contains(&pattern),
            MatchKind::Prefix => id.starts_with(&pattern),
            MatchKind::Suffix => id.ends_with(&pattern),
            MatchKind::Exact => id == pattern,
        }
    }
}

/// Score multipliers applied by sample-quality class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuffixMultipliers {
    pub ancient: f64,
    pub modern_high_coverage: f64,
    pub modern_array: f64,
    pub low_coverage: f64,
    pub outlier: f64,
    pub unlabelled: f64,
}

impl Default for SuffixMultipliers {
    fn default() -> Self {
        Self {
            ancient: 1.0,
            modern_high_coverage: 1.0,
            modern_array: 0.9,
            low_coverage: 0.5,
            outlier: 0.25,
            unlabelled: 1.0,
        }
    }
}

impl SuffixMultipliers {
    pub fn for_class(&self, class: SuffixClass) -> f64 {
        match class {
            SuffixClass::Ancient => self.ancient,
            SuffixClass::ModernHighCoverage => self.modern_high_coverage,
            SuffixClass::ModernArray => self.modern_array,
            SuffixClass::LowCoverage => self.low_coverage,
            SuffixClass::Outlier => self.outlier,
            SuffixClass::Unlabelled => self.unlabelled,
        }
    }
}

/// A named weighting scheme for one analysis focus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub expected_components: Vec<String>,
    /// Core outgroups and minimal anchors that every selection must contain.
    #[serde(default)]
    pub must_have: Vec<String>,
    pub global_sources: Vec<SourceSpec>,
    pub global_outgroups: Vec<String>,
    pub focused_outgroups: Vec<String>,
    pub baseline_models: Vec<ModelSpec>,
    #[serde(default)]
    pub unexpected_categories: Vec<UnexpectedCategory>,
    #[serde(default)]
    pub geographic_keywords: KeywordTable,
    #[serde(default)]
    pub cultural_keywords: KeywordTable,
    #[serde(default)]
    pub tier_rules: Vec<TierRule>,
    #[serde(default)]
    pub suffix_multipliers: SuffixMultipliers,
}

impl TargetProfile {
    /// Looks up a profile shipped with the crate.
    pub fn builtin(name: &str) -> Result<Self, ProfileError> {
        match name {
            "south_asia" => Self::from_toml_str(SOUTH_ASIA_PROFILE),
            other => Err(ProfileError::UnknownBuiltin(other.to_string())),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ProfileError> {
        let profile: Self = toml::from_str(text)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Structural checks that do not need the catalog. Outgroup counts are checked
    /// again after resolution, since two aliases may collapse onto one id.
    pub fn validate(&self) -> Result<(), ProfileError> {
        for (role, outgroups) in [
            ("global", &self.global_outgroups),
            ("focused", &self.focused_outgroups),
        ] {
            let unique: BTreeSet<&String> = outgroups.iter().collect();
            if unique.len() < MIN_OUTGROUPS {
                return Err(ProfileError::InsufficientOutgroups {
                    profile: self.name.clone(),
                    role,
                    found: unique.len(),
                });
            }
        }
        if self.global_sources.is_empty() || self.baseline_models.is_empty() {
            return Err(ProfileError::MissingModels(self.name.clone()));
        }
        for model in &self.baseline_models {
            if model.sources.is_empty() {
                return Err(ProfileError::EmptyModel {
                    profile: self.name.clone(),
                    model: model.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Every population alias this profile refers to, deduplicated, in first-seen
    /// order. These are resolved against the catalog before curation.
    pub fn referenced_aliases(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        let sources = self
            .global_sources
            .iter()
            .chain(self.baseline_models.iter().flat_map(|m| m.sources.iter()))
            .chain(
                self.unexpected_categories
                    .iter()
                    .flat_map(|c| c.populations.iter()),
            )
            .map(|source| source.population.as_str());
        let names = self
            .must_have
            .iter()
            .map(String::as_str)
            .chain(self.global_outgroups.iter().map(String::as_str))
            .chain(self.focused_outgroups.iter().map(String::as_str))
            .chain(sources);
        for name in names {
            if seen.insert(name.to_string()) {
                ordered.push(name.to_string());
            }
        }
        ordered
    }
}
