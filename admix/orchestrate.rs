// ========================================================================================
//
//                              Two-Phase Model Orchestration
//
// ========================================================================================
//
// GlobalScreening -> Interpretation -> AdaptiveSourceBuilding -> FocusedExecution -> Done
//
// The global pass fits one broad continental model per proxy. Its proxy-weighted
// breakdown is scanned for components the profile does not expect; each one that
// crosses the threshold pulls in an extra model configuration for the focused pass,
// which runs every configuration against every proxy. Individual fits are independent
// tasks whose failures are recorded, never propagated.

use crate::consensus::pooled_estimate;
use crate::profile::{MIN_OUTGROUPS, ModelSpec, SourceSpec, TargetProfile};
use crate::progress::{PipelineObserver, PipelineStage, StageCounter};
use crate::shared::retry::CancellationToken;
use crate::stats::{StatisticsEngine, StatsHandle, TestStatistic};
use crate::types::{
    AncestryModel, GeneticProxy, GeneticProxySet, MatchResult, ModelFailure, ModelOutcome, Phase,
};
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error(
        "Only {found} distinct {phase} outgroups remain after name resolution; at least {min} are required.",
        min = MIN_OUTGROUPS
    )]
    InsufficientOutgroups { phase: Phase, found: usize },
    #[error("Population alias '{0}' has no resolution.")]
    Unresolved(String),
    #[error("Model orchestration was cancelled.")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Non-expected components above this proportion flag unexpected ancestry.
    pub unexpected_threshold: f64,
    pub run_corroboration: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            unexpected_threshold: 0.05,
            run_corroboration: true,
        }
    }
}

/// One admixture model configuration with resolved population ids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub components: Vec<String>,
    pub source_ids: Vec<String>,
}

impl ModelConfig {
    fn source_key(&self) -> String {
        self.source_ids.join("+")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedCategory {
    pub name: String,
    pub triggers: Vec<String>,
    pub additions: Vec<(String, String)>,
}

/// The profile's model tables with every alias replaced by its catalog id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPlan {
    pub global: ModelConfig,
    pub global_outgroups: Vec<String>,
    pub focused_outgroups: Vec<String>,
    pub baselines: Vec<ModelConfig>,
    pub categories: Vec<ResolvedCategory>,
    pub expected_components: Vec<String>,
    /// Ids whose alias resolved below the accept threshold.
    pub low_confidence_ids: BTreeSet<String>,
}

/// Maps aliases onto resolved ids, remembering which resolutions were weak.
struct AliasLookup<'r> {
    by_alias: AHashMap<&'r str, &'r MatchResult>,
    accept_threshold: f64,
    low_confidence: BTreeSet<String>,
}

impl<'r> AliasLookup<'r> {
    fn id(&mut self, alias: &str) -> Result<String, OrchestrationError> {
        let result = self
            .by_alias
            .get(alias)
            .ok_or_else(|| OrchestrationError::Unresolved(alias.to_string()))?;
        if result.confidence < self.accept_threshold {
            self.low_confidence.insert(result.resolved_id.clone());
        }
        Ok(result.resolved_id.clone())
    }

    fn sources(&mut self, sources: &[SourceSpec]) -> Result<Vec<(String, String)>, OrchestrationError> {
        sources
            .iter()
            .map(|source| Ok((source.component.clone(), self.id(&source.population)?)))
            .collect()
    }

    fn config(&mut self, name: &str, sources: &[SourceSpec]) -> Result<ModelConfig, OrchestrationError> {
        let (components, source_ids): (Vec<String>, Vec<String>) = self
            .sources(sources)?
            .into_iter()
            .unique_by(|(_, id)| id.clone())
            .unzip();
        Ok(ModelConfig {
            name: name.to_string(),
            components,
            source_ids,
        })
    }

    fn outgroups(&mut self, aliases: &[String], phase: Phase) -> Result<Vec<String>, OrchestrationError> {
        let mut ids = Vec::with_capacity(aliases.len());
        for alias in aliases {
            let id = self.id(alias)?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.len() < MIN_OUTGROUPS {
            return Err(OrchestrationError::InsufficientOutgroups {
                phase,
                found: ids.len(),
            });
        }
        Ok(ids)
    }
}

impl ModelPlan {
    pub fn resolve(
        profile: &TargetProfile,
        resolutions: &[MatchResult],
        accept_threshold: f64,
    ) -> Result<Self, OrchestrationError> {
        let mut lookup = AliasLookup {
            by_alias: resolutions.iter().map(|r| (r.alias.as_str(), r)).collect(),
            accept_threshold,
            low_confidence: BTreeSet::new(),
        };

        let global = lookup.config("global_screen", &profile.global_sources)?;
        let baselines = profile
            .baseline_models
            .iter()
            .map(|ModelSpec { name, sources }| lookup.config(name, sources))
            .collect::<Result<Vec<_>, _>>()?;
        let categories = profile
            .unexpected_categories
            .iter()
            .map(|category| {
                Ok(ResolvedCategory {
                    name: category.name.clone(),
                    triggers: category.triggers.clone(),
                    additions: lookup.sources(&category.populations)?,
                })
            })
            .collect::<Result<Vec<_>, OrchestrationError>>()?;
        let global_outgroups = lookup.outgroups(&profile.global_outgroups, Phase::Global)?;
        let focused_outgroups = lookup.outgroups(&profile.focused_outgroups, Phase::Focused)?;

        Ok(Self {
            global,
            global_outgroups,
            focused_outgroups,
            baselines,
            categories,
            expected_components: profile.expected_components.clone(),
            low_confidence_ids: lookup.low_confidence,
        })
    }

    /// Every population id a model or test of this plan may touch.
    pub fn population_ids(&self) -> Vec<String> {
        self.global
            .source_ids
            .iter()
            .chain(self.baselines.iter().flat_map(|c| c.source_ids.iter()))
            .chain(
                self.categories
                    .iter()
                    .flat_map(|c| c.additions.iter().map(|(_, id)| id)),
            )
            .chain(self.global_outgroups.iter())
            .chain(self.focused_outgroups.iter())
            .unique()
            .cloned()
            .collect()
    }

    fn is_expected(&self, component: &str) -> bool {
        self.expected_components.iter().any(|c| c == component)
    }
}

/// One component of the proxy-weighted global breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentShare {
    pub component: String,
    pub proportion: f64,
    pub std_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnexpectedAncestry {
    pub category: String,
    pub component: String,
    pub proportion_pct: f64,
    pub recommended_populations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Interpretation {
    pub breakdown: Vec<ComponentShare>,
    pub unexpected: Vec<UnexpectedAncestry>,
    pub models_used: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum SecondaryKind {
    F3 { a: String, b: String },
    Ratio { source: String, reference: String },
}

/// One corroborating test run on the top proxy for a focused configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecondaryTest {
    pub config_name: String,
    pub source_key: String,
    pub proxy_used: String,
    pub kind: SecondaryKind,
    pub statistic: TestStatistic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BestModels {
    pub overall: Option<AncestryModel>,
    pub global: Option<AncestryModel>,
    pub focused: Option<AncestryModel>,
}

/// Highest finite p-value wins; ties keep the earliest model.
fn best_of<'a>(models: impl Iterator<Item = &'a AncestryModel>) -> Option<AncestryModel> {
    models
        .filter(|model| model.p_value.is_finite())
        .fold(None::<&AncestryModel>, |best, model| match best {
            Some(current) if current.p_value >= model.p_value => Some(current),
            _ => Some(model),
        })
        .cloned()
}

/// Everything the orchestrator produced, failures included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationReport {
    pub global_outcomes: Vec<ModelOutcome>,
    pub interpretation: Interpretation,
    pub focused_configs: Vec<ModelConfig>,
    pub focused_outcomes: Vec<ModelOutcome>,
    pub secondary_tests: Vec<SecondaryTest>,
    pub best: BestModels,
}

impl OrchestrationReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &ModelOutcome> {
        self.global_outcomes.iter().chain(self.focused_outcomes.iter())
    }

    pub fn successful(&self, phase: Phase) -> impl Iterator<Item = &AncestryModel> {
        let outcomes = match phase {
            Phase::Global => &self.global_outcomes,
            Phase::Focused => &self.focused_outcomes,
        };
        outcomes.iter().filter_map(|outcome| outcome.as_ref().ok())
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes().filter(|outcome| outcome.is_err()).count()
    }
}

/// Computes the proxy-weighted breakdown over usable global models and flags
/// every unexpected category that one of its components triggers.
pub fn interpret(
    models: &[&AncestryModel],
    proxies: &GeneticProxySet,
    plan: &ModelPlan,
    threshold: f64,
) -> Interpretation {
    let usable: Vec<&&AncestryModel> = models.iter().filter(|m| m.is_usable()).collect();
    let components: Vec<&String> = usable
        .iter()
        .flat_map(|model| model.components.iter())
        .unique()
        .collect();
    let breakdown: Vec<ComponentShare> = components
        .into_iter()
        .filter_map(|component| {
            let values: Vec<(f64, f64, f64)> = usable
                .iter()
                .filter_map(|model| {
                    let idx = model.components.iter().position(|c| c == component)?;
                    let weight = proxies.get(&model.proxy_used).map_or(0.0, |p| p.weight);
                    Some((weight, model.weights[idx], model.std_errors[idx]))
                })
                .collect();
            pooled_estimate(&values).map(|(proportion, std_error)| ComponentShare {
                component: component.clone(),
                proportion,
                std_error,
            })
        })
        .collect();

    let mut unexpected = Vec::new();
    let mut flagged = AHashSet::new();
    for share in &breakdown {
        if share.proportion <= threshold || plan.is_expected(&share.component) {
            continue;
        }
        let triggered: Vec<&ResolvedCategory> = plan
            .categories
            .iter()
            .filter(|category| category.triggers.iter().any(|t| *t == share.component))
            .collect();
        if triggered.is_empty() {
            warn!(
                "Unexpected component {} at {:.1}% has no configured category",
                share.component,
                share.proportion * 100.0
            );
        }
        for category in triggered {
            if flagged.insert(category.name.clone()) {
                info!(
                    "Unexpected ancestry: {} at {:.1}% triggers '{}'",
                    share.component,
                    share.proportion * 100.0,
                    category.name
                );
                unexpected.push(UnexpectedAncestry {
                    category: category.name.clone(),
                    component: share.component.clone(),
                    proportion_pct: share.proportion * 100.0,
                    recommended_populations: category.additions.iter().map(|(_, id)| id.clone()).collect(),
                });
            }
        }
    }
    Interpretation {
        breakdown,
        unexpected,
        models_used: usable.len(),
    }
}

/// Baselines first, then one `core_plus_<category>` per flagged category built on
/// the first baseline's sources.
pub fn adaptive_configs(plan: &ModelPlan, interpretation: &Interpretation) -> Vec<ModelConfig> {
    let mut configs = plan.baselines.clone();
    let Some(core) = plan.baselines.first() else {
        return configs;
    };
    for flagged in &interpretation.unexpected {
        let Some(category) = plan.categories.iter().find(|c| c.name == flagged.category) else {
            continue;
        };
        let mut components = core.components.clone();
        let mut source_ids = core.source_ids.clone();
        for (component, id) in &category.additions {
            if !source_ids.contains(id) {
                components.push(component.clone());
                source_ids.push(id.clone());
            }
        }
        configs.push(ModelConfig {
            name: format!("core_plus_{}", category.name),
            components,
            source_ids,
        });
    }
    configs
}

pub struct Orchestrator<'a> {
    engine: &'a dyn StatisticsEngine,
    handle: &'a StatsHandle,
    plan: &'a ModelPlan,
    settings: &'a OrchestratorSettings,
    cancel: &'a CancellationToken,
    observer: &'a dyn PipelineObserver,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        engine: &'a dyn StatisticsEngine,
        handle: &'a StatsHandle,
        plan: &'a ModelPlan,
        settings: &'a OrchestratorSettings,
        cancel: &'a CancellationToken,
        observer: &'a dyn PipelineObserver,
    ) -> Self {
        Self {
            engine,
            handle,
            plan,
            settings,
            cancel,
            observer,
        }
    }

    fn check_cancelled(&self) -> Result<(), OrchestrationError> {
        if self.cancel.is_cancelled() {
            Err(OrchestrationError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn run_model(&self, phase: Phase, proxy: &GeneticProxy, config: &ModelConfig, outgroups: &[String]) -> ModelOutcome {
        let failure = |reason: String| {
            warn!(
                "{phase} model '{}' on {} failed: {reason}",
                config.name, proxy.population_id
            );
            Err(ModelFailure {
                phase,
                proxy_used: proxy.population_id.clone(),
                config_name: config.name.clone(),
                source_ids: config.source_ids.clone(),
                reason,
            })
        };
        if config.source_ids.contains(&proxy.population_id) {
            return failure("the proxy is one of the model's sources".to_string());
        }
        let usable_outgroups: Vec<String> = outgroups
            .iter()
            .filter(|id| !config.source_ids.contains(id) && **id != proxy.population_id)
            .cloned()
            .collect();
        if usable_outgroups.len() < MIN_OUTGROUPS {
            return failure(format!(
                "only {} outgroups remain after removing overlaps with the sources (need {MIN_OUTGROUPS})",
                usable_outgroups.len()
            ));
        }
        match self.engine.admixture(
            self.handle,
            &proxy.population_id,
            &config.source_ids,
            &usable_outgroups,
        ) {
            Ok(fit) if fit.weights.len() != config.source_ids.len() || fit.std_errors.len() != config.source_ids.len() => {
                failure(format!(
                    "engine returned {} weights and {} standard errors for {} sources",
                    fit.weights.len(),
                    fit.std_errors.len(),
                    config.source_ids.len()
                ))
            }
            Ok(fit) => Ok(AncestryModel {
                phase,
                proxy_used: proxy.population_id.clone(),
                config_name: config.name.clone(),
                components: config.components.clone(),
                source_ids: config.source_ids.clone(),
                outgroup_ids: usable_outgroups,
                weights: fit.weights,
                std_errors: fit.std_errors,
                p_value: fit.p_value,
            }),
            Err(err) => failure(err.to_string()),
        }
    }

    fn fan_out(
        &self,
        phase: Phase,
        stage: PipelineStage,
        jobs: Vec<(&GeneticProxy, &ModelConfig)>,
        outgroups: &[String],
    ) -> Vec<ModelOutcome> {
        let counter = StageCounter::start(self.observer, stage, jobs.len());
        let outcomes: Vec<ModelOutcome> = jobs
            .par_iter()
            .map(|(proxy, config)| {
                let outcome = self.run_model(phase, proxy, config, outgroups);
                counter.tick();
                outcome
            })
            .collect();
        counter.finish();
        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        info!(
            "{phase} phase: {succeeded} of {} model(s) succeeded",
            outcomes.len()
        );
        outcomes
    }

    /// Runs f3 and ratio tests for each distinct source configuration. The target is
    /// the highest-ranked proxy that is not itself one of the configuration's sources;
    /// configurations with no such proxy are skipped.
    fn corroborate(&self, proxies: &GeneticProxySet, configs: &[ModelConfig]) -> Vec<SecondaryTest> {
        let mut seen_keys = AHashSet::new();
        let mut specs: Vec<(&ModelConfig, &GeneticProxy, SecondaryKind)> = Vec::new();
        for config in configs {
            if !seen_keys.insert(config.source_key()) || config.source_ids.len() < 2 {
                continue;
            }
            let Some(proxy) = proxies
                .iter()
                .find(|proxy| !config.source_ids.contains(&proxy.population_id))
            else {
                warn!(
                    "Skipping corroboration of '{}': every proxy is one of its sources",
                    config.name
                );
                continue;
            };
            for (a, b) in config.source_ids.iter().tuple_combinations() {
                specs.push((
                    config,
                    proxy,
                    SecondaryKind::F3 {
                        a: a.clone(),
                        b: b.clone(),
                    },
                ));
            }
            for (idx, source) in config.source_ids.iter().enumerate() {
                let reference = &config.source_ids[(idx + 1) % config.source_ids.len()];
                specs.push((
                    config,
                    proxy,
                    SecondaryKind::Ratio {
                        source: source.clone(),
                        reference: reference.clone(),
                    },
                ));
            }
        }

        let anchors: Vec<&String> = self.plan.focused_outgroups.iter().take(2).collect();
        let counter = StageCounter::start(self.observer, PipelineStage::Corroboration, specs.len());
        let tests: Vec<SecondaryTest> = specs
            .par_iter()
            .filter_map(|(config, proxy, kind)| {
                let result = match kind {
                    SecondaryKind::F3 { a, b } => self.engine.f3(self.handle, &proxy.population_id, a, b),
                    SecondaryKind::Ratio { source, reference } => self.engine.ratio(
                        self.handle,
                        &proxy.population_id,
                        source,
                        reference,
                        anchors[0],
                        anchors[1],
                    ),
                };
                counter.tick();
                match result {
                    Ok(statistic) => Some(SecondaryTest {
                        config_name: config.name.clone(),
                        source_key: config.source_key(),
                        proxy_used: proxy.population_id.clone(),
                        kind: kind.clone(),
                        statistic,
                    }),
                    Err(err) => {
                        warn!("Corroborating test {kind:?} for '{}' failed: {err}", config.name);
                        None
                    }
                }
            })
            .collect();
        counter.finish();
        info!("{} of {} corroborating test(s) completed", tests.len(), specs.len());
        tests
    }

    pub fn run(&self, proxies: &GeneticProxySet) -> Result<OrchestrationReport, OrchestrationError> {
        self.check_cancelled()?;
        let global_jobs: Vec<(&GeneticProxy, &ModelConfig)> =
            proxies.iter().map(|proxy| (proxy, &self.plan.global)).collect();
        let global_outcomes = self.fan_out(
            Phase::Global,
            PipelineStage::GlobalScreening,
            global_jobs,
            &self.plan.global_outgroups,
        );

        self.check_cancelled()?;
        let global_models: Vec<&AncestryModel> =
            global_outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
        let interpretation = interpret(
            &global_models,
            proxies,
            self.plan,
            self.settings.unexpected_threshold,
        );
        let focused_configs = adaptive_configs(self.plan, &interpretation);
        info!(
            "Focused pass: {} configuration(s) x {} prox(ies)",
            focused_configs.len(),
            proxies.len()
        );

        self.check_cancelled()?;
        let focused_jobs: Vec<(&GeneticProxy, &ModelConfig)> = focused_configs
            .iter()
            .cartesian_product(proxies.iter())
            .map(|(config, proxy)| (proxy, config))
            .collect();
        let focused_outcomes = self.fan_out(
            Phase::Focused,
            PipelineStage::FocusedExecution,
            focused_jobs,
            &self.plan.focused_outgroups,
        );

        self.check_cancelled()?;
        let secondary_tests = if self.settings.run_corroboration && self.plan.focused_outgroups.len() >= 2 {
            self.corroborate(proxies, &focused_configs)
        } else {
            Vec::new()
        };

        let successful_global = global_outcomes.iter().filter_map(|o| o.as_ref().ok());
        let successful_focused = focused_outcomes.iter().filter_map(|o| o.as_ref().ok());
        let best = BestModels {
            overall: best_of(successful_global.clone().chain(successful_focused.clone())),
            global: best_of(successful_global),
            focused: best_of(successful_focused),
        };
        if let Some(best) = &best.overall {
            info!(
                "Best model: {} ({}) on {} with p = {:.3e}",
                best.config_name, best.phase, best.proxy_used, best.p_value
            );
        }

        Ok(OrchestrationReport {
            global_outcomes,
            interpretation,
            focused_configs,
            focused_outcomes,
            secondary_tests,
            best,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::stats::{AdmixtureFit, ExtractionThresholds, StatsError};
    use crate::types::MatchMethod;
    use std::sync::Mutex;

    fn exact(ids: &[&str]) -> Vec<MatchResult> {
        ids.iter()
            .map(|id| MatchResult::new(id, id, 1.0, MatchMethod::Exact))
            .collect()
    }

    fn profile() -> TargetProfile {
        TargetProfile::builtin("south_asia").unwrap()
    }

    #[test]
    fn plan_resolves_every_alias() {
        let profile = profile();
        let resolutions = exact(&profile.referenced_aliases().iter().map(String::as_str).collect::<Vec<_>>());
        let plan = ModelPlan::resolve(&profile, &resolutions, 0.8).unwrap();
        assert!(plan.global_outgroups.len() >= MIN_OUTGROUPS);
        assert_eq!(plan.baselines.len(), profile.baseline_models.len());
        assert!(plan.low_confidence_ids.is_empty());
        assert!(plan.population_ids().contains(&"Han.DG".to_string()));
    }

    #[test]
    fn collapsed_outgroups_are_a_configuration_error() {
        let profile = profile();
        let mut resolutions = exact(&profile.referenced_aliases().iter().map(String::as_str).collect::<Vec<_>>());
        for result in resolutions.iter_mut() {
            if profile.global_outgroups.contains(&result.alias) {
                result.resolved_id = "Mbuti.DG".into();
            }
        }
        let err = ModelPlan::resolve(&profile, &resolutions, 0.8).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InsufficientOutgroups { phase: Phase::Global, found: 1 }
        ));
    }

    #[test]
    fn missing_resolution_is_reported() {
        let profile = profile();
        let err = ModelPlan::resolve(&profile, &[], 0.8).unwrap_err();
        assert!(matches!(err, OrchestrationError::Unresolved(_)));
    }

    #[test]
    fn low_confidence_resolutions_are_tracked() {
        let profile = profile();
        let mut resolutions = exact(&profile.referenced_aliases().iter().map(String::as_str).collect::<Vec<_>>());
        resolutions[0].confidence = 0.5;
        let plan = ModelPlan::resolve(&profile, &resolutions, 0.8).unwrap();
        assert!(plan.low_confidence_ids.contains(&resolutions[0].resolved_id));
    }

    #[test]
    fn best_of_prefers_highest_p_then_first() {
        let model = |name: &str, p: f64| AncestryModel {
            phase: Phase::Global,
            proxy_used: "P".into(),
            config_name: name.into(),
            components: vec![],
            source_ids: vec![],
            outgroup_ids: vec![],
            weights: vec![],
            std_errors: vec![],
            p_value: p,
        };
        let models = [model("a", 0.1), model("b", 0.3), model("c", 0.3)];
        assert_eq!(best_of(models.iter()).unwrap().config_name, "b");
        assert!(best_of(std::iter::empty()).is_none());

        let with_nan = [model("good", 0.4), model("broken", f64::NAN)];
        assert_eq!(best_of(with_nan.iter()).unwrap().config_name, "good");
        assert!(best_of(with_nan[1..].iter()).is_none());
    }

    /// Records the target and the other populations of every f3 and ratio call.
    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingEngine {
        fn record(&self, target: &str, involved: &[&str]) {
            let involved = involved.iter().map(|id| id.to_string()).collect();
            self.calls.lock().unwrap().push((target.to_string(), involved));
        }
    }

    impl StatisticsEngine for RecordingEngine {
        fn extract(
            &self,
            populations: &[String],
            thresholds: &ExtractionThresholds,
        ) -> Result<StatsHandle, StatsError> {
            Ok(StatsHandle::InMemory(format!("{}@{}", populations.len(), thresholds.block_size)))
        }

        fn admixture(
            &self,
            handle: &StatsHandle,
            target: &str,
            sources: &[String],
            outgroups: &[String],
        ) -> Result<AdmixtureFit, StatsError> {
            assert!(matches!(handle, StatsHandle::InMemory(..)));
            assert!(outgroups.len() >= MIN_OUTGROUPS);
            assert!(!sources.iter().any(|source| source == target));
            let share = 1.0 / sources.len() as f64;
            Ok(AdmixtureFit {
                weights: vec![share; sources.len()],
                std_errors: vec![0.02; sources.len()],
                p_value: 0.2,
            })
        }

        fn f3(&self, handle: &StatsHandle, target: &str, a: &str, b: &str) -> Result<TestStatistic, StatsError> {
            assert!(matches!(handle, StatsHandle::InMemory(..)));
            self.record(target, &[a, b]);
            Ok(TestStatistic {
                estimate: -0.01,
                std_error: 0.002,
                z: -5.0,
            })
        }

        fn ratio(
            &self,
            handle: &StatsHandle,
            target: &str,
            source: &str,
            reference: &str,
            outgroup_a: &str,
            outgroup_b: &str,
        ) -> Result<TestStatistic, StatsError> {
            assert!(matches!(handle, StatsHandle::InMemory(..)));
            self.record(target, &[source, reference, outgroup_a, outgroup_b]);
            Ok(TestStatistic {
                estimate: 0.3,
                std_error: 0.05,
                z: 6.0,
            })
        }
    }

    fn proxy_set(ids: &[&str]) -> GeneticProxySet {
        let weight = 1.0 / ids.len() as f64;
        GeneticProxySet::from_normalised(
            ids.iter()
                .map(|id| GeneticProxy {
                    population_id: id.to_string(),
                    similarity: 0.9,
                    weight,
                    distance: 0.1,
                    shared_variants: 1000,
                })
                .collect(),
        )
    }

    fn orchestrate(engine: &RecordingEngine, proxies: &GeneticProxySet) -> OrchestrationReport {
        let profile = profile();
        let resolutions = exact(&profile.referenced_aliases().iter().map(String::as_str).collect::<Vec<_>>());
        let plan = ModelPlan::resolve(&profile, &resolutions, 0.8).unwrap();
        let handle = engine
            .extract(&plan.population_ids(), &ExtractionThresholds::default())
            .unwrap();
        let settings = OrchestratorSettings::default();
        let cancel = CancellationToken::new();
        Orchestrator::new(engine, &handle, &plan, &settings, &cancel, &NoopProgress)
            .run(proxies)
            .unwrap()
    }

    #[test]
    fn corroboration_skips_proxies_that_are_sources() {
        let engine = RecordingEngine::default();
        let report = orchestrate(&engine, &proxy_set(&["Iran_GanjDareh_N", "Pathan.DG"]));

        assert!(!report.secondary_tests.is_empty());
        assert!(report.secondary_tests.iter().all(|t| t.proxy_used == "Pathan.DG"));
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), report.secondary_tests.len());
        for (target, involved) in calls.iter() {
            assert!(!involved.contains(target), "{target} tested against itself");
        }
    }

    #[test]
    fn corroboration_is_skipped_when_every_proxy_is_a_source() {
        let engine = RecordingEngine::default();
        let report = orchestrate(&engine, &proxy_set(&["Iran_GanjDareh_N", "Onge.DG"]));

        assert!(report.secondary_tests.is_empty());
        assert!(engine.calls.lock().unwrap().is_empty());
        assert!(report.focused_outcomes.iter().all(|outcome| outcome.is_err()));
    }
}
