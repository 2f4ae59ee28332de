// ========================================================================================
//
//                                 End-to-End Analysis Driver
//
// ========================================================================================
//
// catalog -> resolve -> curate -> scale -> download -> proxies -> extract ->
// orchestrate -> consensus -> export
//
// Every fatal condition of every stage folds into `PipelineError`. Per-model failures
// never surface here; they travel inside the orchestration report.

use crate::assist::AssistedResolver;
use crate::catalog::{Catalog, CatalogError, CatalogSource, fetch_with_retries, load_catalog};
use crate::config::{AnalysisConfig, ConfigError};
use crate::consensus::{ConsensusError, ConsensusInputs, ConsensusResult, build_consensus};
use crate::curate::{CurateError, TierScorer, curate};
use crate::export::{AnalysisExport, ExportError, ExportInputs};
use crate::genotype::{GenotypeError, PersonalGenotypes, load_frequency_tables};
use crate::memory::{ExtractionSet, MemoryGauge, ScaledSelection, ScalingController, ScalingError};
use crate::orchestrate::{ModelPlan, OrchestrationError, OrchestrationReport, Orchestrator};
use crate::profile::{ProfileError, TargetProfile};
use crate::progress::{PipelineObserver, PipelineStage, StageCounter};
use crate::proxy::{ProxyError, identify_proxies};
use crate::resolve::{NameResolver, ResolutionCache};
use crate::shared::retry::CancellationToken;
use crate::stats::{StatisticsEngine, StatsError};
use crate::types::{AliasRequest, GeneticProxySet, MatchResult, Phase};
use ahash::AHashMap;
use chrono::Utc;
use itertools::Itertools;
use log::info;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Curate(#[from] CurateError),
    #[error(transparent)]
    Scaling(#[from] ScalingError),
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("Statistics extraction failed: {0}")]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("Must-have population '{0}' has no resolution.")]
    UnresolvedMustHave(String),
    #[error("Analysis was cancelled during {0}.")]
    Cancelled(PipelineStage),
}

/// The external systems an analysis talks to, apart from the statistics engine.
pub struct Collaborators<'a> {
    pub catalog: &'a dyn CatalogSource,
    pub gauge: &'a dyn MemoryGauge,
    pub assistant: Option<&'a dyn AssistedResolver>,
    pub observer: &'a dyn PipelineObserver,
    pub cancel: &'a CancellationToken,
}

pub struct AnalysisRequest<'a> {
    pub sample_id: &'a str,
    pub genotypes: &'a PersonalGenotypes,
    pub profile: &'a TargetProfile,
    pub config: &'a AnalysisConfig,
    /// Downloaded frequency tables land in `<workdir>/freq`.
    pub workdir: &'a Path,
}

/// The population selection and model plan, before any statistics are computed.
#[derive(Debug)]
pub struct PreparedSelection {
    pub catalog: Catalog,
    pub resolutions: Vec<MatchResult>,
    pub plan: ModelPlan,
    pub selection: ScaledSelection,
    pub extraction: ExtractionSet,
}

/// Everything a finished analysis produced.
#[derive(Debug)]
pub struct AnalysisRun {
    pub export: AnalysisExport,
    pub resolutions: Vec<MatchResult>,
    pub plan: ModelPlan,
    pub selection: ScaledSelection,
    pub extraction: ExtractionSet,
    pub proxies: GeneticProxySet,
    pub report: OrchestrationReport,
    pub consensus: ConsensusResult,
}

fn check_cancelled(cancel: &CancellationToken, stage: PipelineStage) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled(stage))
    } else {
        Ok(())
    }
}

/// Runs one stage that has no natural sub-steps, reporting it as a single step.
fn single_step<T>(
    observer: &dyn PipelineObserver,
    stage: PipelineStage,
    work: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let counter = StageCounter::start(observer, stage, 1);
    let result = work();
    counter.tick();
    counter.finish();
    result
}

/// Resolves `aliases` against an already listed catalog.
pub fn resolve_aliases(
    catalog: &Catalog,
    profile: &TargetProfile,
    config: &AnalysisConfig,
    aliases: &[AliasRequest],
    assistant: Option<&dyn AssistedResolver>,
    cache: &ResolutionCache,
) -> Vec<MatchResult> {
    let resolver = NameResolver::new(catalog, profile, &config.resolver);
    resolver.resolve_all(aliases, cache, assistant, &config.remote.retry_policy())
}

/// Lists the catalog, resolves every profile alias, curates the tiers and fits the
/// selection into the memory budget. Every population of the model plan is a
/// must-have, so the budgeted selection is the extraction set.
pub fn prepare_selection(
    profile: &TargetProfile,
    config: &AnalysisConfig,
    collaborators: &Collaborators<'_>,
    cache: &ResolutionCache,
) -> Result<PreparedSelection, PipelineError> {
    let observer = collaborators.observer;
    let cancel = collaborators.cancel;
    let policy = config.remote.retry_policy();

    config.validate()?;
    profile.validate()?;

    let catalog = single_step(observer, PipelineStage::Catalog, || {
        Ok(load_catalog(collaborators.catalog, &profile.geographic_keywords, &policy)?)
    })?;

    check_cancelled(cancel, PipelineStage::Resolution)?;
    let aliases: Vec<AliasRequest> = profile
        .referenced_aliases()
        .iter()
        .map(|alias| AliasRequest::new(alias.as_str()))
        .collect();
    let resolutions = single_step(observer, PipelineStage::Resolution, || {
        Ok(resolve_aliases(
            &catalog,
            profile,
            config,
            &aliases,
            collaborators.assistant,
            cache,
        ))
    })?;
    let plan = ModelPlan::resolve(profile, &resolutions, config.resolver.accept_threshold)?;
    if !plan.low_confidence_ids.is_empty() {
        info!(
            "Low-confidence resolutions (labels will be demoted): {}",
            plan.low_confidence_ids.iter().join(", ")
        );
    }

    let by_alias: AHashMap<&str, &MatchResult> =
        resolutions.iter().map(|r| (r.alias.as_str(), r)).collect();
    let mut must_haves: Vec<String> = profile
        .must_have
        .iter()
        .map(|alias| {
            by_alias
                .get(alias.as_str())
                .map(|result| result.resolved_id.clone())
                .ok_or_else(|| PipelineError::UnresolvedMustHave(alias.clone()))
        })
        .collect::<Result<_, _>>()?;
    must_haves.extend(plan.population_ids());

    let curated = single_step(observer, PipelineStage::Curation, || {
        let scorer = TierScorer::new(&profile.tier_rules, &profile.suffix_multipliers);
        Ok(curate(&catalog, &scorer, &config.tiers, &must_haves)?)
    })?;

    check_cancelled(cancel, PipelineStage::MemoryScaling)?;
    let selection = single_step(observer, PipelineStage::MemoryScaling, || {
        Ok(ScalingController::new(&config.memory, collaborators.gauge, cancel).run(curated)?)
    })?;
    info!(
        "Selected {} populations ({} added, {} removed), estimated memory {:.2}",
        selection.len(),
        selection.expansion.len(),
        selection.removed.len(),
        selection.estimated_cost
    );
    let extraction = ExtractionSet::plan(&selection, plan.population_ids(), &config.memory)?;

    Ok(PreparedSelection {
        catalog,
        resolutions,
        plan,
        selection,
        extraction,
    })
}

pub fn run_analysis(
    request: &AnalysisRequest<'_>,
    collaborators: &Collaborators<'_>,
    engine: &dyn StatisticsEngine,
    cache: &ResolutionCache,
) -> Result<AnalysisRun, PipelineError> {
    let AnalysisRequest {
        sample_id,
        genotypes,
        profile,
        config,
        workdir,
    } = *request;
    let observer = collaborators.observer;
    let cancel = collaborators.cancel;
    let policy = config.remote.retry_policy();

    let PreparedSelection {
        resolutions,
        plan,
        selection,
        extraction,
        ..
    } = prepare_selection(profile, config, collaborators, cache)?;

    check_cancelled(cancel, PipelineStage::Download)?;
    let selected_ids = selection.ids();
    let tables = single_step(observer, PipelineStage::Download, || {
        let paths = fetch_with_retries(
            collaborators.catalog,
            &selected_ids,
            &workdir.join("freq"),
            &policy,
        )?;
        let pairs: Vec<_> = selected_ids.iter().cloned().zip(paths).collect();
        Ok(load_frequency_tables(&pairs)?)
    })?;

    check_cancelled(cancel, PipelineStage::ProxyIdentification)?;
    let (proxies, distances) = single_step(observer, PipelineStage::ProxyIdentification, || {
        Ok(identify_proxies(genotypes, &tables, &config.proxy)?)
    })?;

    check_cancelled(cancel, PipelineStage::Extraction)?;
    let handle = single_step(observer, PipelineStage::Extraction, || {
        Ok(engine.extract(&extraction.ids, &config.stats.thresholds)?)
    })?;
    info!(
        "Extracted statistics for {} populations, estimated memory {:.2}",
        extraction.len(),
        extraction.estimated_cost
    );

    let report = Orchestrator::new(
        engine,
        &handle,
        &plan,
        &config.orchestrator,
        cancel,
        observer,
    )
    .run(&proxies)?;
    info!(
        "Orchestration finished: {} model(s), {} failure(s), {} corroborating test(s)",
        report.outcomes().count(),
        report.failure_count(),
        report.secondary_tests.len()
    );

    check_cancelled(cancel, PipelineStage::Consensus)?;
    let consensus = single_step(observer, PipelineStage::Consensus, || {
        let focused: Vec<_> = report.successful(Phase::Focused).collect();
        Ok(build_consensus(
            &ConsensusInputs {
                focused: &focused,
                proxies: &proxies,
                tests: &report.secondary_tests,
                interpretation: &report.interpretation,
                low_confidence_ids: &plan.low_confidence_ids,
            },
            &config.consensus,
        )?)
    })?;

    let export = AnalysisExport::assemble(
        &ExportInputs {
            sample_id,
            profile: &profile.name,
            consensus: &consensus,
            report: &report,
            proxies: &proxies,
            distances: &distances,
            resolutions: &resolutions,
            selection: &selection,
            extraction: &extraction,
            budget: &config.memory.budget,
        },
        Utc::now(),
    );

    Ok(AnalysisRun {
        export,
        resolutions,
        plan,
        selection,
        extraction,
        proxies,
        report,
        consensus,
    })
}
