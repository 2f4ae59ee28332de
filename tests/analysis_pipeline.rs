use approx::assert_relative_eq;
use proxima::catalog::{Catalog, LocalCatalog};
use proxima::config::AnalysisConfig;
use proxima::consensus::ConsensusError;
use proxima::genotype::PersonalGenotypes;
use proxima::memory::{FixedGauge, MemoryBudget, MemoryCostModel, ScalingError};
use proxima::pipeline::{
    AnalysisRequest, Collaborators, PipelineError, prepare_selection, resolve_aliases, run_analysis,
};
use proxima::profile::TargetProfile;
use proxima::progress::{NoopProgress, PipelineStage};
use proxima::resolve::ResolutionCache;
use proxima::shared::retry::CancellationToken;
use proxima::stats::{
    AdmixtureFit, ExtractionThresholds, StatisticsEngine, StatsError, StatsHandle, TestStatistic,
};
use proxima::types::{
    AliasRequest, CorroborationLevel, EstimateStatus, MatchMethod, Phase, SignificanceLabel,
};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

const SITES: usize = 600;

/// Every population the south_asia profile refers to, with the Iranian farmer
/// group only present under its `.AG` name, plus six modern candidates.
const ANCIENT_AND_REFERENCE: [&str; 15] = [
    "Mbuti.DG",
    "Papuan.DG",
    "Karitiana.DG",
    "Russia_Ust_Ishim.DG",
    "Iran_GanjDareh_N.AG",
    "Yamnaya_Samara",
    "Onge.DG",
    "Mixe.DG",
    "Russia_MA1_HG.SG",
    "Switzerland_Bichon.SG",
    "Ami.DG",
    "Turkey_N",
    "Han.DG",
    "Kazakhstan_Central_Steppe_MLBA",
    "Turkmenistan_Gonur_BA",
];

const MODERN: [(&str, f64); 6] = [
    ("Pathan.DG", 0.50),
    ("Punjabi.DG", 0.51),
    ("Sindhi.DG", 0.52),
    ("Brahui.DG", 0.53),
    ("Balochi.DG", 0.54),
    ("Kalash.DG", 0.56),
];

/// Deterministic stand-in for the statistics engine. Weights come from a fixed
/// per-source table, normalised over the requested sources.
struct ScriptedEngine {
    fail_admixture: bool,
    extracted: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    fn new() -> Self {
        Self {
            fail_admixture: false,
            extracted: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail_admixture: true,
            ..Self::new()
        }
    }
}

fn raw_weight(source: &str) -> f64 {
    if source.contains("GanjDareh") {
        0.45
    } else if source.contains("Yamnaya") || source.contains("MLBA") || source.contains("Onge") {
        0.25
    } else if source.contains("Han") {
        0.08
    } else if source.contains("Gonur") {
        0.05
    } else {
        0.03
    }
}

// Share of each source within the three-way core model.
fn core_share(source: &str) -> f64 {
    raw_weight(source) / 0.95
}

impl StatisticsEngine for ScriptedEngine {
    fn extract(
        &self,
        populations: &[String],
        thresholds: &ExtractionThresholds,
    ) -> Result<StatsHandle, StatsError> {
        assert!(thresholds.max_missingness > 0.0);
        self.extracted.lock().unwrap().extend(populations.iter().cloned());
        Ok(StatsHandle::InMemory("scripted".into()))
    }

    fn admixture(
        &self,
        handle: &StatsHandle,
        target: &str,
        sources: &[String],
        outgroups: &[String],
    ) -> Result<AdmixtureFit, StatsError> {
        assert_eq!(handle, &StatsHandle::InMemory("scripted".into()));
        assert!(!sources.iter().any(|s| s == target));
        assert!(outgroups.len() >= 4);
        if self.fail_admixture {
            return Err(StatsError::Engine {
                operation: "qpAdm".into(),
                message: format!("singular covariance for {target}"),
            });
        }
        let total: f64 = sources.iter().map(|s| raw_weight(s)).sum();
        let p_value = match sources.len() {
            3 if sources.iter().any(|s| s == "Yamnaya_Samara") => 0.3,
            3 => 0.2,
            _ => 0.1,
        };
        Ok(AdmixtureFit {
            weights: sources.iter().map(|s| raw_weight(s) / total).collect(),
            std_errors: vec![0.02; sources.len()],
            p_value,
        })
    }

    fn f3(&self, handle: &StatsHandle, target: &str, a: &str, b: &str) -> Result<TestStatistic, StatsError> {
        assert_eq!(handle, &StatsHandle::InMemory("scripted".into()));
        assert!(target != a && target != b);
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
        assert_eq!(handle, &StatsHandle::InMemory("scripted".into()));
        assert!(source != reference && target != source);
        assert_eq!((outgroup_a, outgroup_b), ("Mbuti.DG", "Papuan.DG"));
        let estimate = core_share(source);
        Ok(TestStatistic {
            estimate,
            std_error: 0.03,
            z: estimate / 0.03,
        })
    }
}

fn write_table(dir: &Path, id: &str, frequency: f64) {
    let body: String = (0..SITES)
        .map(|i| format!("rs{i}\tA\t{frequency}\n"))
        .collect();
    fs::write(dir.join(format!("{id}.tsv")), body).unwrap();
}

fn dataset() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let freq = dir.path().join("freq");
    fs::create_dir_all(&freq).unwrap();
    let mut listing = String::new();
    for id in ANCIENT_AND_REFERENCE {
        listing.push_str(id);
        listing.push('\n');
        write_table(&freq, id, 0.05);
    }
    for (id, frequency) in MODERN {
        listing.push_str(id);
        listing.push('\n');
        write_table(&freq, id, frequency);
    }
    fs::write(dir.path().join("populations.txt"), listing).unwrap();
    dir
}

fn sample() -> PersonalGenotypes {
    PersonalGenotypes::from_calls((0..SITES).map(|i| (format!("rs{i}"), [b'A', b'G'])))
}

fn config() -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.remote.max_attempts = 1;
    config.remote.initial_backoff_ms = 1;
    config
}

/// One memory unit per population, nothing else.
fn unit_cost_config(conservative: f64, safe: f64, hard: f64) -> AnalysisConfig {
    let mut config = config();
    config.memory.budget = MemoryBudget::new(conservative, safe, hard).unwrap();
    config.memory.cost_model = MemoryCostModel {
        base: 0.0,
        per_population: 1.0,
        pairwise: 0.0,
    };
    config.memory.batch_size = 1;
    config
}

fn run(
    dataset: &Path,
    engine: &ScriptedEngine,
    cancel: &CancellationToken,
) -> Result<proxima::pipeline::AnalysisRun, PipelineError> {
    run_with(dataset, engine, cancel, &config())
}

fn run_with(
    dataset: &Path,
    engine: &ScriptedEngine,
    cancel: &CancellationToken,
    config: &AnalysisConfig,
) -> Result<proxima::pipeline::AnalysisRun, PipelineError> {
    let workdir = tempfile::tempdir().unwrap();
    let profile = TargetProfile::builtin("south_asia").unwrap();
    let genotypes = sample();
    let source = LocalCatalog::new(dataset);
    let gauge = FixedGauge(0.0);
    let observer = NoopProgress;
    let collaborators = Collaborators {
        catalog: &source,
        gauge: &gauge,
        assistant: None,
        observer: &observer,
        cancel,
    };
    run_analysis(
        &AnalysisRequest {
            sample_id: "sample_one",
            genotypes: &genotypes,
            profile: &profile,
            config,
            workdir: workdir.path(),
        },
        &collaborators,
        engine,
        &ResolutionCache::new(),
    )
}

#[test]
fn catalog_names_resolve_exactly() {
    let profile = TargetProfile::builtin("south_asia").unwrap();
    let catalog = Catalog::from_ids(
        [
            "Iran_N",
            "Onge.DG",
            "Yamnaya_Samara",
            "Mbuti.DG",
            "Han.DG",
            "Papuan.DG",
            "Karitiana.DG",
        ],
        &profile.geographic_keywords,
    )
    .unwrap();
    let aliases: Vec<AliasRequest> = ["Iran_N", "Onge.DG", "Yamnaya_Samara"]
        .into_iter()
        .map(AliasRequest::from)
        .collect();
    let results = resolve_aliases(
        &catalog,
        &profile,
        &config(),
        &aliases,
        None,
        &ResolutionCache::new(),
    );
    assert_eq!(results.len(), 3);
    for (result, alias) in results.iter().zip(["Iran_N", "Onge.DG", "Yamnaya_Samara"]) {
        assert_eq!(result.alias, alias);
        assert_eq!(result.resolved_id, alias);
        assert_eq!(result.method, MatchMethod::Exact);
        assert_eq!(result.confidence, 1.0);
    }
}

#[test]
fn platform_suffixed_names_resolve_as_variants() {
    let profile = TargetProfile::builtin("south_asia").unwrap();
    let catalog = Catalog::from_ids(
        ["Iran_GanjDareh_N.AG", "Iran_N", "Mbuti.DG"],
        &profile.geographic_keywords,
    )
    .unwrap();
    let results = resolve_aliases(
        &catalog,
        &profile,
        &config(),
        &[AliasRequest::from("Iran_GanjDareh_N")],
        None,
        &ResolutionCache::new(),
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].resolved_id, "Iran_GanjDareh_N.AG");
    assert_eq!(results[0].method, MatchMethod::SuffixVariant);
    assert_relative_eq!(results[0].confidence, 0.95);
}

#[test]
fn dry_run_stops_after_scaling() {
    let dataset = dataset();
    let profile = TargetProfile::builtin("south_asia").unwrap();
    let config = config();
    let source = LocalCatalog::new(dataset.path());
    let gauge = FixedGauge(0.0);
    let cancel = CancellationToken::new();
    let collaborators = Collaborators {
        catalog: &source,
        gauge: &gauge,
        assistant: None,
        observer: &NoopProgress,
        cancel: &cancel,
    };
    let prepared = prepare_selection(&profile, &config, &collaborators, &ResolutionCache::new()).unwrap();

    assert_eq!(prepared.catalog.len(), 21);
    assert_eq!(prepared.selection.len(), 21);
    let iran = prepared
        .resolutions
        .iter()
        .find(|r| r.alias == "Iran_GanjDareh_N")
        .unwrap();
    assert_eq!(iran.resolved_id, "Iran_GanjDareh_N.AG");
    assert_eq!(iran.method, MatchMethod::SuffixVariant);
    assert!(prepared.plan.global.source_ids.contains(&"Iran_GanjDareh_N.AG".to_string()));
    assert!(prepared.plan.low_confidence_ids.is_empty());
    for must_have in ["Mbuti.DG", "Onge.DG", "Iran_GanjDareh_N.AG"] {
        assert!(prepared.selection.is_must_have(must_have));
    }
}

#[test]
fn tight_budget_keeps_every_plan_population() {
    let dataset = dataset();
    let profile = TargetProfile::builtin("south_asia").unwrap();
    let config = unit_cost_config(16.0, 17.0, 18.0);
    let source = LocalCatalog::new(dataset.path());
    let gauge = FixedGauge(0.0);
    let cancel = CancellationToken::new();
    let collaborators = Collaborators {
        catalog: &source,
        gauge: &gauge,
        assistant: None,
        observer: &NoopProgress,
        cancel: &cancel,
    };
    let prepared = prepare_selection(&profile, &config, &collaborators, &ResolutionCache::new()).unwrap();

    assert!(prepared.selection.len() <= 18);
    assert_eq!(prepared.extraction.len(), prepared.selection.len());
    assert!(prepared.extraction.estimated_cost <= config.memory.budget.hard_limit);
    for id in prepared.plan.population_ids() {
        assert!(prepared.selection.contains(&id), "{id} was scaled away");
        assert!(prepared.selection.is_must_have(&id));
    }
}

#[test]
fn model_plan_above_the_hard_limit_is_refused_before_extraction() {
    let dataset = dataset();
    let engine = ScriptedEngine::new();
    let config = unit_cost_config(5.0, 7.5, 8.0);
    let err = run_with(dataset.path(), &engine, &CancellationToken::new(), &config).unwrap_err();
    assert!(
        matches!(err, PipelineError::Scaling(ScalingError::BudgetExceeded { .. })),
        "unexpected error: {err}"
    );
    assert!(engine.extracted.lock().unwrap().is_empty());
}

#[test]
fn full_analysis_produces_a_corroborated_consensus() {
    let dataset = dataset();
    let engine = ScriptedEngine::new();
    let run = run(dataset.path(), &engine, &CancellationToken::new()).unwrap();

    let proxy_ids: Vec<&str> = run.proxies.iter().map(|p| p.population_id.as_str()).collect();
    assert_eq!(
        proxy_ids,
        ["Pathan.DG", "Punjabi.DG", "Sindhi.DG", "Brahui.DG", "Balochi.DG"]
    );
    assert_relative_eq!(run.proxies.weight_sum(), 1.0, epsilon = 1e-12);

    let extracted = engine.extracted.lock().unwrap();
    for id in run.plan.population_ids() {
        assert!(extracted.contains(&id), "{id} was not extracted");
    }
    assert!(extracted.contains(&"Kalash.DG".to_string()));
    assert_eq!(extracted.len(), run.extraction.len());
    drop(extracted);

    assert_eq!(run.report.global_outcomes.len(), 5);
    assert_eq!(run.report.interpretation.unexpected.len(), 1);
    assert_eq!(run.report.interpretation.unexpected[0].category, "east_asian");
    let focused_names: Vec<&str> = run
        .report
        .focused_configs
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(
        focused_names,
        ["three_way", "three_way_mlba", "four_way_bmac", "core_plus_east_asian"]
    );
    assert_eq!(run.report.focused_outcomes.len(), 20);
    assert_eq!(run.report.failure_count(), 0);
    assert!(!run.report.secondary_tests.is_empty());
    assert!(
        run.report
            .secondary_tests
            .iter()
            .all(|t| t.proxy_used == "Pathan.DG")
    );

    let best = run.report.best.overall.as_ref().unwrap();
    assert_eq!(best.config_name, "three_way");
    assert_eq!(best.phase, Phase::Focused);
    assert_eq!(best.proxy_used, "Pathan.DG");

    let consensus = &run.consensus;
    assert_eq!(consensus.status, EstimateStatus::Calculated);
    let primary = consensus.primary.as_ref().unwrap();
    assert_eq!(
        primary.source_ids,
        ["Iran_GanjDareh_N.AG", "Yamnaya_Samara", "Onge.DG"]
    );
    assert_eq!(primary.model_count, 5);
    assert_relative_eq!(primary.geometric_p, 0.3, epsilon = 1e-12);

    let names: Vec<&str> = consensus
        .components
        .iter()
        .map(|c| c.component_name.as_str())
        .collect();
    assert_eq!(names, ["Iranian_Farmer", "Steppe", "AASI"]);
    let total: f64 = consensus.components.iter().map(|c| c.point_estimate_pct).sum();
    assert_relative_eq!(total, 100.0, epsilon = 1e-9);
    let iranian = &consensus.components[0];
    assert_relative_eq!(iranian.point_estimate_pct, 45.0 / 0.95, epsilon = 1e-9);
    // Strong corroboration narrows the pooled 2% standard error by 0.8.
    assert_relative_eq!(iranian.std_error_pct, 1.6, epsilon = 1e-9);
    for component in &consensus.components {
        assert_eq!(component.corroboration_level, CorroborationLevel::Strong);
        assert_eq!(component.significance_label, SignificanceLabel::HighlySignificant);
        assert!(!component.low_confidence_resolution);
        let (lower, upper) = component.confidence_interval;
        assert!(lower <= component.point_estimate_pct && component.point_estimate_pct <= upper);
    }

    let json: serde_json::Value = serde_json::from_str(&run.export.to_json().unwrap()).unwrap();
    assert_eq!(json["sample_id"], "sample_one");
    assert_eq!(json["status"], "calculated");
    assert_eq!(json["models"].as_array().unwrap().len(), 25);
    assert_eq!(json["coverage"]["total_populations"], 21);
    assert_eq!(json["coverage"]["extracted_populations"], 21);
    assert_eq!(json["proxies"].as_array().unwrap().len(), 5);
    assert_eq!(json["closest_populations"][0]["population"], "Pathan.DG");
    assert_eq!(json["unexpected_ancestry"][0]["recommended_populations"][0], "Han.DG");
}

#[test]
fn repeated_runs_are_identical() {
    let dataset = dataset();
    let first = run(dataset.path(), &ScriptedEngine::new(), &CancellationToken::new()).unwrap();
    let mut second = run(dataset.path(), &ScriptedEngine::new(), &CancellationToken::new()).unwrap();
    second.export.generated_at = first.export.generated_at.clone();
    assert_eq!(first.export, second.export);
    assert_eq!(first.consensus, second.consensus);
}

#[test]
fn no_successful_model_is_fatal() {
    let dataset = dataset();
    let err = run(dataset.path(), &ScriptedEngine::failing(), &CancellationToken::new()).unwrap_err();
    assert!(
        matches!(err, PipelineError::Consensus(ConsensusError::NoUsableModel)),
        "unexpected error: {err}"
    );
}

#[test]
fn missing_frequency_table_is_fatal() {
    let dataset = dataset();
    fs::remove_file(dataset.path().join("freq").join("Kalash.DG.tsv")).unwrap();
    let err = run(dataset.path(), &ScriptedEngine::new(), &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, PipelineError::Catalog(_)), "unexpected error: {err}");
}

#[test]
fn cancellation_is_reported_with_its_stage() {
    let dataset = dataset();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run(dataset.path(), &ScriptedEngine::new(), &cancel).unwrap_err();
    assert!(
        matches!(err, PipelineError::Cancelled(PipelineStage::Resolution)),
        "unexpected error: {err}"
    );
}
