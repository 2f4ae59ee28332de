// ========================================================================================
//
//                              Proxima Command-Line Front End
//
// ========================================================================================
//
// Thin shell over the library: parse arguments, load configuration and profile, wire
// the real collaborators (catalog, statistics engine, memory gauge, optional assisted
// resolver), drive the pipeline and write the export.

#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use proxima::assist::{AssistedResolver, HttpAssistedResolver};
use proxima::catalog::{CatalogSource, HttpCatalog, LocalCatalog, load_catalog};
use proxima::config::AnalysisConfig;
use proxima::export::Coverage;
use proxima::genotype::PersonalGenotypes;
use proxima::memory::{FixedGauge, MemoryGauge, ProcessMemoryGauge};
use proxima::pipeline::{
    AnalysisRequest, Collaborators, PreparedSelection, prepare_selection, resolve_aliases,
    run_analysis,
};
use proxima::profile::TargetProfile;
use proxima::progress::{PipelineObserver, PipelineStage};
use proxima::resolve::ResolutionCache;
use proxima::shared::retry::CancellationToken;
use proxima::stats::ProcessStatisticsEngine;
use proxima::types::AliasRequest;
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;
use std::time::Instant;

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Parser)]
#[command(
    name = "proxima",
    version,
    about = "Proxy-based ancestry estimation against large reference population catalogs."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args)]
struct CommonArgs {
    /// TOML configuration file; defaults apply to anything it omits
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Built-in profile name or path to a profile TOML
    #[arg(long, default_value = "south_asia")]
    profile: String,

    /// Catalog directory or http(s) base URL; overrides `remote.catalog`
    #[arg(long, value_name = "LOCATION")]
    catalog: Option<String>,

    /// Endpoint of the assisted name resolver; overrides `assist.endpoint`
    #[arg(long, value_name = "URL")]
    assist_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis for one personal genotype file
    #[command(about = "Estimate ancestry composition (outputs: <sample>.proxima.json)")]
    Analyze {
        #[command(flatten)]
        common: CommonArgs,

        /// 23andMe or AncestryDNA raw data export (optionally gzip'd)
        #[arg(value_name = "SAMPLE_PATH")]
        sample: PathBuf,

        /// Identifier recorded in the export; defaults to the sample file stem
        #[arg(long)]
        sample_id: Option<String>,

        /// Output JSON path
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Directory for downloaded frequency tables
        #[arg(long, default_value = "proxima_work")]
        workdir: PathBuf,

        /// Stop after memory scaling and print the selection; no statistics are computed
        #[arg(long)]
        dry_run: bool,

        /// Use a fixed baseline (GiB) instead of measuring process memory
        #[arg(long, value_name = "GIB")]
        baseline_memory: Option<f64>,
    },

    /// Resolve population names against the catalog and print the matches
    #[command(about = "Resolve population aliases only")]
    Resolve {
        #[command(flatten)]
        common: CommonArgs,

        /// Aliases to resolve; the profile's own aliases when empty
        #[arg(value_name = "ALIAS")]
        aliases: Vec<String>,
    },
}

/// Drives one indicatif bar per pipeline stage.
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(message.to_string());
    pb
}

impl PipelineObserver for BarProgress {
    fn on_stage_start(&self, stage: PipelineStage, total_steps: usize) {
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(create_progress_bar(total_steps as u64, stage.describe()));
        }
    }

    fn on_stage_advance(&self, stage: PipelineStage, completed_steps: usize) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.set_position(completed_steps as u64);
                bar.set_message(stage.describe());
            }
        }
    }

    fn on_stage_finish(&self, stage: PipelineStage) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
        eprintln!("> Finished {stage}");
    }
}

fn load_config(common: &CommonArgs) -> CliResult<AnalysisConfig> {
    let mut config = match &common.config {
        Some(path) => {
            eprintln!("> Loading configuration from {}", path.display());
            AnalysisConfig::load(path)?
        }
        None => AnalysisConfig::default(),
    };
    if let Some(catalog) = &common.catalog {
        config.remote.catalog = Some(catalog.clone());
    }
    if let Some(endpoint) = &common.assist_endpoint {
        config.assist.endpoint = Some(endpoint.clone());
    }
    config.validate()?;
    Ok(config)
}

fn load_profile(name_or_path: &str) -> CliResult<TargetProfile> {
    let path = Path::new(name_or_path);
    let profile = if path.is_file() {
        TargetProfile::load(path)?
    } else {
        TargetProfile::builtin(name_or_path)?
    };
    eprintln!("> Using profile '{}': {}", profile.name, profile.description);
    Ok(profile)
}

fn catalog_source(config: &AnalysisConfig) -> CliResult<Box<dyn CatalogSource>> {
    let location = config
        .remote
        .catalog
        .as_deref()
        .ok_or("No catalog configured; pass --catalog or set remote.catalog")?;
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpCatalog::new(location, config.remote.timeout())?))
    } else {
        Ok(Box::new(LocalCatalog::new(location)))
    }
}

fn assisted_resolver(config: &AnalysisConfig) -> CliResult<Option<HttpAssistedResolver>> {
    match &config.assist.endpoint {
        Some(endpoint) => Ok(Some(HttpAssistedResolver::new(
            endpoint,
            &config.assist.api_key_env,
            config.assist.model.clone(),
            config.remote.timeout(),
        )?)),
        None => Ok(None),
    }
}

fn print_selection(prepared: &PreparedSelection, config: &AnalysisConfig) -> CliResult<()> {
    let coverage = Coverage::from_selection(
        &prepared.selection,
        &prepared.extraction,
        &config.memory.budget,
    );
    println!("{}", serde_json::to_string_pretty(&coverage)?);
    Ok(())
}

fn run_analyze(
    common: CommonArgs,
    sample: PathBuf,
    sample_id: Option<String>,
    output: Option<PathBuf>,
    workdir: PathBuf,
    dry_run: bool,
    baseline_memory: Option<f64>,
) -> CliResult<()> {
    let start_time = Instant::now();
    let config = load_config(&common)?;
    let profile = load_profile(&common.profile)?;
    let source = catalog_source(&config)?;
    let assistant = assisted_resolver(&config)?;
    let gauge: Box<dyn MemoryGauge> = match baseline_memory {
        Some(gib) => Box::new(FixedGauge(gib)),
        None => Box::new(ProcessMemoryGauge),
    };
    let progress = BarProgress::new();
    let cancel = CancellationToken::new();
    let cache = ResolutionCache::new();
    let collaborators = Collaborators {
        catalog: source.as_ref(),
        gauge: gauge.as_ref(),
        assistant: assistant.as_ref().map(|a| a as &dyn AssistedResolver),
        observer: &progress,
        cancel: &cancel,
    };

    if dry_run {
        let prepared = prepare_selection(&profile, &config, &collaborators, &cache)?;
        return print_selection(&prepared, &config);
    }

    eprintln!("> Loading personal genotypes from {}", sample.display());
    let genotypes = PersonalGenotypes::load(&sample)?;
    eprintln!("> Loaded {} genotype calls", genotypes.len());

    let sample_id = sample_id.unwrap_or_else(|| {
        sample
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.split('.').next().unwrap_or(name).to_string())
            .unwrap_or_else(|| "sample".to_string())
    });
    let engine = ProcessStatisticsEngine::from_settings(&config.stats)?;
    let run = run_analysis(
        &AnalysisRequest {
            sample_id: &sample_id,
            genotypes: &genotypes,
            profile: &profile,
            config: &config,
            workdir: &workdir,
        },
        &collaborators,
        &engine,
        &cache,
    )?;

    let out_path = output.unwrap_or_else(|| PathBuf::from(format!("{sample_id}.proxima.json")));
    run.export.write(&out_path)?;
    for component in &run.export.components {
        eprintln!(
            "> {:<20} {:>6.2}% [{:.2}, {:.2}] {:?} {:?}",
            component.component_name,
            component.point_estimate_pct,
            component.confidence_interval.0,
            component.confidence_interval.1,
            component.significance_label,
            component.corroboration_level
        );
    }
    eprintln!("> Wrote {}", out_path.display());
    eprintln!(
        "\nSuccess! Total execution time: {:.2?}",
        start_time.elapsed()
    );
    Ok(())
}

fn run_resolve(common: CommonArgs, aliases: Vec<String>) -> CliResult<()> {
    let config = load_config(&common)?;
    let profile = load_profile(&common.profile)?;
    let source = catalog_source(&config)?;
    let assistant = assisted_resolver(&config)?;
    let catalog = load_catalog(
        source.as_ref(),
        &profile.geographic_keywords,
        &config.remote.retry_policy(),
    )?;
    let requests: Vec<AliasRequest> = if aliases.is_empty() {
        profile
            .referenced_aliases()
            .iter()
            .map(|alias| AliasRequest::new(alias.as_str()))
            .collect()
    } else {
        aliases.iter().map(|alias| AliasRequest::new(alias.as_str())).collect()
    };
    let cache = ResolutionCache::new();
    let results = resolve_aliases(
        &catalog,
        &profile,
        &config,
        &requests,
        assistant.as_ref().map(|a| a as &dyn AssistedResolver),
        &cache,
    );
    for result in &results {
        println!(
            "{}\t{}\t{:.3}\t{}",
            result.alias, result.resolved_id, result.confidence, result.method
        );
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze {
            common,
            sample,
            sample_id,
            output,
            workdir,
            dry_run,
            baseline_memory,
        } => run_analyze(
            common,
            sample,
            sample_id,
            output,
            workdir,
            dry_run,
            baseline_memory,
        ),
        Commands::Resolve { common, aliases } => run_resolve(common, aliases),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

