// ========================================================================================
//
//                               Population Catalog Accessor
//
// ========================================================================================
//
// Lists the population identifiers offered by a reference dataset and fetches the
// per-population allele-frequency tables for a chosen subset. A dataset is laid out
// the same way locally and remotely:
//
//   <root>/populations.txt       one identifier per line, or
//   <root>/<name>.ind            an EIGENSTRAT individual file (population in column 3)
//   <root>/freq/<pop>.tsv[.gz]   `rsid allele frequency` for one population

use crate::profile::KeywordTable;
use crate::shared::retry::{RetryPolicy, with_retries};
use ahash::AHashMap;
use log::{debug, info};
use rayon::prelude::*;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const POPULATION_LISTING: &str = "populations.txt";
const FREQUENCY_DIR: &str = "freq";
const FREQUENCY_EXTENSIONS: [&str; 2] = ["tsv.gz", "tsv"];
const HTTP_USER_AGENT: &str = "proxima-catalog/0.1";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },
    #[error("Catalog at {0} lists no populations.")]
    Empty(String),
    #[error("No frequency table for population '{population}' under {location}.")]
    MissingPopulationData { population: String, location: String },
    #[error("Catalog {location} is unreachable: {message}")]
    Unavailable { location: String, message: String },
}

/// Sample-quality class derived from the identifier's platform suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuffixClass {
    Ancient,
    ModernHighCoverage,
    ModernArray,
    LowCoverage,
    Outlier,
    Unlabelled,
}

impl SuffixClass {
    pub fn classify(id: &str) -> Self {
        let lowered = id.to_lowercase();
        let tokens = tokenize(&lowered);
        let is_outlier = tokens.iter().any(|token| {
            *token == "o"
                || *token == "outlier"
                || (token.len() > 1
                    && token.starts_with('o')
                    && token[1..].chars().all(|c| c.is_ascii_digit()))
        });
        if is_outlier {
            return Self::Outlier;
        }
        if tokens.iter().any(|token| *token == "lc") {
            return Self::LowCoverage;
        }
        if lowered.ends_with(".ag") || lowered.ends_with(".sg") || lowered.ends_with(".wga") {
            Self::Ancient
        } else if lowered.ends_with(".dg") {
            Self::ModernHighCoverage
        } else if lowered.ends_with(".ho") {
            Self::ModernArray
        } else {
            Self::Unlabelled
        }
    }
}

/// Archaeological period inferred from era tokens in the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Paleolithic,
    Mesolithic,
    HunterGatherer,
    Neolithic,
    Chalcolithic,
    BronzeAge,
    IronAge,
    Historical,
    Medieval,
    Modern,
    Unknown,
}

impl Period {
    pub fn classify(id: &str, suffix: SuffixClass) -> Self {
        let upper = id.to_uppercase();
        for token in tokenize(&upper).into_iter().rev() {
            let period = match token {
                "UP" | "PALEO" | "PALEOLITHIC" => Self::Paleolithic,
                "MESO" | "MESOLITHIC" => Self::Mesolithic,
                "HG" | "EHG" | "WHG" | "CHG" | "WSHG" => Self::HunterGatherer,
                "N" | "EN" | "MN" | "LN" | "PPN" | "PPNB" | "NEOLITHIC" => Self::Neolithic,
                "C" | "CA" | "ENEOLITHIC" | "CHALCOLITHIC" => Self::Chalcolithic,
                "BA" | "EBA" | "MBA" | "LBA" | "MLBA" => Self::BronzeAge,
                "IA" | "EIA" | "LIA" => Self::IronAge,
                "HISTORIC" | "ROMAN" | "SASSANID" | "ACHAEMENID" | "HELLENISTIC" | "KUSHAN" => {
                    Self::Historical
                }
                "MEDIEVAL" | "EMEDIEVAL" | "MED" => Self::Medieval,
                _ => continue,
            };
            return period;
        }
        match suffix {
            SuffixClass::ModernHighCoverage | SuffixClass::ModernArray => Self::Modern,
            _ => Self::Unknown,
        }
    }
}

fn tokenize(id: &str) -> Vec<&str> {
    id.split(['_', '.', '-'])
        .filter(|token| !token.is_empty())
        .collect()
}

/// One reference population and the tags derived from its identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub region: Option<String>,
    pub period: Period,
    pub suffix: SuffixClass,
}

impl CatalogEntry {
    pub fn tagged(id: &str, regions: &KeywordTable) -> Self {
        let suffix = SuffixClass::classify(id);
        Self {
            id: id.to_string(),
            region: regions.first_match(id).map(|group| group.group.clone()),
            period: Period::classify(id, suffix),
            suffix,
        }
    }
}

/// The immutable, ordered population listing for one analysis run. Catalog order
/// is the tie-break order everywhere downstream.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    index: AHashMap<String, usize>,
}

impl Catalog {
    /// Builds a catalog from raw identifiers. Blank lines are skipped and repeated
    /// identifiers keep their first position.
    pub fn from_ids<I, S>(ids: I, regions: &KeywordTable) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        let mut index = AHashMap::new();
        for raw in ids {
            let id = raw.as_ref().trim();
            if id.is_empty() || index.contains_key(id) {
                continue;
            }
            index.insert(id.to_string(), entries.len());
            entries.push(CatalogEntry::tagged(id, regions));
        }
        if entries.is_empty() {
            return Err(CatalogError::Empty("the provided identifier list".to_string()));
        }
        Ok(Self { entries, index })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.index_of(id).map(|idx| &self.entries[idx])
    }
}

/// Parses either a plain listing (one identifier per line) or an EIGENSTRAT `.ind`
/// file (identifier in the third column). Order of first appearance is kept.
pub fn parse_population_listing(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let id = if fields.len() >= 3 { fields[2] } else { fields[0] };
        if id.eq_ignore_ascii_case("ignore") {
            continue;
        }
        if seen.insert(id.to_string()) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// A reference dataset that can list its populations and hand over frequency
/// tables for a subset of them.
pub trait CatalogSource: Send + Sync {
    fn location(&self) -> String;

    fn list_populations(&self) -> Result<Vec<String>, CatalogError>;

    /// Makes the frequency tables for `ids` available locally and returns one path
    /// per requested id, in the same order. Files already in `dest` are replaced.
    fn fetch_subset(&self, ids: &[String], dest: &Path) -> Result<Vec<PathBuf>, CatalogError>;
}

/// Lists the catalog with bounded retries and tags every entry. Exhausting the
/// retries is a fatal setup error.
pub fn load_catalog(
    source: &dyn CatalogSource,
    regions: &KeywordTable,
    policy: &RetryPolicy,
) -> Result<Catalog, CatalogError> {
    let location = source.location();
    let ids = with_retries("catalog listing", policy, || source.list_populations()).map_err(
        |err| CatalogError::Unavailable {
            location: location.clone(),
            message: err.to_string(),
        },
    )?;
    if ids.is_empty() {
        return Err(CatalogError::Empty(location));
    }
    let catalog = Catalog::from_ids(&ids, regions)?;
    info!(
        "Catalog {} lists {} populations ({} with a recognised region)",
        location,
        catalog.len(),
        catalog
            .entries()
            .iter()
            .filter(|entry| entry.region.is_some())
            .count()
    );
    Ok(catalog)
}

/// Fetches frequency tables with bounded retries.
pub fn fetch_with_retries(
    source: &dyn CatalogSource,
    ids: &[String],
    dest: &Path,
    policy: &RetryPolicy,
) -> Result<Vec<PathBuf>, CatalogError> {
    fs::create_dir_all(dest)?;
    with_retries("population subset download", policy, || {
        source.fetch_subset(ids, dest)
    })
    .map_err(|err| CatalogError::Unavailable {
        location: source.location(),
        message: err.to_string(),
    })
}

/// True when both paths exist and name the same file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// A dataset on the local filesystem. `root` is either the dataset directory or a
/// direct path to its `.ind`/listing file.
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    root: PathBuf,
}

impl LocalCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dataset_dir(&self) -> &Path {
        if self.root.is_file() {
            self.root.parent().unwrap_or_else(|| Path::new("."))
        } else {
            &self.root
        }
    }

    fn listing_path(&self) -> Result<PathBuf, CatalogError> {
        if self.root.is_file() {
            return Ok(self.root.clone());
        }
        let plain = self.root.join(POPULATION_LISTING);
        if plain.exists() {
            return Ok(plain);
        }
        let mut ind_files: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "ind"))
            .collect();
        ind_files.sort();
        ind_files
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::Empty(self.root.display().to_string()))
    }
}

impl CatalogSource for LocalCatalog {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn list_populations(&self) -> Result<Vec<String>, CatalogError> {
        let path = self.listing_path()?;
        debug!("Reading population listing from {}", path.display());
        Ok(parse_population_listing(&fs::read_to_string(path)?))
    }

    fn fetch_subset(&self, ids: &[String], dest: &Path) -> Result<Vec<PathBuf>, CatalogError> {
        let freq_dir = self.dataset_dir().join(FREQUENCY_DIR);
        ids.iter()
            .map(|id| {
                let found = FREQUENCY_EXTENSIONS
                    .iter()
                    .map(|ext| freq_dir.join(format!("{id}.{ext}")))
                    .find(|candidate| candidate.exists());
                match found {
                    Some(path) => {
                        let target = dest.join(path.file_name().unwrap_or_default());
                        if !same_file(&path, &target) {
                            fs::copy(&path, &target)?;
                        }
                        Ok(target)
                    }
                    None => Err(CatalogError::MissingPopulationData {
                        population: id.clone(),
                        location: freq_dir.display().to_string(),
                    }),
                }
            })
            .collect()
    }
}

/// A dataset served over HTTP(S) with the same layout as `LocalCatalog`.
pub struct HttpCatalog {
    base: Url,
    client: Client,
}

impl HttpCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let normalised = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalised).map_err(|e| CatalogError::Http {
            url: base_url.to_string(),
            message: format!("invalid URL: {e}"),
        })?;
        let client = Client::builder()
            .user_agent(HTTP_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Http {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { base, client })
    }

    fn url_for(&self, relative: &str) -> Result<Url, CatalogError> {
        self.base.join(relative).map_err(|e| CatalogError::Http {
            url: format!("{}{relative}", self.base),
            message: e.to_string(),
        })
    }

    fn get_bytes(&self, url: &Url) -> Result<Option<Vec<u8>>, CatalogError> {
        let http_error = |message: String| CatalogError::Http {
            url: url.to_string(),
            message,
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| http_error(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(http_error(format!("status {}", response.status())));
        }
        let bytes = response.bytes().map_err(|e| http_error(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }
}

impl fmt::Debug for HttpCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCatalog")
            .field("base", &self.base.as_str())
            .finish()
    }
}

impl CatalogSource for HttpCatalog {
    fn location(&self) -> String {
        self.base.to_string()
    }

    fn list_populations(&self) -> Result<Vec<String>, CatalogError> {
        let url = self.url_for(POPULATION_LISTING)?;
        let bytes = self
            .get_bytes(&url)?
            .ok_or_else(|| CatalogError::Empty(url.to_string()))?;
        Ok(parse_population_listing(&String::from_utf8_lossy(&bytes)))
    }

    fn fetch_subset(&self, ids: &[String], dest: &Path) -> Result<Vec<PathBuf>, CatalogError> {
        ids.par_iter()
            .map(|id| -> Result<PathBuf, CatalogError> {
                for ext in FREQUENCY_EXTENSIONS {
                    let file_name = format!("{id}.{ext}");
                    let target = dest.join(&file_name);
                    let url = self.url_for(&format!("{FREQUENCY_DIR}/{file_name}"))?;
                    if let Some(bytes) = self.get_bytes(&url)? {
                        let partial = dest.join(format!("{file_name}.part"));
                        let mut file = fs::File::create(&partial)?;
                        file.write_all(&bytes)?;
                        file.flush()?;
                        fs::rename(&partial, &target)?;
                        return Ok(target);
                    }
                }
                Err(CatalogError::MissingPopulationData {
                    population: id.clone(),
                    location: self.base.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::KeywordGroup;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn regions() -> KeywordTable {
        KeywordTable {
            groups: vec![
                KeywordGroup {
                    group: "Iran".into(),
                    keywords: vec!["iran".into()],
                },
                KeywordGroup {
                    group: "Steppe".into(),
                    keywords: vec!["yamnaya".into()],
                },
            ],
        }
    }

    #[test]
    fn suffix_classes_follow_platform_tokens() {
        assert_eq!(SuffixClass::classify("Iran_GanjDareh_N.AG"), SuffixClass::Ancient);
        assert_eq!(SuffixClass::classify("Mbuti.DG"), SuffixClass::ModernHighCoverage);
        assert_eq!(SuffixClass::classify("Pathan.HO"), SuffixClass::ModernArray);
        assert_eq!(SuffixClass::classify("Turkey_N_lc.SG"), SuffixClass::LowCoverage);
        assert_eq!(SuffixClass::classify("Iran_C_o2.AG"), SuffixClass::Outlier);
        assert_eq!(SuffixClass::classify("Yamnaya_Samara"), SuffixClass::Unlabelled);
    }

    #[test]
    fn periods_come_from_era_tokens() {
        let tag = |id: &str| Period::classify(id, SuffixClass::classify(id));
        assert_eq!(tag("Iran_GanjDareh_N.AG"), Period::Neolithic);
        assert_eq!(tag("Kazakhstan_Central_Steppe_MLBA"), Period::BronzeAge);
        assert_eq!(tag("Pakistan_Swat_IA.AG"), Period::IronAge);
        assert_eq!(tag("Han.DG"), Period::Modern);
        assert_eq!(tag("Yamnaya_Samara"), Period::Unknown);
    }

    #[test]
    fn catalog_deduplicates_and_tags() {
        let catalog = Catalog::from_ids(
            ["Iran_N", "Yamnaya_Samara", "Iran_N", "  ", "Mbuti.DG"],
            &regions(),
        )
        .unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.index_of("Mbuti.DG"), Some(2));
        assert_eq!(catalog.get("Iran_N").unwrap().region.as_deref(), Some("Iran"));
        assert_eq!(catalog.get("Mbuti.DG").unwrap().region, None);
    }

    #[test]
    fn empty_catalog_is_an_error() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            Catalog::from_ids(empty, &regions()),
            Err(CatalogError::Empty(_))
        ));
    }

    #[test]
    fn listing_parser_accepts_plain_and_ind_formats() {
        let plain = "# comment\nIran_N\nOnge.DG\n\nIran_N\n";
        assert_eq!(parse_population_listing(plain), vec!["Iran_N", "Onge.DG"]);

        let ind = "I001 M Iran_N\nI002 F Iran_N\nI003 M Ignore\nI004 U Mbuti.DG\n";
        assert_eq!(parse_population_listing(ind), vec!["Iran_N", "Mbuti.DG"]);
    }

    #[test]
    fn local_catalog_lists_and_fetches() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("populations.txt"), "Iran_N\nMbuti.DG\n").unwrap();
        fs::create_dir(dir.path().join("freq")).unwrap();
        fs::write(dir.path().join("freq/Iran_N.tsv"), "rs1\tA\t0.5\n").unwrap();

        let source = LocalCatalog::new(dir.path());
        let catalog = load_catalog(&source, &regions(), &RetryPolicy::once()).unwrap();
        assert_eq!(catalog.len(), 2);

        let dest = dir.path().join("subset");
        let fetched =
            fetch_with_retries(&source, &["Iran_N".to_string()], &dest, &RetryPolicy::once())
                .unwrap();
        assert_eq!(fetched, vec![dest.join("Iran_N.tsv")]);
        assert!(fetched[0].exists());

        let missing =
            fetch_with_retries(&source, &["Mbuti.DG".to_string()], &dest, &RetryPolicy::once());
        assert!(matches!(missing, Err(CatalogError::Unavailable { .. })));
    }

    #[test]
    fn leftover_tables_in_dest_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("freq")).unwrap();
        fs::write(dir.path().join("freq/Iran_N.tsv"), "rs1\tA\t0.5\nrs2\tG\t0.25\n").unwrap();
        let dest = dir.path().join("subset");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("Iran_N.tsv"), "rs1\tA\t0.9\n").unwrap();

        let source = LocalCatalog::new(dir.path());
        let fetched =
            fetch_with_retries(&source, &["Iran_N".to_string()], &dest, &RetryPolicy::once())
                .unwrap();
        assert_eq!(
            fs::read_to_string(&fetched[0]).unwrap(),
            "rs1\tA\t0.5\nrs2\tG\t0.25\n"
        );

        let in_place = fetch_with_retries(
            &source,
            &["Iran_N".to_string()],
            &dir.path().join("freq"),
            &RetryPolicy::once(),
        )
        .unwrap();
        assert!(fs::read_to_string(&in_place[0]).unwrap().starts_with("rs1\tA\t0.5"));
    }

    struct FlakySource {
        failures_left: AtomicU32,
    }

    impl CatalogSource for FlakySource {
        fn location(&self) -> String {
            "flaky://catalog".into()
        }

        fn list_populations(&self) -> Result<Vec<String>, CatalogError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CatalogError::Http {
                    url: self.location(),
                    message: "connection reset".into(),
                });
            }
            Ok(vec!["Iran_N".into()])
        }

        fn fetch_subset(&self, ids: &[String], dest: &Path) -> Result<Vec<PathBuf>, CatalogError> {
            Ok(ids.iter().map(|id| dest.join(id)).collect())
        }
    }

    #[test]
    fn listing_is_retried_then_surfaced() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let recovering = FlakySource {
            failures_left: AtomicU32::new(2),
        };
        assert_eq!(load_catalog(&recovering, &regions(), &policy).unwrap().len(), 1);

        let dead = FlakySource {
            failures_left: AtomicU32::new(5),
        };
        assert!(matches!(
            load_catalog(&dead, &regions(), &policy),
            Err(CatalogError::Unavailable { .. })
        ));
    }
}
