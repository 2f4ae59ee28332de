// ========================================================================================
//
//                            Personal Genotypes and Reference Frequencies
//
// ========================================================================================
//
// Two inputs feed proxy identification: the individual's direct-to-consumer genotype
// export (23andMe or AncestryDNA style text, optionally gzip'd) and one allele
// frequency table per reference population. Both are keyed by rsid.

use ahash::AHashMap;
use csv::{ReaderBuilder, StringRecord, Trim};
use flate2::read::MultiGzDecoder;
use log::debug;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenotypeError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed delimited input in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("{path}, record {record}: frequency '{value}' is not a number in [0, 1].")]
    InvalidFrequency {
        path: PathBuf,
        record: u64,
        value: String,
    },
    #[error("{0} contains no usable genotype calls.")]
    Empty(PathBuf),
}

/// Opens a text file, transparently decompressing `.gz`.
fn open_text(path: &Path) -> Result<Box<dyn Read + Send>, GenotypeError> {
    let file = File::open(path).map_err(|source| GenotypeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

fn read_all(path: &Path) -> Result<String, GenotypeError> {
    let mut text = String::new();
    open_text(path)?
        .read_to_string(&mut text)
        .map_err(|source| GenotypeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(text)
}

/// Tab unless the first data line only contains commas.
fn sniff_delimiter(text: &str) -> u8 {
    let first = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or("");
    if !first.contains('\t') && first.contains(',') {
        b','
    } else {
        b'\t'
    }
}

fn is_header(record: &StringRecord) -> bool {
    record
        .get(0)
        .is_some_and(|field| field.trim().eq_ignore_ascii_case("rsid"))
}

fn delimited_records<'a>(
    path: &Path,
    text: &'a str,
) -> impl Iterator<Item = Result<StringRecord, GenotypeError>> + 'a {
    let owned = path.to_path_buf();
    ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes())
        .into_records()
        .map(move |record| {
            record.map_err(|source| GenotypeError::Csv {
                path: owned.clone(),
                source,
            })
        })
}

fn normalise_allele(allele: &str) -> Option<u8> {
    match allele.trim().to_ascii_uppercase().as_str() {
        "A" => Some(b'A'),
        "C" => Some(b'C'),
        "G" => Some(b'G'),
        "T" => Some(b'T'),
        _ => None,
    }
}

/// The individual's diploid calls. No-calls, indels and non-ACGT calls are dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersonalGenotypes {
    calls: AHashMap<String, [u8; 2]>,
}

impl PersonalGenotypes {
    pub fn from_calls<I, S>(calls: I) -> Self
    where
        I: IntoIterator<Item = (S, [u8; 2])>,
        S: Into<String>,
    {
        Self {
            calls: calls
                .into_iter()
                .map(|(rsid, call)| (rsid.into(), call.map(|a| a.to_ascii_uppercase())))
                .collect(),
        }
    }

    /// Parses `rsid chromosome position genotype` (23andMe) or
    /// `rsid chromosome position allele1 allele2` (AncestryDNA).
    pub fn load(path: &Path) -> Result<Self, GenotypeError> {
        let text = read_all(path)?;
        let mut calls = AHashMap::new();
        let mut skipped = 0usize;
        for record in delimited_records(path, &text) {
            let record = record?;
            if is_header(&record) || record.len() < 4 {
                continue;
            }
            let alleles = if record.len() >= 5 {
                (record.get(3).and_then(normalise_allele), record.get(4).and_then(normalise_allele))
            } else {
                let genotype = record.get(3).unwrap_or("");
                let mut chars = genotype.chars().map(|c| normalise_allele(&c.to_string()));
                (chars.next().flatten(), chars.next().flatten())
            };
            match (record.get(0), alleles) {
                (Some(rsid), (Some(first), Some(second))) if !rsid.is_empty() => {
                    calls.insert(rsid.to_string(), [first, second]);
                }
                _ => skipped += 1,
            }
        }
        if calls.is_empty() {
            return Err(GenotypeError::Empty(path.to_path_buf()));
        }
        debug!(
            "Loaded {} genotype calls from {} ({} skipped)",
            calls.len(),
            path.display(),
            skipped
        );
        Ok(Self { calls })
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Copies of `allele` at `rsid` divided by two, or `None` when uncalled.
    pub fn dosage(&self, rsid: &str, allele: u8) -> Option<f64> {
        let call = self.calls.get(rsid)?;
        let allele = allele.to_ascii_uppercase();
        Some(call.iter().filter(|a| **a == allele).count() as f64 / 2.0)
    }
}

/// Allele frequencies of one reference population.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationFrequencies {
    pub population_id: String,
    sites: AHashMap<String, (u8, f64)>,
}

impl PopulationFrequencies {
    pub fn from_sites<I, S>(population_id: &str, sites: I) -> Self
    where
        I: IntoIterator<Item = (S, u8, f64)>,
        S: Into<String>,
    {
        Self {
            population_id: population_id.to_string(),
            sites: sites
                .into_iter()
                .map(|(rsid, allele, freq)| (rsid.into(), (allele.to_ascii_uppercase(), freq)))
                .collect(),
        }
    }

    /// Parses `rsid allele frequency`, tab- or comma-separated.
    pub fn load(population_id: &str, path: &Path) -> Result<Self, GenotypeError> {
        let text = read_all(path)?;
        let mut sites = AHashMap::new();
        for record in delimited_records(path, &text) {
            let record = record?;
            if is_header(&record) || record.len() < 3 {
                continue;
            }
            let (Some(rsid), Some(allele), Some(raw)) = (record.get(0), record.get(1), record.get(2))
            else {
                continue;
            };
            let Some(allele) = normalise_allele(allele) else {
                continue;
            };
            let frequency = raw
                .parse::<f64>()
                .ok()
                .filter(|f| (0.0..=1.0).contains(f))
                .ok_or_else(|| GenotypeError::InvalidFrequency {
                    path: path.to_path_buf(),
                    record: record.position().map_or(0, |p| p.record() + 1),
                    value: raw.to_string(),
                })?;
            sites.insert(rsid.to_string(), (allele, frequency));
        }
        Ok(Self {
            population_id: population_id.to_string(),
            sites,
        })
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn sites(&self) -> impl Iterator<Item = (&str, u8, f64)> {
        self.sites
            .iter()
            .map(|(rsid, (allele, freq))| (rsid.as_str(), *allele, *freq))
    }
}

/// Loads one frequency table per `(population_id, path)` pair, in parallel. The
/// result keeps the input order.
pub fn load_frequency_tables(
    tables: &[(String, PathBuf)],
) -> Result<Vec<PopulationFrequencies>, GenotypeError> {
    tables
        .par_iter()
        .map(|(id, path)| PopulationFrequencies::load(id, path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::io::Write;

    #[test]
    fn parses_23andme_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genome.txt");
        fs::write(
            &path,
            "# rsid\tchromosome\tposition\tgenotype\nrs1\t1\t100\tAG\nrs2\t1\t200\t--\nrs3\t2\t300\tCC\ni400\tMT\t5\tDI\n",
        )
        .unwrap();
        let genotypes = PersonalGenotypes::load(&path).unwrap();
        assert_eq!(genotypes.len(), 2);
        assert_eq!(genotypes.dosage("rs1", b'A'), Some(0.5));
        assert_eq!(genotypes.dosage("rs3", b'C'), Some(1.0));
        assert_eq!(genotypes.dosage("rs3", b'T'), Some(0.0));
        assert_eq!(genotypes.dosage("rs2", b'A'), None);
    }

    #[test]
    fn parses_gzipped_ancestry_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ancestry.txt.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"#AncestryDNA raw data\nrsid\tchromosome\tposition\tallele1\tallele2\nrs1\t1\t100\tT\tT\nrs2\t1\t200\t0\t0\n")
            .unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();
        let genotypes = PersonalGenotypes::load(&path).unwrap();
        assert_eq!(genotypes.len(), 1);
        assert_eq!(genotypes.dosage("rs1", b't'), Some(1.0));
    }

    #[test]
    fn empty_exports_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        fs::write(&path, "# nothing here\n").unwrap();
        assert!(matches!(
            PersonalGenotypes::load(&path),
            Err(GenotypeError::Empty(_))
        ));
    }

    #[test]
    fn frequency_tables_accept_headers_and_commas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Iran_N.tsv");
        fs::write(&path, "rsid,allele,frequency\nrs1,A,0.25\nrs2,g,1\n").unwrap();
        let table = PopulationFrequencies::load("Iran_N", &path).unwrap();
        assert_eq!(table.len(), 2);
        let mut sites: Vec<_> = table.sites().collect();
        sites.sort_by(|a, b| a.0.cmp(b.0));
        assert_eq!(sites[1], ("rs2", b'G', 1.0));
    }

    #[test]
    fn out_of_range_frequencies_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tsv");
        fs::write(&path, "rs1\tA\t1.5\n").unwrap();
        assert!(matches!(
            PopulationFrequencies::load("Bad", &path),
            Err(GenotypeError::InvalidFrequency { .. })
        ));
    }

    #[test]
    fn tables_load_in_parallel_and_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut tables = Vec::new();
        for id in ["A", "B", "C"] {
            let path = dir.path().join(format!("{id}.tsv"));
            fs::write(&path, "rs1\tA\t0.5\n").unwrap();
            tables.push((id.to_string(), path));
        }
        let loaded = load_frequency_tables(&tables).unwrap();
        let ids: Vec<&str> = loaded.iter().map(|t| t.population_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }
}
