// ========================================================================================
//
//                                 Analysis Configuration
//
// ========================================================================================
//
// One TOML document with a section per component. Every section, and every field
// inside the component sections, has a default, so an empty file is a valid
// configuration.

use crate::consensus::ConsensusSettings;
use crate::curate::{CurateError, TierSettings};
use crate::memory::{ScalingError, ScalingSettings};
use crate::orchestrate::OrchestratorSettings;
use crate::proxy::{ProxyError, ProxySettings};
use crate::resolve::ResolverSettings;
use crate::shared::retry::RetryPolicy;
use crate::stats::StatsSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid memory settings: {0}")]
    Memory(#[from] ScalingError),
    #[error("Invalid tier settings: {0}")]
    Tiers(#[from] CurateError),
    #[error("Invalid proxy settings: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Where the catalog lives and how remote calls behave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// A local directory or an `http(s)://` base URL.
    pub catalog: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            catalog: None,
            timeout_secs: 30,
            max_attempts: 3,
            initial_backoff_ms: 250,
        }
    }
}

impl RemoteSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.initial_backoff_ms))
    }
}

/// The optional AI-assisted resolver. Without an endpoint only the rule tiers run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistSettings {
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer key.
    pub api_key_env: String,
    pub model: Option<String>,
}

impl Default for AssistSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "PROXIMA_ASSIST_KEY".to_string(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub memory: ScalingSettings,
    pub tiers: TierSettings,
    pub resolver: ResolverSettings,
    pub proxy: ProxySettings,
    pub orchestrator: OrchestratorSettings,
    pub consensus: ConsensusSettings,
    pub remote: RemoteSettings,
    pub stats: StatsSettings,
    pub assist: AssistSettings,
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value} is not within [0, 1]"),
        })
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.memory.validate()?;
        self.tiers.validate()?;
        self.proxy.validate()?;
        unit_interval("resolver.accept_threshold", self.resolver.accept_threshold)?;
        unit_interval("resolver.suffix_confidence", self.resolver.suffix_confidence)?;
        unit_interval("resolver.geographic_threshold", self.resolver.geographic_threshold)?;
        unit_interval("resolver.cultural_threshold", self.resolver.cultural_threshold)?;
        unit_interval(
            "orchestrator.unexpected_threshold",
            self.orchestrator.unexpected_threshold,
        )?;
        if self.resolver.assist_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "resolver.assist_batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.consensus.ratio_agreement_tolerance > self.consensus.ratio_conflict_tolerance {
            return Err(ConfigError::Invalid {
                field: "consensus.ratio_agreement_tolerance",
                reason: format!(
                    "{} exceeds the conflict tolerance {}",
                    self.consensus.ratio_agreement_tolerance, self.consensus.ratio_conflict_tolerance
                ),
            });
        }
        if self.remote.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "remote.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_the_default() {
        let config = AnalysisConfig::from_toml_str("").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert_eq!(config.tiers.global_cap, 400);
        assert_eq!(config.memory.batch_size, 50);
        assert_eq!(config.remote.retry_policy().max_attempts, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = AnalysisConfig::from_toml_str(
            "[tiers]\nglobal_cap = 200\n\n[orchestrator]\nunexpected_threshold = 0.1\n",
        )
        .unwrap();
        assert_eq!(config.tiers.global_cap, 200);
        assert_eq!(config.tiers.fractions, [0.7, 0.2, 0.1]);
        assert_eq!(config.orchestrator.unexpected_threshold, 0.1);
        assert!(config.orchestrator.run_corroboration);
    }

    #[test]
    fn invalid_sections_are_rejected() {
        assert!(matches!(
            AnalysisConfig::from_toml_str("[tiers]\nfractions = [0.5, 0.5, 0.5]\n"),
            Err(ConfigError::Tiers(_))
        ));
        assert!(matches!(
            AnalysisConfig::from_toml_str(
                "[memory.budget]\nconservative_limit = 20.0\nsafe_limit = 18.0\nhard_limit = 22.0\n"
            ),
            Err(ConfigError::Memory(_))
        ));
        assert!(matches!(
            AnalysisConfig::from_toml_str("[resolver]\naccept_threshold = 1.5\n"),
            Err(ConfigError::Invalid { field: "resolver.accept_threshold", .. })
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxima.toml");
        let mut config = AnalysisConfig::default();
        config.remote.catalog = Some("https://example.org/catalog".into());
        config.assist.endpoint = Some("https://example.org/assist".into());
        config.save(&path).unwrap();
        assert_eq!(AnalysisConfig::load(&path).unwrap(), config);
    }
}
