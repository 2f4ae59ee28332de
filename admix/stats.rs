// ========================================================================================
//
//                              Statistics Engine Interface
//
// ========================================================================================
//
// The population-genetics mathematics (pairwise statistic extraction, admixture
// weight fitting, f3 and ratio tests) lives outside this crate. The orchestrator
// talks to it through `StatisticsEngine`; every call is fallible and possibly slow.
//
// `ProcessStatisticsEngine` bridges to an external program: one process per call,
// a JSON request on stdin, a JSON reply `{"result": ...}` or `{"error": "..."}` on
// stdout.

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Failed to start statistics engine '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("I/O error talking to the statistics engine: {0}")]
    Io(#[from] std::io::Error),
    #[error("Statistics engine timed out after {seconds}s during {operation}.")]
    Timeout { operation: String, seconds: u64 },
    #[error("Statistics engine exited with {status} during {operation}: {stderr}")]
    ExitStatus {
        operation: String,
        status: String,
        stderr: String,
    },
    #[error("Unreadable statistics engine reply for {operation}: {message}")]
    Decode { operation: String, message: String },
    #[error("{operation} failed: {message}")]
    Engine { operation: String, message: String },
    #[error("No statistics engine program is configured.")]
    NotConfigured,
}

/// Quality filters applied during extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionThresholds {
    pub max_missingness: f64,
    pub min_allele_frequency: f64,
    /// Jackknife block size in Morgans.
    pub block_size: f64,
}

impl Default for ExtractionThresholds {
    fn default() -> Self {
        Self {
            max_missingness: 0.1,
            min_allele_frequency: 0.01,
            block_size: 0.05,
        }
    }
}

/// Where extracted statistics live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StatsHandle {
    InMemory(String),
    Directory(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmixtureFit {
    pub weights: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub p_value: f64,
}

/// An f3 or ratio statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestStatistic {
    pub estimate: f64,
    pub std_error: f64,
    pub z: f64,
}

pub trait StatisticsEngine: Send + Sync {
    fn extract(
        &self,
        populations: &[String],
        thresholds: &ExtractionThresholds,
    ) -> Result<StatsHandle, StatsError>;

    fn admixture(
        &self,
        handle: &StatsHandle,
        target: &str,
        sources: &[String],
        outgroups: &[String],
    ) -> Result<AdmixtureFit, StatsError>;

    /// f3(target; a, b). Strongly negative Z means the target is admixed between
    /// populations related to `a` and `b`.
    fn f3(&self, handle: &StatsHandle, target: &str, a: &str, b: &str) -> Result<TestStatistic, StatsError>;

    /// Estimates the share of `source` ancestry in `target` relative to `reference`,
    /// anchored by two outgroups.
    fn ratio(
        &self,
        handle: &StatsHandle,
        target: &str,
        source: &str,
        reference: &str,
        outgroup_a: &str,
        outgroup_b: &str,
    ) -> Result<TestStatistic, StatsError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// The engine executable. Without it only dry runs are possible.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub thresholds: ExtractionThresholds,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            timeout_secs: 3600,
            thresholds: ExtractionThresholds::default(),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum EngineRequest<'a> {
    Extract {
        populations: &'a [String],
        thresholds: &'a ExtractionThresholds,
    },
    Admixture {
        handle: &'a StatsHandle,
        target: &'a str,
        sources: &'a [String],
        outgroups: &'a [String],
    },
    F3 {
        handle: &'a StatsHandle,
        target: &'a str,
        a: &'a str,
        b: &'a str,
    },
    Ratio {
        handle: &'a StatsHandle,
        target: &'a str,
        source: &'a str,
        reference: &'a str,
        outgroup_a: &'a str,
        outgroup_b: &'a str,
    },
}

impl EngineRequest<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Extract { .. } => "extract",
            Self::Admixture { .. } => "admixture",
            Self::F3 { .. } => "f3",
            Self::Ratio { .. } => "ratio",
        }
    }
}

#[derive(Deserialize)]
struct EngineReply<T> {
    result: Option<T>,
    error: Option<String>,
}

/// Runs the configured program once per call.
#[derive(Debug, Clone)]
pub struct ProcessStatisticsEngine {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessStatisticsEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_settings(settings: &StatsSettings) -> Result<Self, StatsError> {
        let program = settings.program.clone().ok_or(StatsError::NotConfigured)?;
        Ok(Self::new(
            program,
            settings.args.clone(),
            Duration::from_secs(settings.timeout_secs),
        ))
    }

    fn call<T: DeserializeOwned>(&self, request: &EngineRequest<'_>) -> Result<T, StatsError> {
        let operation = request.name();
        let payload = serde_json::to_vec(request).map_err(|e| StatsError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;
        debug!("Statistics engine call: {operation}");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| StatsError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload)?;
        }
        let stdout_reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buffer = String::new();
                stdout.read_to_string(&mut buffer).map(|_| buffer)
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                stderr.read_to_string(&mut buffer).ok();
                buffer
            })
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                child.kill()?;
                child.wait()?;
                return Err(StatsError::Timeout {
                    operation: operation.to_string(),
                    seconds: self.timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = match stdout_reader {
            Some(handle) => handle
                .join()
                .map_err(|_| StatsError::Decode {
                    operation: operation.to_string(),
                    message: "stdout reader panicked".to_string(),
                })??,
            None => String::new(),
        };
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(StatsError::ExitStatus {
                operation: operation.to_string(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        decode_reply(operation, &stdout)
    }
}

fn decode_reply<T: DeserializeOwned>(operation: &str, stdout: &str) -> Result<T, StatsError> {
    let reply: EngineReply<T> = serde_json::from_str(stdout.trim()).map_err(|e| StatsError::Decode {
        operation: operation.to_string(),
        message: e.to_string(),
    })?;
    match (reply.result, reply.error) {
        (_, Some(message)) => Err(StatsError::Engine {
            operation: operation.to_string(),
            message,
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Err(StatsError::Decode {
            operation: operation.to_string(),
            message: "reply has neither a result nor an error".to_string(),
        }),
    }
}

impl StatisticsEngine for ProcessStatisticsEngine {
    fn extract(
        &self,
        populations: &[String],
        thresholds: &ExtractionThresholds,
    ) -> Result<StatsHandle, StatsError> {
        self.call(&EngineRequest::Extract {
            populations,
            thresholds,
        })
    }

    fn admixture(
        &self,
        handle: &StatsHandle,
        target: &str,
        sources: &[String],
        outgroups: &[String],
    ) -> Result<AdmixtureFit, StatsError> {
        self.call(&EngineRequest::Admixture {
            handle,
            target,
            sources,
            outgroups,
        })
    }

    fn f3(&self, handle: &StatsHandle, target: &str, a: &str, b: &str) -> Result<TestStatistic, StatsError> {
        self.call(&EngineRequest::F3 { handle, target, a, b })
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
        self.call(&EngineRequest::Ratio {
            handle,
            target,
            source,
            reference,
            outgroup_a,
            outgroup_b,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_operation() {
        let handle = StatsHandle::Directory(PathBuf::from("/tmp/f2"));
        let sources = vec!["Iran_N".to_string(), "Onge.DG".to_string()];
        let outgroups = vec!["Mbuti.DG".to_string()];
        let request = EngineRequest::Admixture {
            handle: &handle,
            target: "Pathan.HO",
            sources: &sources,
            outgroups: &outgroups,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["operation"], "admixture");
        assert_eq!(json["handle"]["kind"], "directory");
        assert_eq!(json["sources"][1], "Onge.DG");
    }

    #[test]
    fn replies_decode_results_and_errors() {
        let fit: AdmixtureFit = decode_reply(
            "admixture",
            r#"{"result":{"weights":[0.6,0.4],"std_errors":[0.02,0.03],"p_value":0.12}}"#,
        )
        .unwrap();
        assert_eq!(fit.weights, vec![0.6, 0.4]);

        let failed: Result<AdmixtureFit, _> =
            decode_reply("admixture", r#"{"error":"singular matrix"}"#);
        assert!(matches!(failed, Err(StatsError::Engine { .. })));

        let empty: Result<AdmixtureFit, _> = decode_reply("admixture", "{}");
        assert!(matches!(empty, Err(StatsError::Decode { .. })));
    }

    #[test]
    fn missing_program_is_not_configured() {
        assert!(matches!(
            ProcessStatisticsEngine::from_settings(&StatsSettings::default()),
            Err(StatsError::NotConfigured)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_round_trips_through_a_child() {
        let engine = ProcessStatisticsEngine::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"result":{"estimate":-0.01,"std_error":0.002,"z":-5.0}}'"#.into(),
            ],
            Duration::from_secs(10),
        );
        let handle = StatsHandle::InMemory("f2".into());
        let stat = engine.f3(&handle, "Target", "A", "B").unwrap();
        assert_eq!(stat.z, -5.0);
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_surfaces_failures() {
        let engine = ProcessStatisticsEngine::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; echo boom >&2; exit 3".into()],
            Duration::from_secs(10),
        );
        let handle = StatsHandle::InMemory("f2".into());
        let result = engine.f3(&handle, "Target", "A", "B");
        assert!(matches!(result, Err(StatsError::ExitStatus { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_times_out() {
        let engine = ProcessStatisticsEngine::new(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        );
        let handle = StatsHandle::InMemory("f2".into());
        let result = engine.f3(&handle, "Target", "A", "B");
        assert!(matches!(result, Err(StatsError::Timeout { .. })));
    }
}
