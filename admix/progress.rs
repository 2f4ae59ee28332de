use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Stages reported while an analysis runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Catalog,
    Resolution,
    Curation,
    MemoryScaling,
    Download,
    ProxyIdentification,
    Extraction,
    GlobalScreening,
    FocusedExecution,
    Corroboration,
    Consensus,
}

impl PipelineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Catalog => "catalog listing",
            Self::Resolution => "population name resolution",
            Self::Curation => "tiered curation",
            Self::MemoryScaling => "memory scaling",
            Self::Download => "frequency table download",
            Self::ProxyIdentification => "proxy identification",
            Self::Extraction => "statistics extraction",
            Self::GlobalScreening => "global screening",
            Self::FocusedExecution => "focused models",
            Self::Corroboration => "corroborating tests",
            Self::Consensus => "consensus",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress. Calls may arrive from worker
/// threads during fan-out stages.
pub trait PipelineObserver: Send + Sync {
    fn on_stage_start(&self, stage: PipelineStage, total_steps: usize) {
        let _ = (stage, total_steps);
    }
    fn on_stage_advance(&self, stage: PipelineStage, completed_steps: usize) {
        let _ = (stage, completed_steps);
    }
    fn on_stage_finish(&self, stage: PipelineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl PipelineObserver for NoopProgress {}

/// Counts completions across threads and forwards the running total.
pub(crate) struct StageCounter<'a> {
    observer: &'a dyn PipelineObserver,
    stage: PipelineStage,
    completed: AtomicUsize,
}

impl<'a> StageCounter<'a> {
    pub(crate) fn start(observer: &'a dyn PipelineObserver, stage: PipelineStage, total: usize) -> Self {
        observer.on_stage_start(stage, total);
        Self {
            observer,
            stage,
            completed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn tick(&self) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        self.observer.on_stage_advance(self.stage, done);
    }

    pub(crate) fn finish(self) {
        self.observer.on_stage_finish(self.stage);
    }
}
