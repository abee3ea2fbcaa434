//! Pipeline run state
//!
//! A run moves through FETCH -> LOAD -> INDEX_SETUP -> DONE, or into
//! FAILED from any stage. Stage names are stored as strings so run
//! history survives in logs and status queries across versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fetcher::FetchMetrics;
use crate::loader::LoadMetrics;
use crate::parser::ParseStats;

/// Stage of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStage {
    Fetch,
    Load,
    IndexSetup,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Fetch => "FETCH",
            RunStage::Load => "LOAD",
            RunStage::IndexSetup => "INDEX_SETUP",
            RunStage::Done => "DONE",
            RunStage::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Failed)
    }

    /// Percentage reached on entering the stage. The load stage advances
    /// beyond its entry value window by window.
    fn entry_percent(&self) -> u8 {
        match self {
            RunStage::Fetch => 5,
            RunStage::Load => 30,
            RunStage::IndexSetup => 85,
            RunStage::Done => 100,
            RunStage::Failed => 0,
        }
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RunStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "FETCH" => RunStage::Fetch,
            "LOAD" => RunStage::Load,
            "INDEX_SETUP" => RunStage::IndexSetup,
            "DONE" => RunStage::Done,
            _ => RunStage::Failed,
        }
    }
}

/// What started the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    Manual,
    Scheduled,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Scheduled => "scheduled",
        }
    }
}

/// Metrics accumulated across the stages of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub fetch: FetchMetrics,
    pub parse: ParseStats,
    pub load: LoadMetrics,
}

/// One execution of the ingestion pipeline
///
/// Readable at any time through the task runner's status query; every
/// mutation keeps stage, progress and message consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub trigger: TriggerSource,
    pub stage: RunStage,
    /// 0-100 heuristic: fetch covers up to 30, load up to 80, the rest
    /// is index setup and finalization.
    pub progress_percent: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Attempts consumed so far, including the one in flight
    pub attempts: u32,
    pub metrics: RunMetrics,
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new(trigger: TriggerSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            stage: RunStage::Fetch,
            progress_percent: 0,
            message: "Run created".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            attempts: 0,
            metrics: RunMetrics::default(),
            error: None,
        }
    }

    /// Enter a stage, resetting progress to the stage's entry value.
    pub fn enter_stage(&mut self, stage: RunStage, message: impl Into<String>) {
        self.stage = stage;
        self.message = message.into();
        if stage == RunStage::Failed {
            self.finished_at = Some(Utc::now());
        } else {
            self.progress_percent = stage.entry_percent();
            if stage == RunStage::Done {
                self.finished_at = Some(Utc::now());
            }
        }
    }

    /// Advance progress during the load stage. Progress grows with each
    /// committed window but never leaves the load stage's band.
    pub fn record_window(&mut self, windows_committed: u64, records_written: u64) {
        let advance = windows_committed.min(50) as u8;
        self.progress_percent = (RunStage::Load.entry_percent() + advance).min(80);
        self.message = format!(
            "Loaded {} records across {} windows",
            records_written, windows_committed
        );
    }

    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.error = Some(error.to_string());
        self.enter_stage(RunStage::Failed, "Run failed");
    }

    /// A retry starts the state machine over; committed windows from the
    /// earlier attempt stay in the store and are upserted again harmlessly.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.error = None;
        self.finished_at = None;
        self.enter_stage(
            RunStage::Fetch,
            format!("Starting attempt {}", self.attempts),
        );
    }
}
