use crate::artifacts::{ConfusionCell, ModelRecord};
use crate::error::TrainingResult;
use crate::job::{TrainingJob, TrainingJobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an engine reports after each completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub is_training: bool,
    pub progress: f64,
    pub best_iteration: u32,
    pub current_accuracy: f64,
    pub best_accuracy: f64,
    pub validation_accuracy: f64,
    pub validation_error: f64,
    #[serde(default)]
    pub loss: Option<f64>,
}

/// Immutable per-iteration record. Append-only per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: TrainingJobId,
    pub iteration_index: u32,
    pub is_training: bool,
    pub progress: f64,
    pub best_iteration: u32,
    pub current_accuracy: f64,
    pub best_accuracy: f64,
    pub validation_accuracy: f64,
    pub validation_error: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

impl ProgressSnapshot {
    /// Captures the job's live fields alongside the engine report that produced them.
    #[must_use]
    pub fn capture(job: &TrainingJob, iteration_index: u32, report: &TrainingProgress) -> Self {
        Self {
            job_id: job.job_id.clone(),
            iteration_index,
            is_training: report.is_training,
            progress: job.progress,
            best_iteration: job.best_iteration,
            current_accuracy: report.current_accuracy,
            best_accuracy: report.best_accuracy,
            validation_accuracy: report.validation_accuracy,
            validation_error: report.validation_error,
            start_time: job.start_time.unwrap_or(job.created_at),
            end_time: job.end_time,
            duration_secs: job.duration_secs(),
        }
    }
}

/// External store for job state. Calls are blocking and happen on the
/// training worker, so store latency paces the training loop.
pub trait ProgressSink: Send + Sync {
    fn update_job(&self, job: &TrainingJob) -> TrainingResult<()>;

    fn append_snapshot(&self, snapshot: &ProgressSnapshot) -> TrainingResult<()>;

    fn record_model(&self, job_id: &TrainingJobId, record: &ModelRecord) -> TrainingResult<()>;

    fn record_confusion_cell(&self, job_id: &TrainingJobId, cell: &ConfusionCell) -> TrainingResult<()>;
}
