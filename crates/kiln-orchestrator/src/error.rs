// Error types for job admission and execution

use kiln_training::{ResourceClass, TrainingError};
use thiserror::Error;

/// Result type for orchestrator operations
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Why a job was rejected at admission or failed while running
#[derive(Debug, Error)]
pub enum JobError {
    /// Another job holds the gate, or the lane's engine is still training
    #[error("a training job is already running (requested {class})")]
    AlreadyRunning { class: ResourceClass },

    /// The registry was not configured with this lane
    #[error("resource class {class} is not served by this orchestrator")]
    UnknownResourceClass { class: ResourceClass },

    #[error("invalid training parameters: {0}")]
    InvalidParameters(String),

    /// No image matched the job's categories
    #[error("no training images found for {class}")]
    NoImages { class: ResourceClass },

    #[error("pretrained model could not be loaded: {0}")]
    PretrainedModel(String),

    #[error("training failed: {0}")]
    Training(#[from] TrainingError),

    #[error("training job cancelled")]
    Cancelled,

    /// The dedicated job thread could not be started or exited without a result
    #[error("job worker failed: {0}")]
    Worker(String),
}

impl JobError {
    /// Rejected before any job state was created.
    #[must_use]
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::UnknownResourceClass { .. } | Self::InvalidParameters(_))
    }
}
