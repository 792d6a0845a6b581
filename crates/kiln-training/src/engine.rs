use crate::artifacts::TrainingReport;
use crate::error::TrainingResult;
use crate::job::{ResourceClass, TrainingParameters};
use crate::progress::TrainingProgress;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Invoked synchronously on the training worker once per iteration. An error
/// aborts training.
pub type ProgressCallback<'a> = dyn FnMut(TrainingProgress) -> TrainingResult<()> + Send + 'a;

/// A training backend bound to one resource class for the duration of a job.
///
/// Engines are created with their parameters; `set_parameters` applies them.
#[async_trait]
pub trait TrainingEngine: Send + Sync {
    fn id(&self) -> &'static str;

    /// Load the images for the given processes and return how many were found.
    async fn load_images(&self, process_names: &[String]) -> TrainingResult<usize>;

    async fn set_parameters(&self) -> TrainingResult<()>;

    async fn load_pretrained_model(&self, class: ResourceClass) -> TrainingResult<()>;

    /// Run training to completion, reporting every iteration through `on_progress`.
    /// Returns [`TrainingError::Cancelled`](crate::TrainingError::Cancelled) when
    /// `cancel` ends the run.
    async fn train(&self, on_progress: &mut ProgressCallback<'_>, cancel: &CancellationToken) -> TrainingResult<()>;

    async fn stop_training(&self) -> TrainingResult<()>;

    fn is_training(&self) -> bool;

    async fn training_result(&self) -> TrainingResult<TrainingReport>;

    async fn confusion(&self, true_label: &str, predicted_label: &str) -> TrainingResult<u64>;

    /// Like [`confusion`](Self::confusion) but never fails: errors are logged
    /// and count as zero.
    async fn confusion_safe(&self, true_label: &str, predicted_label: &str) -> u64 {
        match self.confusion(true_label, predicted_label).await {
            Ok(count) => count,
            Err(e) => {
                warn!(engine = self.id(), true_label, predicted_label, error = %e, "Confusion lookup failed");
                0
            }
        }
    }

    /// Save the trained model so it can be uploaded; returns the written file.
    async fn save_model(&self, destination: &Path) -> TrainingResult<PathBuf>;
}

/// Builds a fresh engine for a resource class. Each job gets its own instance.
pub trait EngineFactory: Send + Sync {
    fn create(&self, class: ResourceClass, params: &TrainingParameters) -> TrainingResult<Arc<dyn TrainingEngine>>;
}
