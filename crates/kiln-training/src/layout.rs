use crate::error::TrainingResult;
use crate::job::TrainingJobId;
use std::path::{Path, PathBuf};

/// Filesystem layout for job artifacts.
///
/// Default layout is `<root>/<job_id>/...` with saved models under `models/`.
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    root: PathBuf,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &TrainingJobId) -> PathBuf {
        self.root.join(job_id.0.as_str())
    }

    #[must_use]
    pub fn job_record_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("job.json")
    }

    #[must_use]
    pub fn progress_jsonl_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("progress.jsonl")
    }

    #[must_use]
    pub fn models_jsonl_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("models.jsonl")
    }

    #[must_use]
    pub fn confusion_jsonl_path(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("confusion.jsonl")
    }

    #[must_use]
    pub fn models_dir(&self, job_id: &TrainingJobId) -> PathBuf {
        self.job_dir(job_id).join("models")
    }

    /// Local path a model is saved to before it is uploaded to `device`.
    #[must_use]
    pub fn model_path(&self, job_id: &TrainingJobId, device: &str, process_name: &str) -> PathBuf {
        self.models_dir(job_id).join(format!("{}_{}.onnl", sanitize(device), sanitize(process_name)))
    }

    pub fn ensure_job_dirs(&self, job_id: &TrainingJobId) -> TrainingResult<()> {
        std::fs::create_dir_all(self.job_dir(job_id))?;
        std::fs::create_dir_all(self.models_dir(job_id))?;
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
