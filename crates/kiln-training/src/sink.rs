use crate::artifacts::{ConfusionCell, ModelRecord};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingJob, TrainingJobId};
use crate::layout::TrainingLayout;
use crate::progress::{ProgressSink, ProgressSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Keeps everything in memory. Used by tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryProgressSink {
    jobs: Mutex<HashMap<TrainingJobId, TrainingJob>>,
    snapshots: Mutex<Vec<ProgressSnapshot>>,
    models: Mutex<Vec<(TrainingJobId, ModelRecord)>>,
    confusion: Mutex<Vec<(TrainingJobId, ConfusionCell)>>,
}

impl MemoryProgressSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn job(&self, job_id: &TrainingJobId) -> Option<TrainingJob> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).get(job_id).cloned()
    }

    #[must_use]
    pub fn snapshots(&self, job_id: &TrainingJobId) -> Vec<ProgressSnapshot> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| &s.job_id == job_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn models(&self, job_id: &TrainingJobId) -> Vec<ModelRecord> {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    #[must_use]
    pub fn confusion(&self, job_id: &TrainingJobId) -> Vec<ConfusionCell> {
        self.confusion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

impl ProgressSink for MemoryProgressSink {
    fn update_job(&self, job: &TrainingJob) -> TrainingResult<()> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn append_snapshot(&self, snapshot: &ProgressSnapshot) -> TrainingResult<()> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).push(snapshot.clone());
        Ok(())
    }

    fn record_model(&self, job_id: &TrainingJobId, record: &ModelRecord) -> TrainingResult<()> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner).push((job_id.clone(), record.clone()));
        Ok(())
    }

    fn record_confusion_cell(&self, job_id: &TrainingJobId, cell: &ConfusionCell) -> TrainingResult<()> {
        self.confusion.lock().unwrap_or_else(PoisonError::into_inner).push((job_id.clone(), cell.clone()));
        Ok(())
    }
}

/// Writes job state under a [`TrainingLayout`]: `job.json` is rewritten on
/// every update, the rest are append-only JSONL files.
#[derive(Debug)]
pub struct JsonlProgressSink {
    layout: TrainingLayout,
    // Serializes appends from concurrent jobs sharing one sink.
    write_lock: Mutex<()>,
}

impl JsonlProgressSink {
    #[must_use]
    pub fn new(layout: TrainingLayout) -> Self {
        Self { layout, write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn layout(&self) -> &TrainingLayout {
        &self.layout
    }

    fn append_line<T: Serialize>(&self, job_id: &TrainingJobId, path: &Path, value: &T) -> TrainingResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.layout.ensure_job_dirs(job_id)?;
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TrainingError::Sink(format!("{}: {e}", path.display())))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl ProgressSink for JsonlProgressSink {
    fn update_job(&self, job: &TrainingJob) -> TrainingResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.layout.ensure_job_dirs(&job.job_id)?;
        let path = self.layout.job_record_path(&job.job_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(job)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn append_snapshot(&self, snapshot: &ProgressSnapshot) -> TrainingResult<()> {
        let path = self.layout.progress_jsonl_path(&snapshot.job_id);
        self.append_line(&snapshot.job_id, &path, snapshot)
    }

    fn record_model(&self, job_id: &TrainingJobId, record: &ModelRecord) -> TrainingResult<()> {
        let path = self.layout.models_jsonl_path(job_id);
        self.append_line(job_id, &path, record)
    }

    fn record_confusion_cell(&self, job_id: &TrainingJobId, cell: &ConfusionCell) -> TrainingResult<()> {
        let path = self.layout.confusion_jsonl_path(job_id);
        self.append_line(job_id, &path, cell)
    }
}
