//! Job admission and lifecycle.
//!
//! A job moves `Loading → Running → {Completed, Failed}`. Admission happens on
//! the caller; everything after it runs on the job's dedicated worker.

use crate::error::{JobError, JobResult};
use crate::gate::{GateLease, ProcessGate};
use crate::registry::{EngineHandle, ResourceClassRegistry};
use crate::worker::JobWorker;
use chrono::Utc;
use kiln_training::{
    label_set, sha256_file, ConfusionCell, JobStatus, ModelRecord, ModelUploadTarget, ProgressSink, ProgressSnapshot,
    ResourceClass, TrainingEngine, TrainingError, TrainingJob, TrainingJobId, TrainingLayout, TrainingParameters,
    TrainingProgress, TrainingReport, TrainingResult,
};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Final state of a successful job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: TrainingJob,
    pub models: Vec<ModelRecord>,
    pub confusion: Vec<ConfusionCell>,
}

/// A job that passed admission.
pub struct JobHandle {
    job_id: TrainingJobId,
    class: ResourceClass,
    cancel: CancellationToken,
    worker: JobWorker<JobResult<JobOutcome>>,
}

impl JobHandle {
    #[must_use]
    pub fn job_id(&self) -> &TrainingJobId {
        &self.job_id
    }

    #[must_use]
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Requests cancellation. The engine stops at its next checkpoint and the
    /// job ends as failed with [`JobError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub async fn wait(self) -> JobResult<JobOutcome> {
        self.worker.join().await?
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("class", &self.class)
            .field("worker", &self.worker.name())
            .finish_non_exhaustive()
    }
}

pub struct TrainingOrchestrator {
    gate: Arc<dyn ProcessGate>,
    registry: Arc<ResourceClassRegistry>,
    sink: Arc<dyn ProgressSink>,
    uploader: Arc<dyn ModelUploadTarget>,
    layout: TrainingLayout,
    // Serializes gate check-and-set, the registry check and instance creation.
    admission: Mutex<()>,
}

impl TrainingOrchestrator {
    pub fn new(
        gate: Arc<dyn ProcessGate>,
        registry: Arc<ResourceClassRegistry>,
        sink: Arc<dyn ProgressSink>,
        uploader: Arc<dyn ModelUploadTarget>,
        layout: TrainingLayout,
    ) -> Self {
        Self { gate, registry, sink, uploader, layout, admission: Mutex::new(()) }
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<dyn ProcessGate> {
        &self.gate
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ResourceClassRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn layout(&self) -> &TrainingLayout {
        &self.layout
    }

    /// Admits a job and starts it on a dedicated worker.
    ///
    /// Rejected with [`JobError::AlreadyRunning`] while any job holds the
    /// process gate or while the lane's engine still reports training. A
    /// rejection leaves existing job records untouched.
    pub fn start(&self, class: ResourceClass, params: TrainingParameters) -> JobResult<JobHandle> {
        params.validate().map_err(|e| JobError::InvalidParameters(e.to_string()))?;
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(lease) = GateLease::acquire(self.gate.clone())? else {
            info!(class = %class, "Rejected: a training job is already running");
            return Err(JobError::AlreadyRunning { class });
        };

        if self.registry.is_training(class) {
            // Dropping the lease puts the gate back to idle.
            warn!(class = %class, "Rejected: engine for this lane is still training");
            return Err(JobError::AlreadyRunning { class });
        }

        let Some(handle) = self.registry.create_instance(class, &params)? else {
            return Err(JobError::UnknownResourceClass { class });
        };

        let job = TrainingJob::new(class, params);
        let job_id = job.job_id.clone();
        if let Err(e) = self.sink.update_job(&job) {
            self.registry.reset(class);
            return Err(e.into());
        }
        info!(job_id = %job_id, class = %class, engine = handle.engine().id(), handle = handle.id(), "Training job admitted");

        let cancel = CancellationToken::new();
        let mut admitted = job.clone();
        let run = JobRun {
            job,
            handle,
            lease,
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            uploader: self.uploader.clone(),
            layout: self.layout.clone(),
            cancel: cancel.clone(),
            iteration: 0,
            last_report: None,
        };

        match JobWorker::spawn(format!("kiln-job-{class}"), move || run.execute()) {
            Ok(worker) => Ok(JobHandle { job_id, class, cancel, worker }),
            Err(err) => {
                self.registry.reset(class);
                admitted.error = Some(err.to_string());
                admitted.end_time = Some(Utc::now());
                if admitted.transition(JobStatus::Failed).is_ok() {
                    if let Err(e) = self.sink.update_job(&admitted) {
                        warn!(job_id = %job_id, error = %e, "Failed to record worker failure");
                    }
                }
                Err(err)
            }
        }
    }

    /// [`start`](Self::start) followed by waiting for the outcome.
    pub async fn run(&self, class: ResourceClass, params: TrainingParameters) -> JobResult<JobOutcome> {
        self.start(class, params)?.wait().await
    }
}

impl fmt::Debug for TrainingOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingOrchestrator")
            .field("registry", &self.registry)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

struct Artifacts {
    models: Vec<ModelRecord>,
    confusion: Vec<ConfusionCell>,
    report: TrainingReport,
}

/// Everything one job owns while it runs on its worker.
struct JobRun {
    job: TrainingJob,
    handle: EngineHandle,
    lease: GateLease,
    registry: Arc<ResourceClassRegistry>,
    sink: Arc<dyn ProgressSink>,
    uploader: Arc<dyn ModelUploadTarget>,
    layout: TrainingLayout,
    cancel: CancellationToken,
    iteration: u32,
    last_report: Option<TrainingProgress>,
}

impl JobRun {
    /// Runs the job and finalizes it. A panic in any step is reported through
    /// the same failure path as an error.
    async fn execute(mut self) -> JobResult<JobOutcome> {
        let steps = AssertUnwindSafe(self.run_steps()).catch_unwind().await;
        let result = match steps {
            Ok(Ok(artifacts)) => std::panic::catch_unwind(AssertUnwindSafe(|| self.complete(artifacts)))
                .unwrap_or_else(|panic| Err(panicked(&*panic))),
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(panicked(&*panic)),
        };

        match result {
            Ok(outcome) => {
                self.registry.reset(self.job.resource_class);
                self.lease.release();
                info!(
                    job_id = %self.job.job_id,
                    class = %self.job.resource_class,
                    accuracy = self.job.accuracy,
                    best_iteration = self.job.best_iteration,
                    models = outcome.models.len(),
                    "Training job completed"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn run_steps(&mut self) -> JobResult<Artifacts> {
        let engine = self.handle.engine().clone();
        let class = self.job.resource_class;
        let params = self.job.parameters.clone();
        self.layout.ensure_job_dirs(&self.job.job_id)?;

        let images = engine.load_images(&params.process_names).await?;
        if images == 0 {
            return Err(JobError::NoImages { class });
        }
        info!(job_id = %self.job.job_id, class = %class, images, "Training images loaded");

        engine.set_parameters().await.map_err(|e| match e {
            TrainingError::InvalidSpec(msg) => JobError::InvalidParameters(msg),
            other => JobError::Training(other),
        })?;
        if params.use_pretrained {
            engine.load_pretrained_model(class).await.map_err(|e| JobError::PretrainedModel(e.to_string()))?;
        }
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        self.job.transition(JobStatus::Running)?;
        self.job.start_time = Some(Utc::now());
        self.sink.update_job(&self.job)?;
        info!(job_id = %self.job.job_id, class = %class, iterations = params.iterations, "Training started");

        self.train(&engine).await?;

        let models = self.persist_models(&engine, &params).await?;
        let confusion = self.sweep_confusion(&engine, &params).await;
        let report = match engine.training_result().await {
            Ok(report) => report,
            Err(e) => {
                warn!(job_id = %self.job.job_id, error = %e, "Final training result unavailable");
                TrainingReport::default()
            }
        };
        Ok(Artifacts { models, confusion, report })
    }

    async fn train(&mut self, engine: &Arc<dyn TrainingEngine>) -> JobResult<()> {
        let sink = &self.sink;
        let job = &mut self.job;
        let iteration = &mut self.iteration;
        let last_report = &mut self.last_report;

        let mut on_progress = |report: TrainingProgress| -> TrainingResult<()> {
            *iteration += 1;
            job.apply_progress(&report);
            sink.append_snapshot(&ProgressSnapshot::capture(job, *iteration, &report))?;
            sink.update_job(job)?;
            debug!(
                job_id = %job.job_id,
                iteration = *iteration,
                progress = job.progress,
                accuracy = report.current_accuracy,
                best_accuracy = report.best_accuracy,
                "Iteration recorded"
            );
            *last_report = Some(report);
            Ok(())
        };

        engine.train(&mut on_progress, &self.cancel).await.map_err(|e| match e {
            TrainingError::Cancelled => JobError::Cancelled,
            other => JobError::Training(other),
        })
    }

    /// Saves and uploads one model per (device, process) pair. Upload problems
    /// are recorded on the model record; save problems fail the job.
    async fn persist_models(
        &self,
        engine: &Arc<dyn TrainingEngine>,
        params: &TrainingParameters,
    ) -> JobResult<Vec<ModelRecord>> {
        let job_id = &self.job.job_id;
        let mut records = Vec::new();

        for device in &params.devices {
            for process in &params.process_names {
                let destination = self.layout.model_path(job_id, &device.name, process);
                let saved = engine.save_model(&destination).await?;
                let sha256 = match sha256_file(&saved) {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        warn!(job_id = %job_id, file = %saved.display(), error = %e, "Could not hash saved model");
                        None
                    }
                };

                let remote_path = device.model_path(process);
                let (outcome, message) = self.uploader.upload(device, &saved, &remote_path).await;
                let record = ModelRecord {
                    device: device.name.clone(),
                    device_ip: device.ip.clone(),
                    process_name: process.clone(),
                    local_path: saved,
                    remote_path,
                    sha256,
                    outcome,
                    message,
                    recorded_at: Utc::now(),
                };
                self.sink.record_model(job_id, &record)?;
                info!(
                    job_id = %job_id,
                    device = %record.device,
                    process = %record.process_name,
                    outcome = %record.outcome,
                    "Model recorded"
                );
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Records every non-zero cell over the label set. Never fails.
    async fn sweep_confusion(&self, engine: &Arc<dyn TrainingEngine>, params: &TrainingParameters) -> Vec<ConfusionCell> {
        let job_id = &self.job.job_id;
        let labels = label_set(&params.categories);
        let mut cells = Vec::new();

        for true_label in &labels {
            for predicted_label in &labels {
                let count = engine.confusion_safe(true_label, predicted_label).await;
                if count == 0 {
                    continue;
                }
                let cell =
                    ConfusionCell { true_label: true_label.clone(), predicted_label: predicted_label.clone(), count };
                match self.sink.record_confusion_cell(job_id, &cell) {
                    Ok(()) => cells.push(cell),
                    Err(e) => warn!(
                        job_id = %job_id,
                        true_label = %true_label,
                        predicted_label = %predicted_label,
                        error = %e,
                        "Skipping confusion cell"
                    ),
                }
            }
        }
        debug!(job_id = %job_id, cells = cells.len(), "Confusion sweep finished");
        cells
    }

    fn complete(&mut self, artifacts: Artifacts) -> JobResult<JobOutcome> {
        let mut completed = self.job.clone();
        completed.progress = 1.0;
        completed.end_time = Some(Utc::now());
        completed.label_accuracies = artifacts.report.label_accuracies;

        let last = self.last_report.clone().unwrap_or_else(|| TrainingProgress {
            is_training: false,
            progress: 1.0,
            best_iteration: completed.best_iteration,
            current_accuracy: completed.accuracy,
            best_accuracy: completed.accuracy,
            validation_accuracy: completed.accuracy,
            validation_error: 1.0 - completed.accuracy,
            loss: None,
        });
        let final_report = TrainingProgress { is_training: false, progress: 1.0, ..last };
        self.sink.append_snapshot(&ProgressSnapshot::capture(&completed, self.iteration, &final_report))?;

        completed.transition(JobStatus::Completed)?;
        self.sink.update_job(&completed)?;
        self.job = completed;

        Ok(JobOutcome { job: self.job.clone(), models: artifacts.models, confusion: artifacts.confusion })
    }

    async fn fail(&mut self, err: &JobError) {
        let class = self.job.resource_class;
        if let Err(e) = self.handle.engine().stop_training().await {
            warn!(job_id = %self.job.job_id, error = %e, "Engine did not stop cleanly");
        }
        self.registry.reset(class);

        self.job.error = Some(err.to_string());
        self.job.end_time = Some(Utc::now());
        if !self.job.status.is_terminal() {
            if let Err(e) = self.job.transition(JobStatus::Failed) {
                warn!(job_id = %self.job.job_id, error = %e, "Job status not updated");
            }
        }
        if let Err(e) = self.sink.update_job(&self.job) {
            warn!(job_id = %self.job.job_id, error = %e, "Failed to record job failure");
        }

        if matches!(err, JobError::Cancelled) {
            warn!(job_id = %self.job.job_id, class = %class, "Training job cancelled");
        } else {
            error!(job_id = %self.job.job_id, class = %class, error = %err, "Training job failed");
        }
        self.lease.release();
    }
}

fn panicked(payload: &(dyn Any + Send)) -> JobError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    JobError::Worker(format!("job panicked: {message}"))
}
