//! In-process training engine.
//!
//! The accelerated runtime binds to a native execution context, so every call
//! into it is blocking and must happen on the job's dedicated worker thread.

use crate::artifacts::{LabelAccuracy, TrainingReport};
use crate::engine::{ProgressCallback, TrainingEngine};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{ResourceClass, TrainingParameters};
use crate::plateau::{PlateauDetector, PLATEAU_THRESHOLD};
use crate::progress::TrainingProgress;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Metrics the runtime exposes once an iteration has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: u32,
    pub current_accuracy: f64,
    pub best_accuracy: f64,
    pub best_iteration: u32,
    pub loss: Option<f64>,
}

/// The native accelerated training runtime behind [`LocalEngine`].
pub trait NativeRuntime: Send {
    fn load_images(&mut self, process_names: &[String], params: &TrainingParameters) -> TrainingResult<usize>;

    fn configure(&mut self, params: &TrainingParameters) -> TrainingResult<()>;

    fn load_pretrained(&mut self, class: ResourceClass) -> TrainingResult<()>;

    fn start(&mut self) -> TrainingResult<()>;

    /// Blocks until the next iteration has completed.
    fn wait_for_iteration(&mut self) -> TrainingResult<IterationReport>;

    fn is_training(&self) -> bool;

    /// `force` aborts immediately instead of finishing the current iteration.
    fn stop(&mut self, force: bool);

    fn label_accuracies(&self) -> TrainingResult<Vec<LabelAccuracy>>;

    fn confusion(&self, true_label: &str, predicted_label: &str) -> TrainingResult<u64>;

    fn save_model(&mut self, path: &Path) -> TrainingResult<()>;
}

pub struct LocalEngine<R> {
    runtime: Mutex<R>,
    params: TrainingParameters,
    plateau_threshold: u32,
    training: AtomicBool,
    stop_requested: AtomicBool,
    stagnant: AtomicU32,
}

impl<R: NativeRuntime> LocalEngine<R> {
    #[must_use]
    pub fn new(runtime: R, params: TrainingParameters) -> Self {
        Self {
            runtime: Mutex::new(runtime),
            params,
            plateau_threshold: PLATEAU_THRESHOLD,
            training: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stagnant: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_plateau_threshold(mut self, threshold: u32) -> Self {
        self.plateau_threshold = threshold.max(1);
        self
    }

    /// Length of the identical-accuracy run at the end of the last train loop.
    #[must_use]
    pub fn stagnant_iterations(&self) -> u32 {
        self.stagnant.load(Ordering::SeqCst)
    }

    fn runtime(&self) -> MutexGuard<'_, R> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drive(
        &self,
        runtime: &mut R,
        on_progress: &mut ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> TrainingResult<()> {
        let total = f64::from(self.params.iterations.max(1));
        let mut plateau = PlateauDetector::new(self.plateau_threshold);

        loop {
            let report = runtime.wait_for_iteration()?;
            let still_training = runtime.is_training();

            on_progress(TrainingProgress {
                is_training: still_training,
                progress: f64::from(report.iteration) / total,
                best_iteration: report.best_iteration,
                current_accuracy: report.current_accuracy,
                best_accuracy: report.best_accuracy,
                validation_accuracy: report.best_accuracy,
                validation_error: 1.0 - report.best_accuracy,
                loss: report.loss,
            })?;

            let plateaued = plateau.observe(report.current_accuracy);
            self.stagnant.store(plateau.stagnant_iterations(), Ordering::SeqCst);
            if plateaued {
                info!(
                    iteration = report.iteration,
                    accuracy = report.current_accuracy,
                    run = plateau.stagnant_iterations(),
                    "Accuracy plateau reached, forcing stop"
                );
                runtime.stop(true);
                return Ok(());
            }

            if cancel.is_cancelled() {
                debug!(iteration = report.iteration, "Cancelled, ending train loop");
                runtime.stop(false);
                return Err(TrainingError::Cancelled);
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                debug!(iteration = report.iteration, "Stop requested, ending train loop");
                runtime.stop(false);
                return Ok(());
            }

            if !runtime.is_training() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl<R: NativeRuntime + 'static> TrainingEngine for LocalEngine<R> {
    fn id(&self) -> &'static str {
        "local"
    }

    async fn load_images(&self, process_names: &[String]) -> TrainingResult<usize> {
        let count = self.runtime().load_images(process_names, &self.params)?;
        debug!(count, "Local engine loaded images");
        Ok(count)
    }

    async fn set_parameters(&self) -> TrainingResult<()> {
        self.params.validate()?;
        self.runtime().configure(&self.params)
    }

    async fn load_pretrained_model(&self, class: ResourceClass) -> TrainingResult<()> {
        self.runtime().load_pretrained(class)
    }

    async fn train(&self, on_progress: &mut ProgressCallback<'_>, cancel: &CancellationToken) -> TrainingResult<()> {
        let mut runtime = self.runtime();
        self.stop_requested.store(false, Ordering::SeqCst);
        self.stagnant.store(0, Ordering::SeqCst);
        runtime.start()?;
        self.training.store(true, Ordering::SeqCst);

        let result = self.drive(&mut runtime, on_progress, cancel);
        if result.is_err() && runtime.is_training() {
            runtime.stop(true);
        }
        self.training.store(false, Ordering::SeqCst);
        result
    }

    async fn stop_training(&self) -> TrainingResult<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        // While the loop owns the runtime the flag is picked up after the
        // current iteration.
        let idle = match self.runtime.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut runtime) = idle {
            if runtime.is_training() {
                runtime.stop(false);
            }
            self.training.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    async fn training_result(&self) -> TrainingResult<TrainingReport> {
        let label_accuracies = self.runtime().label_accuracies()?;
        Ok(TrainingReport { label_accuracies, metrics: Default::default() })
    }

    async fn confusion(&self, true_label: &str, predicted_label: &str) -> TrainingResult<u64> {
        self.runtime().confusion(true_label, predicted_label)
    }

    async fn save_model(&self, destination: &Path) -> TrainingResult<PathBuf> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.runtime().save_model(destination)?;
        if !destination.exists() {
            return Err(TrainingError::Artifact(format!(
                "runtime did not write model to {}",
                destination.display()
            )));
        }
        Ok(destination.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        forced_stop: AtomicBool,
        graceful_stop: AtomicBool,
    }

    struct ScriptedRuntime {
        accuracies: Vec<f64>,
        next: usize,
        running: bool,
        calls: Arc<Calls>,
    }

    impl ScriptedRuntime {
        fn new(accuracies: Vec<f64>) -> (Self, Arc<Calls>) {
            let calls = Arc::new(Calls::default());
            (Self { accuracies, next: 0, running: false, calls: calls.clone() }, calls)
        }
    }

    impl NativeRuntime for ScriptedRuntime {
        fn load_images(&mut self, _: &[String], _: &TrainingParameters) -> TrainingResult<usize> {
            Ok(12)
        }

        fn configure(&mut self, _: &TrainingParameters) -> TrainingResult<()> {
            Ok(())
        }

        fn load_pretrained(&mut self, _: ResourceClass) -> TrainingResult<()> {
            Err(TrainingError::Engine("no pretrained model".to_string()))
        }

        fn start(&mut self) -> TrainingResult<()> {
            self.running = true;
            Ok(())
        }

        fn wait_for_iteration(&mut self) -> TrainingResult<IterationReport> {
            let current = *self
                .accuracies
                .get(self.next)
                .ok_or_else(|| TrainingError::Engine("no more iterations".to_string()))?;
            self.next += 1;
            if self.next == self.accuracies.len() {
                self.running = false;
            }
            let best = self.accuracies[..self.next].iter().copied().fold(0.0, f64::max);
            Ok(IterationReport {
                iteration: self.next as u32,
                current_accuracy: current,
                best_accuracy: best,
                best_iteration: self.next as u32,
                loss: None,
            })
        }

        fn is_training(&self) -> bool {
            self.running
        }

        fn stop(&mut self, force: bool) {
            self.running = false;
            if force {
                self.calls.forced_stop.store(true, Ordering::SeqCst);
            } else {
                self.calls.graceful_stop.store(true, Ordering::SeqCst);
            }
        }

        fn label_accuracies(&self) -> TrainingResult<Vec<LabelAccuracy>> {
            Ok(vec![LabelAccuracy { label: "SCRATCH".to_string(), accuracy: 0.7 }])
        }

        fn confusion(&self, _: &str, _: &str) -> TrainingResult<u64> {
            Err(TrainingError::Engine("no confusion data".to_string()))
        }

        fn save_model(&mut self, path: &Path) -> TrainingResult<()> {
            std::fs::write(path, b"model")?;
            Ok(())
        }
    }

    fn params(iterations: u32) -> TrainingParameters {
        TrainingParameters::new(vec!["SCRATCH".to_string()], iterations)
    }

    #[tokio::test]
    async fn test_loop_exits_when_runtime_finishes() {
        let (runtime, calls) = ScriptedRuntime::new(vec![0.5, 0.6, 0.7, 0.7, 0.7]);
        let engine = LocalEngine::new(runtime, params(5));
        let mut seen = Vec::new();
        let mut on_progress = |p: TrainingProgress| -> TrainingResult<()> {
            seen.push(p);
            Ok(())
        };

        engine.train(&mut on_progress, &CancellationToken::new()).await.unwrap();

        assert_eq!(seen.len(), 5);
        assert_eq!(engine.stagnant_iterations(), 3);
        assert!(!calls.forced_stop.load(Ordering::SeqCst));
        assert!(!engine.is_training());
        assert!((seen[4].progress - 1.0).abs() < f64::EPSILON);
        assert!(!seen[4].is_training);
    }

    #[tokio::test]
    async fn test_plateau_forces_stop_by_iteration_eleven() {
        let mut accuracies = vec![0.1];
        accuracies.extend(std::iter::repeat(0.42).take(19));
        let (runtime, calls) = ScriptedRuntime::new(accuracies);
        let engine = LocalEngine::new(runtime, params(20));
        let mut iterations = 0u32;
        let mut on_progress = |_: TrainingProgress| -> TrainingResult<()> {
            iterations += 1;
            Ok(())
        };

        engine.train(&mut on_progress, &CancellationToken::new()).await.unwrap();

        assert_eq!(iterations, 11);
        assert!(calls.forced_stop.load(Ordering::SeqCst));
        assert_eq!(engine.stagnant_iterations(), PLATEAU_THRESHOLD);
    }

    #[tokio::test]
    async fn test_callback_error_aborts_training() {
        let (runtime, calls) = ScriptedRuntime::new(vec![0.1, 0.2, 0.3]);
        let engine = LocalEngine::new(runtime, params(3));
        let mut on_progress =
            |_: TrainingProgress| -> TrainingResult<()> { Err(TrainingError::Sink("store offline".to_string())) };

        let err = engine.train(&mut on_progress, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, TrainingError::Sink(_)));
        assert!(calls.forced_stop.load(Ordering::SeqCst));
        assert!(!engine.is_training());
    }

    #[tokio::test]
    async fn test_cancellation_stops_gracefully() {
        let (runtime, calls) = ScriptedRuntime::new(vec![0.1, 0.2, 0.3, 0.4]);
        let engine = LocalEngine::new(runtime, params(4));
        let cancel = CancellationToken::new();
        let mut iterations = 0;
        let mut on_progress = |_: TrainingProgress| -> TrainingResult<()> {
            iterations += 1;
            cancel.cancel();
            Ok(())
        };

        let err = engine.train(&mut on_progress, &cancel.clone()).await.unwrap_err();

        assert!(matches!(err, TrainingError::Cancelled));
        assert_eq!(iterations, 1);
        assert!(calls.graceful_stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_confusion_safe_swallows_runtime_errors() {
        let (runtime, _) = ScriptedRuntime::new(vec![0.1]);
        let engine = LocalEngine::new(runtime, params(1));
        assert!(engine.confusion("SCRATCH", "OK").await.is_err());
        assert_eq!(engine.confusion_safe("SCRATCH", "OK").await, 0);
    }

    #[tokio::test]
    async fn test_save_model_creates_parent_dirs() {
        let temp = tempfile::TempDir::new().unwrap();
        let (runtime, _) = ScriptedRuntime::new(vec![0.1]);
        let engine = LocalEngine::new(runtime, params(1));
        let dest = temp.path().join("models").join("a.onnl");
        assert_eq!(engine.save_model(&dest).await.unwrap(), dest);
        assert!(dest.exists());
    }
}
