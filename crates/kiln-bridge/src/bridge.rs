//! [`TrainingEngine`] backed by the remote training service.
//!
//! A run moves through `Idle → Started → Polling → {Stopped, Finished}`:
//! the start request is posted, status is polled on a fixed interval until the
//! service reports it is no longer running or the caller cancels, and the
//! status is fetched once more so the best checkpoint path has settled before
//! the model is exported.

use crate::client::TrainingServiceClient;
use crate::request::{build_request, prepare_data, BridgeConfig, PreparedData};
use crate::wire::{non_empty, BridgeRequest, BridgeStatus, ConfusionResponse, ExportRequest};
use async_trait::async_trait;
use kiln_training::{
    LabelAccuracy, ProgressCallback, ResourceClass, TrainingEngine, TrainingError, TrainingParameters,
    TrainingProgress, TrainingReport, TrainingResult,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Started,
    Polling,
    Stopped,
    Finished,
}

#[derive(Debug)]
struct BridgeRun {
    state: BridgeState,
    data: Option<PreparedData>,
    request: Option<BridgeRequest>,
    pretrained: Option<PathBuf>,
    last_status: Option<BridgeStatus>,
    stopped_best_model: Option<String>,
    best_iteration: u32,
    stop_issued: bool,
    confusion: Option<ConfusionResponse>,
}

impl BridgeRun {
    fn new() -> Self {
        Self {
            state: BridgeState::Idle,
            data: None,
            request: None,
            pretrained: None,
            last_status: None,
            stopped_best_model: None,
            best_iteration: 0,
            stop_issued: false,
            confusion: None,
        }
    }
}

pub struct HttpTrainingBridge {
    client: TrainingServiceClient,
    config: BridgeConfig,
    class: ResourceClass,
    params: TrainingParameters,
    // Never held across an await.
    run: Mutex<BridgeRun>,
    running: AtomicBool,
}

impl HttpTrainingBridge {
    pub fn new(config: BridgeConfig, class: ResourceClass, params: TrainingParameters) -> TrainingResult<Self> {
        let client = TrainingServiceClient::new(&config.base_url, config.request_timeout)?;
        Ok(Self { client, config, class, params, run: Mutex::new(BridgeRun::new()), running: AtomicBool::new(false) })
    }

    #[must_use]
    pub fn client(&self) -> &TrainingServiceClient {
        &self.client
    }

    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.with_run(|run| run.state)
    }

    #[must_use]
    pub fn best_iteration(&self) -> u32 {
        self.with_run(|run| run.best_iteration)
    }

    #[must_use]
    pub fn last_status(&self) -> Option<BridgeStatus> {
        self.with_run(|run| run.last_status.clone())
    }

    #[must_use]
    pub fn request(&self) -> Option<BridgeRequest> {
        self.with_run(|run| run.request.clone())
    }

    fn with_run<T>(&self, f: impl FnOnce(&mut BridgeRun) -> T) -> T {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut run)
    }

    async fn poll(&self, on_progress: &mut ProgressCallback<'_>, cancel: &CancellationToken) -> TrainingResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.client.status().await {
                Ok(status) => {
                    let running = status.running;
                    let best_iteration = self.with_run(|run| {
                        run.state = BridgeState::Polling;
                        if status.current_epoch > 0 && status.current_accuracy >= status.best_accuracy {
                            run.best_iteration = status.current_epoch;
                        }
                        run.last_status = Some(status.clone());
                        run.best_iteration
                    });

                    on_progress(TrainingProgress {
                        is_training: running,
                        progress: status.progress_fraction(),
                        best_iteration,
                        current_accuracy: status.current_accuracy,
                        best_accuracy: status.best_accuracy,
                        validation_accuracy: status.best_accuracy,
                        validation_error: 1.0 - status.best_accuracy,
                        loss: status.val_loss.or(status.train_loss),
                    })?;

                    if !running {
                        return Ok(());
                    }
                }
                Err(e) => warn!(class = %self.class, error = %e, "Status poll failed, retrying"),
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Sends the stop request at most once per run. Failures are logged only.
    async fn issue_stop(&self) {
        if self.with_run(|run| std::mem::replace(&mut run.stop_issued, true)) {
            debug!(class = %self.class, "Stop already sent for this run");
            return;
        }

        match self.client.stop().await {
            Ok(resp) => {
                info!(
                    class = %self.class,
                    result = ?resp.result,
                    out_dir = ?resp.out_dir,
                    "Remote training stopped"
                );
                self.with_run(|run| run.stopped_best_model = resp.best_model.filter(|p| !p.trim().is_empty()));
            }
            Err(e) => warn!(class = %self.class, error = %e, "Stop request failed"),
        }
        self.with_run(|run| run.state = BridgeState::Stopped);
    }

    async fn refresh_status(&self) -> Option<BridgeStatus> {
        match self.client.status().await {
            Ok(status) => {
                self.with_run(|run| run.last_status = Some(status.clone()));
                Some(status)
            }
            Err(e) => {
                warn!(class = %self.class, error = %e, "Status re-fetch failed");
                None
            }
        }
    }

    /// Best checkpoint on the service side, tried in order: the configured
    /// path, the last polled status (or stop response), the result endpoint,
    /// then a fresh status fetch.
    pub async fn resolve_best_model_path(&self) -> Option<String> {
        if let Some(path) = non_empty(self.config.best_model_path.as_deref()) {
            return Some(path.to_string());
        }

        let polled = self.with_run(|run| {
            run.last_status
                .as_ref()
                .and_then(BridgeStatus::best_model_path)
                .map(str::to_string)
                .or_else(|| run.stopped_best_model.clone())
        });
        if polled.is_some() {
            return polled;
        }

        match self.client.result().await {
            Ok(metrics) => {
                if let Some(path) = metrics.get("best_model").and_then(serde_json::Value::as_str) {
                    if let Some(path) = non_empty(Some(path)) {
                        return Some(path.to_string());
                    }
                }
            }
            Err(e) => warn!(class = %self.class, error = %e, "Result lookup for best model failed"),
        }

        if let Some(status) = self.refresh_status().await {
            if let Some(path) = status.best_model_path() {
                return Some(path.to_string());
            }
        }

        warn!(class = %self.class, "No best model path available from the training service");
        None
    }

    async fn confusion_matrix(&self) -> TrainingResult<ConfusionResponse> {
        if let Some(cached) = self.with_run(|run| run.confusion.clone()) {
            return Ok(cached);
        }
        let matrix = self.client.confusion().await?;
        self.with_run(|run| run.confusion = Some(matrix.clone()));
        Ok(matrix)
    }
}

fn label_accuracies(metrics: &std::collections::BTreeMap<String, serde_json::Value>) -> Vec<LabelAccuracy> {
    match metrics.get("label_accuracies") {
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .filter_map(|(label, value)| value.as_f64().map(|accuracy| LabelAccuracy { label: label.clone(), accuracy }))
            .collect(),
        Some(value @ serde_json::Value::Array(_)) => {
            serde_json::from_value::<Vec<LabelAccuracy>>(value.clone()).unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

#[async_trait]
impl TrainingEngine for HttpTrainingBridge {
    fn id(&self) -> &'static str {
        "http-bridge"
    }

    async fn load_images(&self, process_names: &[String]) -> TrainingResult<usize> {
        let data = prepare_data(&self.config, &self.params, process_names)?;
        let count = data.image_count;
        info!(class = %self.class, classes = data.class_dirs.len(), count, "Resolved training images");
        self.with_run(|run| run.data = Some(data));
        Ok(count)
    }

    async fn set_parameters(&self) -> TrainingResult<()> {
        self.params.validate()?;
        self.with_run(|run| {
            let data = run
                .data
                .as_ref()
                .ok_or_else(|| TrainingError::Configuration("images must be loaded before configuring".to_string()))?;
            if data.class_dirs.is_empty() {
                return Err(TrainingError::Configuration("no matching image directories found".to_string()));
            }
            run.request = Some(build_request(&self.config, &self.params, data, run.pretrained.as_deref()));
            Ok(())
        })
    }

    async fn load_pretrained_model(&self, class: ResourceClass) -> TrainingResult<()> {
        let path = self
            .config
            .pretrained_models
            .get(&class)
            .cloned()
            .ok_or_else(|| TrainingError::Configuration(format!("no pretrained model configured for {class}")))?;
        if !path.exists() {
            return Err(TrainingError::Configuration(format!("pretrained model not found: {}", path.display())));
        }
        self.with_run(|run| {
            if let Some(request) = run.request.as_mut() {
                request.pretrained = Some(path.display().to_string());
            }
            run.pretrained = Some(path);
        });
        Ok(())
    }

    async fn train(&self, on_progress: &mut ProgressCallback<'_>, cancel: &CancellationToken) -> TrainingResult<()> {
        let request = self
            .request()
            .ok_or_else(|| TrainingError::Configuration("parameters must be set before training".to_string()))?;

        let ack = self.client.start(&request).await?;
        if !ack.is_started() {
            return Err(TrainingError::Configuration(format!(
                "training service did not start the job: {}",
                ack.message.as_deref().unwrap_or(ack.result.as_str())
            )));
        }
        info!(class = %self.class, epochs = request.epochs, classes = request.classes.len(), "Remote training started");

        self.with_run(|run| {
            run.state = BridgeState::Started;
            run.stop_issued = false;
            run.best_iteration = 0;
            run.last_status = None;
            run.stopped_best_model = None;
            run.confusion = None;
        });
        self.running.store(true, Ordering::SeqCst);

        let mut outcome = self.poll(on_progress, cancel).await;

        if cancel.is_cancelled() {
            self.issue_stop().await;
            outcome = outcome.and(Err(TrainingError::Cancelled));
        }
        self.refresh_status().await;
        self.running.store(false, Ordering::SeqCst);
        self.with_run(|run| {
            if run.state != BridgeState::Stopped {
                run.state = BridgeState::Finished;
            }
        });
        outcome
    }

    async fn stop_training(&self) -> TrainingResult<()> {
        if self.state() == BridgeState::Idle {
            return Ok(());
        }
        self.issue_stop().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_training(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn training_result(&self) -> TrainingResult<TrainingReport> {
        let metrics = self.client.result().await?;
        Ok(TrainingReport { label_accuracies: label_accuracies(&metrics), metrics })
    }

    async fn confusion(&self, true_label: &str, predicted_label: &str) -> TrainingResult<u64> {
        let matrix = self.confusion_matrix().await?;
        for label in [true_label, predicted_label] {
            if !matrix.classes.iter().any(|c| c == label) {
                return Err(TrainingError::InvalidArgument(format!("label not in confusion matrix: {label}")));
            }
        }
        matrix
            .count(true_label, predicted_label)
            .ok_or_else(|| TrainingError::Engine("confusion matrix does not match its class list".to_string()))
    }

    async fn save_model(&self, destination: &Path) -> TrainingResult<PathBuf> {
        let checkpoint = self
            .resolve_best_model_path()
            .await
            .ok_or_else(|| TrainingError::Artifact("no best checkpoint to export".to_string()))?;

        let response = self
            .client
            .export(&ExportRequest { checkpoint: checkpoint.clone(), output: destination.display().to_string() })
            .await?;
        if let Some(err) = non_empty(response.error.as_deref()) {
            return Err(TrainingError::Engine(format!("export of {checkpoint} failed: {err}")));
        }
        debug!(checkpoint = %checkpoint, status = ?response.status, path = ?response.path, "Checkpoint exported");

        let exported = non_empty(response.path.as_deref()).map_or_else(|| destination.to_path_buf(), PathBuf::from);
        if !exported.exists() {
            return Err(TrainingError::Artifact(format!(
                "exported model {} is not reachable from this host",
                exported.display()
            )));
        }
        if exported != destination {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&exported, destination)?;
        }
        Ok(destination.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{EXPORT_PATH, RESULT_PATH, START_PATH, STATUS_PATH, STOP_PATH};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        server: mockito::ServerGuard,
        _images: TempDir,
        bridge: HttpTrainingBridge,
    }

    async fn fixture(best_model_path: Option<&str>) -> Fixture {
        let server = mockito::Server::new_async().await;
        let images = TempDir::new().unwrap();
        let dir = images.path().join("SCRATCH");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("1.png"), b"img").unwrap();

        let config = BridgeConfig {
            base_url: server.url(),
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            base_image_dir: Some(images.path().to_path_buf()),
            best_model_path: best_model_path.map(str::to_string),
            ..Default::default()
        };
        let params = TrainingParameters::new(vec!["SCRATCH".to_string()], 3);
        let bridge = HttpTrainingBridge::new(config, ResourceClass::Medium, params).unwrap();
        assert_eq!(bridge.load_images(&[]).await.unwrap(), 1);
        bridge.set_parameters().await.unwrap();
        Fixture { server, _images: images, bridge }
    }

    fn status_sequence(bodies: Vec<&'static str>) -> impl Fn(&mockito::Request) -> Vec<u8> + Send + Sync + 'static {
        let calls = Arc::new(AtomicUsize::new(0));
        move |_| {
            let i = calls.fetch_add(1, Ordering::SeqCst).min(bodies.len() - 1);
            bodies[i].as_bytes().to_vec()
        }
    }

    #[tokio::test]
    async fn test_train_polls_until_service_finishes() {
        let mut f = fixture(None).await;
        let start = f
            .server
            .mock("POST", START_PATH)
            .with_status(200)
            .with_body(r#"{"result": "started"}"#)
            .create_async()
            .await;
        let _status = f
            .server
            .mock("GET", STATUS_PATH)
            .with_status(200)
            .with_body_from_request(status_sequence(vec![
                r#"{"running": true, "current_epoch": 1, "total_epochs": 3, "current_accuracy": 0.6, "best_accuracy": 0.6}"#,
                r#"{"running": true, "current_epoch": 2, "total_epochs": 3, "current_accuracy": 0.5, "best_accuracy": 0.6}"#,
                r#"{"running": false, "current_epoch": 3, "total_epochs": 3, "current_accuracy": 0.8, "best_accuracy": 0.8, "best_model": "/ckpt/best.pt"}"#,
            ]))
            .create_async()
            .await;
        let stop = f.server.mock("POST", STOP_PATH).expect(0).create_async().await;

        let mut reports = Vec::new();
        let mut on_progress = |p: TrainingProgress| -> TrainingResult<()> {
            reports.push(p);
            Ok(())
        };
        f.bridge.train(&mut on_progress, &CancellationToken::new()).await.unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].best_iteration, 1);
        assert_eq!(reports[1].best_iteration, 1);
        assert_eq!(reports[2].best_iteration, 3);
        assert!((reports[2].validation_error - 0.2).abs() < 1e-9);
        assert!(!reports[2].is_training);
        assert_eq!(f.bridge.state(), BridgeState::Finished);
        assert!(!f.bridge.is_training());
        assert_eq!(f.bridge.resolve_best_model_path().await.as_deref(), Some("/ckpt/best.pt"));
        start.assert_async().await;
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn test_start_rejection_is_configuration_error() {
        let mut f = fixture(None).await;
        let _start = f
            .server
            .mock("POST", START_PATH)
            .with_status(200)
            .with_body(r#"{"result": "error", "message": "no matching image directories"}"#)
            .create_async()
            .await;

        let mut on_progress = |_: TrainingProgress| -> TrainingResult<()> { Ok(()) };
        let err = f.bridge.train(&mut on_progress, &CancellationToken::new()).await.unwrap_err();

        match err {
            TrainingError::Configuration(msg) => assert!(msg.contains("no matching image directories")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failed_poll_is_retried() {
        let mut f = fixture(None).await;
        let _start = f.server.mock("POST", START_PATH).with_body(r#"{"result": "started"}"#).create_async().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _status = f
            .server
            .mock("GET", STATUS_PATH)
            .with_body_from_request(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    b"not json".to_vec()
                } else {
                    br#"{"running": false, "current_epoch": 1, "current_accuracy": 0.9, "best_accuracy": 0.9}"#.to_vec()
                }
            })
            .create_async()
            .await;

        let mut reports = 0;
        let mut on_progress = |_: TrainingProgress| -> TrainingResult<()> {
            reports += 1;
            Ok(())
        };
        f.bridge.train(&mut on_progress, &CancellationToken::new()).await.unwrap();

        assert_eq!(reports, 1);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_cancellation_sends_exactly_one_stop() {
        let mut f = fixture(None).await;
        let _start = f.server.mock("POST", START_PATH).with_body(r#"{"result": "started"}"#).create_async().await;
        let _status = f
            .server
            .mock("GET", STATUS_PATH)
            .with_body(r#"{"running": false, "current_epoch": 2, "current_accuracy": 0.7, "best_accuracy": 0.7}"#)
            .create_async()
            .await;
        let stop = f
            .server
            .mock("POST", STOP_PATH)
            .with_body(r#"{"result": "stopped", "best_model": "/ckpt/last.pt", "out_dir": "/runs/1"}"#)
            .expect(1)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let mut on_progress = |_: TrainingProgress| -> TrainingResult<()> {
            cancel.cancel();
            Ok(())
        };
        let err = f.bridge.train(&mut on_progress, &cancel.clone()).await.unwrap_err();
        assert!(matches!(err, TrainingError::Cancelled));
        f.bridge.stop_training().await.unwrap();

        assert_eq!(f.bridge.state(), BridgeState::Stopped);
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn test_stop_failure_does_not_propagate() {
        let mut f = fixture(None).await;
        let _start = f.server.mock("POST", START_PATH).with_body(r#"{"result": "started"}"#).create_async().await;
        let _status = f.server.mock("GET", STATUS_PATH).with_body(r#"{"running": true}"#).create_async().await;
        let _stop = f.server.mock("POST", STOP_PATH).with_status(500).create_async().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut on_progress = |_: TrainingProgress| -> TrainingResult<()> { Ok(()) };

        let err = f.bridge.train(&mut on_progress, &cancel).await.unwrap_err();
        assert!(matches!(err, TrainingError::Cancelled));
        assert_eq!(f.bridge.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_best_model_falls_back_to_result_then_status() {
        let mut f = fixture(None).await;
        let result = f
            .server
            .mock("GET", RESULT_PATH)
            .with_body(r#"{"accuracy": 0.9}"#)
            .create_async()
            .await;
        let status = f
            .server
            .mock("GET", STATUS_PATH)
            .with_body(r#"{"running": false, "best_model": "/ckpt/from-status.pt"}"#)
            .create_async()
            .await;

        assert_eq!(f.bridge.resolve_best_model_path().await.as_deref(), Some("/ckpt/from-status.pt"));
        result.assert_async().await;
        status.assert_async().await;
    }

    #[tokio::test]
    async fn test_best_model_prefers_configured_path() {
        let f = fixture(Some("/ckpt/pinned.pt")).await;
        assert_eq!(f.bridge.resolve_best_model_path().await.as_deref(), Some("/ckpt/pinned.pt"));
    }

    #[tokio::test]
    async fn test_best_model_none_when_every_source_fails() {
        let mut f = fixture(None).await;
        let _result = f.server.mock("GET", RESULT_PATH).with_status(500).create_async().await;
        let _status = f.server.mock("GET", STATUS_PATH).with_body(r#"{"running": false}"#).create_async().await;
        assert!(f.bridge.resolve_best_model_path().await.is_none());
    }

    #[tokio::test]
    async fn test_confusion_safe_returns_zero_for_unknown_or_failing() {
        let mut f = fixture(None).await;
        let matrix = f
            .server
            .mock("POST", RESULT_PATH)
            .with_body(r#"{"confusion": [[4, 1], [2, 6]], "classes": ["SCRATCH", "OK"]}"#)
            .expect(1)
            .create_async()
            .await;

        assert_eq!(f.bridge.confusion("SCRATCH", "OK").await.unwrap(), 1);
        assert_eq!(f.bridge.confusion_safe("OK", "SCRATCH").await, 2);
        assert_eq!(f.bridge.confusion_safe("DENT", "OK").await, 0);
        matrix.assert_async().await;
    }

    #[tokio::test]
    async fn test_training_result_reads_label_accuracies() {
        let mut f = fixture(None).await;
        let _result = f
            .server
            .mock("GET", RESULT_PATH)
            .with_body(r#"{"best_accuracy": 0.9, "label_accuracies": {"SCRATCH": 0.85, "OK": 0.95}}"#)
            .create_async()
            .await;

        let report = f.bridge.training_result().await.unwrap();

        assert_eq!(report.label_accuracies.len(), 2);
        assert!(report.metrics.contains_key("best_accuracy"));
    }

    #[tokio::test]
    async fn test_save_model_copies_exported_file() {
        let mut f = fixture(Some("/ckpt/best.pt")).await;
        let out = TempDir::new().unwrap();
        let exported = out.path().join("exported.onnl");
        std::fs::write(&exported, b"packed").unwrap();
        let export = f
            .server
            .mock("POST", EXPORT_PATH)
            .match_body(mockito::Matcher::PartialJsonString(r#"{"checkpoint": "/ckpt/best.pt"}"#.to_string()))
            .with_body(format!(r#"{{"path": "{}", "status": "ok"}}"#, exported.display()))
            .create_async()
            .await;

        let dest = out.path().join("models").join("line1_weld.onnl");
        let saved = f.bridge.save_model(&dest).await.unwrap();

        assert_eq!(saved, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"packed");
        export.assert_async().await;
    }

    #[tokio::test]
    async fn test_pretrained_model_must_be_configured() {
        let f = fixture(None).await;
        let err = f.bridge.load_pretrained_model(ResourceClass::Large).await.unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
    }
}
