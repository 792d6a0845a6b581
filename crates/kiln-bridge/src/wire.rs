//! JSON payloads exchanged with the remote training service.

use kiln_training::AugmentationConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /train/cls/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Working copy the class directories live under, when data was staged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_root: Option<String>,
    pub classes: Vec<String>,
    pub class_dirs: BTreeMap<String, Vec<String>>,
    pub img_size: u32,
    pub epochs: u32,
    pub batch_size: u32,
    pub val_split: f64,
    pub lr: f64,
    pub model: String,
    pub augment: AugmentationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretrained: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    #[serde(default)]
    pub result: String,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

impl StartResponse {
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.result.eq_ignore_ascii_case("started")
    }
}

/// Body of `GET /train/cls/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeStatus {
    pub running: bool,
    pub progress: f64,
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub current_accuracy: f64,
    pub best_accuracy: f64,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub best_model: Option<String>,
    pub error: Option<String>,
}

impl BridgeStatus {
    /// Progress as a fraction. The service reports either a fraction or a
    /// percentage; with neither, the epoch ratio is used.
    #[must_use]
    pub fn progress_fraction(&self) -> f64 {
        let reported = if self.progress > 1.0 { self.progress / 100.0 } else { self.progress };
        let fraction = if reported <= 0.0 && self.total_epochs > 0 {
            f64::from(self.current_epoch) / f64::from(self.total_epochs)
        } else {
            reported
        };
        if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 }
    }

    #[must_use]
    pub fn best_model_path(&self) -> Option<&str> {
        non_empty(self.best_model.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StopResponse {
    pub result: Option<String>,
    pub best_model: Option<String>,
    pub out_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfusionResponse {
    pub confusion: Vec<Vec<u64>>,
    pub classes: Vec<String>,
}

impl ConfusionResponse {
    #[must_use]
    pub fn count(&self, true_label: &str, predicted_label: &str) -> Option<u64> {
        let row = self.classes.iter().position(|c| c == true_label)?;
        let col = self.classes.iter().position(|c| c == predicted_label)?;
        self.confusion.get(row)?.get(col).copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportRequest {
    pub checkpoint: String,
    pub output: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportResponse {
    pub path: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferRequest {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InferResponse {
    pub best_label: String,
    pub best_score: f64,
    pub all_scores: BTreeMap<String, f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogResponse {
    pub log: String,
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tolerates_missing_fields() {
        let status: BridgeStatus = serde_json::from_str(r#"{"running": true, "current_epoch": 2}"#).unwrap();
        assert!(status.running);
        assert_eq!(status.current_epoch, 2);
        assert!(status.best_model_path().is_none());
    }

    #[test]
    fn test_progress_fraction_handles_percent_and_epochs() {
        let status = BridgeStatus { progress: 40.0, ..Default::default() };
        assert!((status.progress_fraction() - 0.4).abs() < 1e-9);
        let status = BridgeStatus { current_epoch: 3, total_epochs: 4, ..Default::default() };
        assert!((status.progress_fraction() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_confusion_count_looks_up_by_label() {
        let matrix = ConfusionResponse {
            confusion: vec![vec![5, 1], vec![0, 7]],
            classes: vec!["SCRATCH".to_string(), "OK".to_string()],
        };
        assert_eq!(matrix.count("SCRATCH", "OK"), Some(1));
        assert_eq!(matrix.count("OK", "OK"), Some(7));
        assert_eq!(matrix.count("DENT", "OK"), None);
    }

    #[test]
    fn test_infer_response_uses_camel_case() {
        let resp: InferResponse =
            serde_json::from_str(r#"{"bestLabel":"OK","bestScore":0.9,"allScores":{"OK":0.9,"SCRATCH":0.1}}"#).unwrap();
        assert_eq!(resp.best_label, "OK");
        assert_eq!(resp.all_scores.len(), 2);
    }
}
