use crate::error::TrainingResult;
use crate::job::DeviceTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Result of pushing a model file to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    /// Device accepted the upload.
    Saved,
    /// Device answered with a non-success status; retry later.
    Pending,
    /// Upload could not be attempted or the transport failed.
    Error,
}

impl std::fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Saved => "saved",
            Self::Pending => "pending",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub device: String,
    pub device_ip: String,
    pub process_name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub sha256: Option<String>,
    pub outcome: UploadOutcome,
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// One non-zero cell of the confusion matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCell {
    pub true_label: String,
    pub predicted_label: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelAccuracy {
    pub label: String,
    pub accuracy: f64,
}

/// Final metrics an engine reports once training is over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingReport {
    #[serde(default)]
    pub label_accuracies: Vec<LabelAccuracy>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// Receives trained model artifacts.
#[async_trait]
pub trait ModelUploadTarget: Send + Sync {
    async fn upload(&self, device: &DeviceTarget, model_file: &Path, model_path: &str) -> (UploadOutcome, Option<String>);
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_file_matches_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.onnl");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_upload_outcome_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&UploadOutcome::Pending).unwrap(), "\"pending\"");
        assert_eq!(UploadOutcome::Saved.to_string(), "saved");
    }
}
