//! Pushes trained models to inspection devices.

use async_trait::async_trait;
use kiln_training::{DeviceTarget, ModelUploadTarget, UploadOutcome};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const UPLOAD_PATH: &str = "/api/model/upload";

/// Multipart uploader speaking the device's model endpoint.
#[derive(Debug, Clone)]
pub struct HttpModelUploader {
    client: Client,
}

impl HttpModelUploader {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client for uploads");
            Client::new()
        });
        Self { client }
    }

    fn url(device: &DeviceTarget) -> String {
        let host = device.ip.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}{UPLOAD_PATH}")
        } else {
            format!("http://{host}{UPLOAD_PATH}")
        }
    }
}

impl Default for HttpModelUploader {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl ModelUploadTarget for HttpModelUploader {
    async fn upload(&self, device: &DeviceTarget, model_file: &Path, model_path: &str) -> (UploadOutcome, Option<String>) {
        let bytes = match tokio::fs::read(model_file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(device = %device.name, file = %model_file.display(), error = %e, "Model file unreadable");
                return (UploadOutcome::Error, Some(format!("cannot read {}: {e}", model_file.display())));
            }
        };

        let file_name = model_file.file_name().map_or_else(|| "model.onnl".to_string(), |n| n.to_string_lossy().into_owned());
        let form = Form::new()
            .part("File", Part::bytes(bytes).file_name(file_name))
            .text("ModelPath", model_path.to_string());

        let url = Self::url(device);
        match self.client.post(&url).multipart(form).send().await {
            Ok(response) if response.status().is_success() => {
                info!(device = %device.name, model_path, "Model uploaded");
                (UploadOutcome::Saved, None)
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(device = %device.name, status = %status, "Device rejected model upload");
                (UploadOutcome::Pending, Some(format!("{status}: {body}")))
            }
            Err(e) => {
                warn!(device = %device.name, url = %url, error = %e, "Model upload failed");
                (UploadOutcome::Error, Some(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(ip: &str) -> DeviceTarget {
        DeviceTarget { name: "line-1".to_string(), ip: ip.to_string(), model_dir: "/opt/models".to_string() }
    }

    fn model_file() -> (TempDir, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("line-1_weld.onnl");
        std::fs::write(&path, b"packed").unwrap();
        (temp, path)
    }

    #[tokio::test]
    async fn test_success_status_is_saved() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", UPLOAD_PATH)
            .match_body(mockito::Matcher::Regex("ModelPath".to_string()))
            .with_status(200)
            .create_async()
            .await;
        let (_temp, file) = model_file();
        let target = device(&server.host_with_port());

        let (outcome, message) =
            HttpModelUploader::default().upload(&target, &file, &target.model_path("weld")).await;

        assert_eq!(outcome, UploadOutcome::Saved);
        assert!(message.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_pending() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", UPLOAD_PATH).with_status(500).with_body("disk full").create_async().await;
        let (_temp, file) = model_file();

        let (outcome, message) =
            HttpModelUploader::default().upload(&device(&server.host_with_port()), &file, "/opt/models/weld.onnl").await;

        assert_eq!(outcome, UploadOutcome::Pending);
        assert!(message.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_error() {
        let (_temp, file) = model_file();
        let uploader = HttpModelUploader::new(Duration::from_millis(500));

        let (outcome, _) = uploader.upload(&device("127.0.0.1:1"), &file, "/opt/models/weld.onnl").await;

        assert_eq!(outcome, UploadOutcome::Error);
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let temp = TempDir::new().unwrap();
        let (outcome, message) = HttpModelUploader::default()
            .upload(&device("127.0.0.1:1"), &temp.path().join("absent.onnl"), "/opt/models/weld.onnl")
            .await;

        assert_eq!(outcome, UploadOutcome::Error);
        assert!(message.unwrap().contains("cannot read"));
    }
}
