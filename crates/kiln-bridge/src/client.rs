//! Plain request/response client for the remote training service.

use crate::error::{BridgeError, BridgeResult};
use crate::wire::{
    BridgeRequest, BridgeStatus, ConfusionResponse, ExportRequest, ExportResponse, InferRequest, InferResponse,
    LogResponse, StartResponse, StopResponse,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

pub const START_PATH: &str = "/train/cls/start";
pub const STATUS_PATH: &str = "/train/cls/status";
pub const STOP_PATH: &str = "/train/cls/stop";
pub const RESULT_PATH: &str = "/train/cls/result";
pub const LOG_PATH: &str = "/train/cls/log";
pub const EXPORT_PATH: &str = "/export/cls/onnl_pack";
pub const INFER_PATH: &str = "/infer/cls/single";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone)]
pub struct TrainingServiceClient {
    /// The base URL of the service (e.g. "http://127.0.0.1:8000").
    base_url: String,
    client: Client,
}

impl TrainingServiceClient {
    /// Creates a client with a per-request timeout.
    ///
    /// # Errors
    /// Returns a `BridgeError` if the HTTP client cannot be created.
    pub fn new(base_url: &str, timeout: Duration) -> BridgeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| BridgeError::Request { url: base_url.to_string(), source })?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn decode<T: DeserializeOwned>(url: String, response: reqwest::Response) -> BridgeResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(url = %url, status = %status, body = %body, "Training service returned error status");
            return Err(BridgeError::Status { url, code: status.as_u16(), body });
        }
        let bytes = response.bytes().await.map_err(|source| BridgeError::Request { url: url.clone(), source })?;
        serde_json::from_slice(&bytes).map_err(|e| BridgeError::Protocol(format!("{url}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> BridgeResult<T> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| BridgeError::Request { url: url.clone(), source })?;
        Self::decode(url, response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> BridgeResult<T> {
        let url = self.url(path);
        debug!(url = %url, "POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| BridgeError::Request { url: url.clone(), source })?;
        Self::decode(url, response).await
    }

    pub async fn start(&self, request: &BridgeRequest) -> BridgeResult<StartResponse> {
        self.post_json(START_PATH, request).await
    }

    pub async fn status(&self) -> BridgeResult<BridgeStatus> {
        self.get_json(STATUS_PATH).await
    }

    pub async fn stop(&self) -> BridgeResult<StopResponse> {
        self.post_json(STOP_PATH, &serde_json::json!({})).await
    }

    /// Final metrics as reported by the service.
    pub async fn result(&self) -> BridgeResult<BTreeMap<String, serde_json::Value>> {
        self.get_json(RESULT_PATH).await
    }

    pub async fn confusion(&self) -> BridgeResult<ConfusionResponse> {
        self.post_json(RESULT_PATH, &serde_json::json!({ "confusion": true })).await
    }

    pub async fn log(&self) -> BridgeResult<String> {
        let response: LogResponse = self.get_json(LOG_PATH).await?;
        Ok(response.log)
    }

    pub async fn export(&self, request: &ExportRequest) -> BridgeResult<ExportResponse> {
        self.post_json(EXPORT_PATH, request).await
    }

    pub async fn infer(&self, request: &InferRequest) -> BridgeResult<InferResponse> {
        self.post_json(INFER_PATH, request).await
    }

    /// Liveness check. Only the HTTP status matters.
    pub async fn health(&self) -> bool {
        match self.client.get(self.url(HEALTH_PATH)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(base_url = %self.base_url, error = %e, "Health check failed");
                false
            }
        }
    }
}
