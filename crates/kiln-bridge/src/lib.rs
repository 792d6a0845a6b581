//! Kiln Bridge
//!
//! Drives training on the remote classification service over HTTP.
//!
//! - `TrainingServiceClient`: one method per service endpoint
//! - `HttpTrainingBridge`: the start/poll/stop protocol as a `TrainingEngine`
//! - `HttpModelUploader`: multipart model upload to inspection devices
//! - `HttpBridgeFactory`: per-job bridge construction for the orchestrator

pub mod bridge;
pub mod client;
pub mod error;
pub mod factory;
pub mod request;
pub mod upload;
pub mod wire;

pub use bridge::{BridgeState, HttpTrainingBridge};
pub use client::TrainingServiceClient;
pub use error::{BridgeError, BridgeResult};
pub use factory::HttpBridgeFactory;
pub use request::{build_request, prepare_data, BridgeConfig, PreparedData};
pub use upload::HttpModelUploader;
pub use wire::{BridgeRequest, BridgeStatus, InferRequest, InferResponse};
