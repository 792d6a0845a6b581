use kiln_training::TrainingError;
use thiserror::Error;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Errors talking to the remote training service.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The request could not be sent or the response body could not be read.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status.
    #[error("{url} returned {code}: {body}")]
    Status { url: String, code: u16, body: String },

    /// The service answered with a payload the bridge cannot use.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<BridgeError> for TrainingError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Io(e) => Self::Io(e),
            other => Self::Engine(other.to_string()),
        }
    }
}
