use thiserror::Error;

use crate::crypto::CipherError;
use crate::store::StoreError;

/// Internal error taxonomy. Only the facade layer turns these into
/// client-facing payloads; every other component returns them upward.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway not configured")]
    NotConfigured,
    #[error("unauthorized client key")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream request failed: {0}")]
    UpstreamNetwork(String),
    #[error("invalid upstream response: {0}")]
    BadUpstream(String),
    #[error("decrypt credential: {0}")]
    Cipher(#[from] CipherError),
    #[error("config store: {0}")]
    Store(#[from] StoreError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// A failure that may be retried against a different credential
    /// (non-streaming calls only).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamNetwork(_) | GatewayError::Cipher(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
