//! Error types shared across the fetch pipeline.
//!
//! Every error here is `Clone`: one fetch outcome is handed to every caller
//! that joined the in-flight request, so non-`Clone` sources are held in an
//! [`Arc`].

use std::sync::Arc;

use thiserror::Error;

/// The transport could not produce a readable response body.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("no response body received from {url}")]
    NoBody { url: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] Arc<reqwest::Error>),

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    #[error("failed to read response body: {0}")]
    Body(#[source] Arc<reqwest::Error>),

    #[error("response body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },
}

impl TransportError {
    /// Classifies a `reqwest` failure for `url`.
    pub(crate) fn from_request(url: &str, err: reqwest::Error) -> Self {
        let url = url.to_owned();
        if err.is_timeout() {
            TransportError::Timeout { url }
        } else if err.is_connect() {
            TransportError::Connect {
                url,
                source: Arc::new(err),
            }
        } else {
            TransportError::Request {
                url,
                source: Arc::new(err),
            }
        }
    }
}

/// The decoded payload is not a JSON array.
///
/// Invalid JSON is a subtype of a malformed response.
#[derive(Debug, Clone, Error)]
pub enum MalformedResponse {
    #[error("response from {url} is not in the expected format (found {found}, expected array)")]
    NotAnArray { url: String, found: &'static str },

    #[error("response from {url} is not valid JSON: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: Arc<serde_json::Error>,
    },
}

/// Outcome of a failed `fetch_or_reuse` call.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Malformed(#[from] MalformedResponse),

    #[error("fetch of {url} ended without an outcome")]
    Aborted { url: String },
}

impl FetchError {
    /// Returns `true` for failures that happened before any payload was decoded.
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }

    /// Returns `true` if the payload arrived but was not a JSON array.
    pub fn is_malformed(&self) -> bool {
        matches!(self, FetchError::Malformed(_))
    }
}

/// Errors from the cache handoff (serialize / initialize).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to serialize cache: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to initialize cache from serialized text: {0}")]
    Deserialize(#[source] serde_json::Error),
}
