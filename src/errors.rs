//! Typed errors for the ingestion pipeline.
//!
//! Each connector family raises its own error enum; the pipeline propagates
//! them and the queue worker decides what is retryable. The taxonomy:
//!
//! | Category | Examples | Handling |
//! |----------|----------|----------|
//! | Configuration | unknown model, bad dimensions, missing host | fatal at construction |
//! | Transport | connection reset, timeout | bounded retries, then surfaced |
//! | Protocol | non-2xx from the embedding gateway or index | `429` propagated as rate limit, others as response errors |
//! | Semantic | embedding/input length mismatch | fatal for the job |
//! | Best-effort | telemetry overflow, usage publish failure | logged, counted, swallowed |

use thiserror::Error;

/// Errors from embedding connectors and the dimension policy.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The model name is not in the dimension policy table.
    #[error("unsupported embedding model `{0}`")]
    InvalidModel(String),

    /// A dimension override was requested for a model that does not support
    /// overriding its native dimensions.
    #[error(
        "model `{model}` does not support overriding its native dimensions of {expected}; found {dimensions}"
    )]
    InvalidModelDimensions {
        model: String,
        dimensions: usize,
        expected: usize,
    },

    /// The requested dimensions are not in the model's allowlist.
    #[error(
        "model `{model}` only supports dimensions from the allowed list {allowed:?}; found {dimensions}"
    )]
    UnsupportedDimensions {
        model: String,
        dimensions: usize,
        allowed: Vec<usize>,
    },

    /// The gateway returned HTTP 429. Never retried locally; the queue may
    /// retry the enclosing job.
    #[error("embedding provider rate limit reached; try again later")]
    RateLimited,

    /// A non-2xx, non-429 status from the embedding endpoint.
    #[error("embedding endpoint returned status {0}")]
    Response(u16),

    /// A transport-level failure (connect, DNS, timeout) after retries.
    #[error("embedding request failed: {0}")]
    Request(String),

    /// The response contained a different number of embeddings than inputs.
    #[error("input len {input} and generated embeddings len {returned} do not match")]
    SizeMismatch { input: usize, returned: usize },

    /// The response body could not be parsed.
    #[error("malformed embedding response: {0}")]
    Malformed(String),

    /// `batch_size` must be positive.
    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,

    /// Thinktank access validation failed (quota missing or exhausted).
    #[error("access validation failed: {0}")]
    AccessDenied(String),
}

/// Errors from source connectors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Authentication or bucket-head failure. Fatal at construction.
    #[error("connection to object store failed: {0}")]
    Connection(String),

    /// Listing objects failed (signed request rejected or malformed listing).
    #[error("listing objects in bucket `{bucket}` failed: {reason}")]
    Listing { bucket: String, reason: String },

    /// A per-object download failed; surfaced so the queue can retry the job.
    #[error("download of `{key}` failed: {reason}")]
    Download { key: String, reason: String },

    /// A temp file could not be created or written.
    #[error("local file error for `{key}`: {reason}")]
    LocalFile { key: String, reason: String },
}

/// Errors from sink connectors.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("could not connect to index host: {0}")]
    Connection(String),

    #[error("failed to store vectors: {0}")]
    Insertion(String),

    #[error("index query failed: {0}")]
    Query(String),

    #[error("failed to retrieve index info: {0}")]
    IndexInfo(String),
}

/// Raised by factories for names outside the compile-time registry.
#[derive(Debug, Error)]
#[error("`{name}` is not a valid {family} connector; available: {available:?}")]
pub struct InvalidConnector {
    pub family: &'static str,
    pub name: String,
    pub available: Vec<&'static str>,
}

/// Errors from the OAuth token helper.
#[derive(Debug, Error)]
pub enum OauthError {
    #[error("token endpoint returned status {0}: {1}")]
    Status(u16, String),

    #[error("token request failed: {0}")]
    Request(String),

    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// Top-level pipeline error: anything a stage can fail with.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("loading `{file}` failed: {reason}")]
    Load { file: String, reason: String },

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Connector(#[from] InvalidConnector),

    #[error("invalid pipeline configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the queue worker should re-attempt the job. Configuration and
    /// semantic errors never succeed on retry; transport, rate-limit, and
    /// per-object I/O errors can.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Source(e) => matches!(
                e,
                SourceError::Download { .. } | SourceError::Listing { .. }
            ),
            PipelineError::Embed(e) => matches!(
                e,
                EmbedError::RateLimited | EmbedError::Request(_) | EmbedError::Response(_)
            ),
            PipelineError::Sink(e) => {
                matches!(e, SinkError::Connection(_) | SinkError::Insertion(_))
            }
            PipelineError::Load { .. } => false,
            PipelineError::Connector(_) => false,
            PipelineError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = PipelineError::Embed(EmbedError::RateLimited);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_dimension_errors_are_fatal() {
        let err = PipelineError::Embed(EmbedError::InvalidModelDimensions {
            model: "jina-v2-base".to_string(),
            dimensions: 1024,
            expected: 768,
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_connector_lists_available() {
        let err = InvalidConnector {
            family: "embed",
            name: "bogus".to_string(),
            available: vec!["jina-v2-base"],
        };
        let msg = err.to_string();
        assert!(msg.contains("bogus"));
        assert!(msg.contains("jina-v2-base"));
    }
}
