//! Error types for skywatch.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checkpoint store errors.
///
/// A corrupt checkpoint is fatal at startup: starting from scratch would
/// silently duplicate output, so the operator has to resolve it.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Corrupt checkpoint file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to persist checkpoint {path}: {reason}")]
    PersistFailed { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel client errors, classified for the retriever's fallback policy.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Server-side search is not available on this channel/backend.
    /// Triggers the permanent downgrade to iteration, never a retry.
    #[error("Search unsupported on channel {channel}: {reason}")]
    SearchUnsupported { channel: String, reason: String },

    #[error("Rate limited on channel {channel}, retry after {retry_after:?}")]
    RateLimited {
        channel: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for channel {channel}: {reason}")]
    AuthFailed { channel: String, reason: String },

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ChannelError {
    /// Transient errors are retried with the same strategy; everything else
    /// is either a strategy downgrade (`SearchUnsupported`) or terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Http(_) | Self::InvalidResponse(_)
        )
    }
}

/// Model service errors.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Rate limited by model service, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient model service failure: {0}")]
    Transient(String),

    #[error("Model request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed for model service: {0}")]
    AuthFailed(String),

    #[error("Model service quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Invalid model service response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Auth and quota failures abort the whole run; retrying them per-item
    /// would burn the remaining attempts on guaranteed failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed(_) | Self::QuotaExhausted(_))
    }
}

/// Extraction call outcomes that are not a usable result.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Worth retrying under the governor's backoff policy.
    #[error("Retryable extraction failure: {0}")]
    Retryable(String),

    /// Aborts the run (auth/quota).
    #[error("Fatal extraction failure: {0}")]
    Fatal(String),
}

impl From<ModelError> for ExtractError {
    fn from(err: ModelError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err.to_string())
        } else {
            Self::Retryable(err.to_string())
        }
    }
}

/// Governor-level outcome for an item whose extraction did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// Attempt cap or total retry time budget exceeded; the item is
    /// reclassified as failed-permanent by the orchestrator.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("Fatal failure: {0}")]
    Fatal(String),
}

/// Output sink errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pipeline-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Run aborted: {reason}")]
    Fatal { reason: String },

    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] ChannelError),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_transient_classification() {
        assert!(ChannelError::Http("503".into()).is_transient());
        assert!(
            ChannelError::RateLimited {
                channel: "c".into(),
                retry_after: None
            }
            .is_transient()
        );
        assert!(
            !ChannelError::SearchUnsupported {
                channel: "c".into(),
                reason: "disabled".into()
            }
            .is_transient()
        );
        assert!(
            !ChannelError::AuthFailed {
                channel: "c".into(),
                reason: "bad session".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn model_fatal_classification() {
        assert!(ModelError::AuthFailed("401".into()).is_fatal());
        assert!(ModelError::QuotaExhausted("insufficient_quota".into()).is_fatal());
        assert!(!ModelError::RateLimited { retry_after: None }.is_fatal());
        assert!(!ModelError::Transient("connection reset".into()).is_fatal());
    }

    #[test]
    fn model_error_maps_to_extract_error() {
        let e: ExtractError = ModelError::RateLimited { retry_after: None }.into();
        assert!(matches!(e, ExtractError::Retryable(_)));

        let e: ExtractError = ModelError::QuotaExhausted("out".into()).into();
        assert!(matches!(e, ExtractError::Fatal(_)));
    }
}
