use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy for one render/publish job.
///
/// Nothing in here is allowed to mutate the work queue; the pipeline only
/// touches the queue after a publish returned an `UploadResult`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("asset unavailable ({asset}): {reason}")]
    AssetUnavailable { asset: String, reason: String },

    #[error("speech synthesis failed in {backend}: {reason}")]
    SynthesisFailed { backend: String, reason: String },

    #[error("composition failed ({status}): {stderr}")]
    CompositionFailed { status: String, stderr: String },

    #[error("credential for {token_file} is unusable: {remediation}")]
    AuthExpired {
        token_file: PathBuf,
        remediation: String,
    },

    #[error("publish to {platform} failed: {reason}")]
    PublishFailed {
        platform: String,
        reason: String,
        retryable: bool,
    },

    #[error("could not probe {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("work queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn asset(asset: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AssetUnavailable {
            asset: asset.into(),
            reason: reason.into(),
        }
    }

    pub fn synthesis(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SynthesisFailed {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn publish(platform: impl Into<String>, reason: impl Into<String>, retryable: bool) -> Self {
        Self::PublishFailed {
            platform: platform.into(),
            reason: reason.into(),
            retryable,
        }
    }

    /// Whether running the same job again later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AssetUnavailable { .. } => true,
            Self::SynthesisFailed { .. } => true,
            Self::CompositionFailed { .. } => true,
            Self::AuthExpired { .. } => false,
            Self::PublishFailed { retryable, .. } => *retryable,
            Self::Probe { .. } => true,
            Self::Queue(_) => false,
            Self::Config(_) => false,
            Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error()),
            Self::Json(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
