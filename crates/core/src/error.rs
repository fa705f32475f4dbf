//! Typed failures that callers branch on.
//!
//! Most functions return `anyhow::Result`; the variants here are raised with
//! `bail!`/`Err(..)?` and recovered with `downcast_ref::<UpscaleError>()` where the
//! pipeline needs to react (tile retry, per-file failure accounting, cancel).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("malformed planar stream: {0}")]
    Format(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("{program} failed: {reason}")]
    ExternalProcess { program: String, reason: String },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported checkpoint format: {path} ({hint})")]
    UnsupportedCheckpoint { path: PathBuf, hint: String },

    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl UpscaleError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Whether a smaller tile might let the same frame succeed.
    pub fn is_retryable_inference(&self) -> bool {
        matches!(self, Self::Inference(_) | Self::Timeout { .. })
    }
}

/// Find an [`UpscaleError`] anywhere in an `anyhow` chain.
pub fn find_upscale_error(err: &anyhow::Error) -> Option<&UpscaleError> {
    err.chain().find_map(|cause| cause.downcast_ref::<UpscaleError>())
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(find_upscale_error(err), Some(UpscaleError::Cancelled))
}
