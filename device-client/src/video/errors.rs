use std::io;
use thiserror::Error;

// ============================================================================
// Capture Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Camera has no deployed model")]
    NotDeployed,

    #[error("Model deployment failed: {reason}")]
    DeployFailed { reason: String },

    #[error("Frame buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("JPEG encode failed: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;
