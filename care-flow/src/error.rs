use thiserror::Error;

/// Error taxonomy for the note pipeline and its stores.
///
/// `UpstreamTimeout` and `UpstreamUnavailable` are the two variants the
/// orchestrator absorbs into the degraded mock path; everything else
/// propagates to the caller.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream call timed out: {0}")]
    UpstreamTimeout(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("failed to parse LLM output: {0}")]
    Parse(String),

    #[error("unsupported content format: {0}")]
    UnsupportedFormat(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("stage execution failed: {0}")]
    StageFailed(String),
}

impl FlowError {
    /// True for failures the orchestrator degrades into the mock
    /// responder instead of surfacing as an error.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            FlowError::UpstreamTimeout(_) | FlowError::UpstreamUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
