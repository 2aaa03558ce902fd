use thiserror::Error;

/// Errors produced by the pruning engine.
///
/// None of these are fatal to the host: fail-open surfaces turn them into a
/// [`PipelineMode::FailOpen`](crate::hooks::PipelineMode) outcome and a log line.
#[derive(Error, Debug)]
pub enum PruneError {
    #[error("Invalid sessionId: {0:?}. Use only letters, numbers, dot, underscore, and dash.")]
    InvalidSessionId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("judge request failed: {0}")]
    Judge(String),

    #[error("judge returned an invalid verdict: {0}")]
    JudgeResponse(String),

    #[error("host client error: {0}")]
    Host(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    InvalidToolArgs(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),
}

pub type Result<T> = std::result::Result<T, PruneError>;
