use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("request to {endpoint} failed with status {status}")]
    Status { endpoint: String, status: u16 },
    #[error("{0}")]
    Config(String),
    #[error("invalid GPX: {0}")]
    Parse(String),
    #[error("unsupported map bounds: {0}")]
    Bounds(String),
    #[error("overlay could not be rendered: {0}")]
    Render(String),
    #[error("operation canceled")]
    Canceled,
}

impl AppError {
    /// Distinguishes a user-initiated abort from a genuine failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Canceled)
    }
}
