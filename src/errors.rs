use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Auth(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0} is not available")]
    Unavailable(String),
    #[error("{service} error: {message}")]
    Service { service: &'static str, message: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl AppError {
    pub fn user_message(&self) -> String {
        match self {
            AppError::Http(err) if err.is_timeout() => "The request timed out".to_string(),
            AppError::Http(err) if err.is_connect() => "Unable to reach the service".to_string(),
            AppError::Database(_) | AppError::Keychain(_) | AppError::Io(_) => {
                "Local storage is unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}
