use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Mapping(String),
    #[error("{0}")]
    Store(String),
    #[error("{0}")]
    Auth(String),
    #[error("sign in required")]
    Unauthenticated,
    #[error("realtime: {0}")]
    Realtime(String),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
}

impl AppError {
    /// Whether the failure means the caller should be sent back to sign-in.
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, AppError::Unauthenticated)
    }
}
