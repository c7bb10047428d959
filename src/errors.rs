use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("AUTH_REQUIRED: {0}")]
    AuthRequired(String),
    #[error("AUTH_FAILED: {0}")]
    Auth(String),
    #[error("ACCESS_DENIED: {0}")]
    AccessDenied(String),
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("TRANSPORT: {0}")]
    Transport(String),
    #[error("UPLOAD: {0}")]
    Upload(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Message without the code prefix, suitable for a form error line.
    pub fn message(&self) -> &str {
        match self {
            Self::AuthRequired(message)
            | Self::Auth(message)
            | Self::AccessDenied(message)
            | Self::Validation(message)
            | Self::Transport(message)
            | Self::Upload(message)
            | Self::NotFound(message)
            | Self::Io(message)
            | Self::Internal(message) => message,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
