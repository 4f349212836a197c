use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("malformed {expected} key '{key}'")]
    MalformedKey { key: String, expected: &'static str },

    #[error("{provider} {operation} failed: {message}")]
    Upstream {
        provider: String,
        operation: &'static str,
        message: String,
    },

    #[error("mismatched period {period}: {reason}")]
    MergeMismatch { period: String, reason: String },

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("fetch batch cancelled")]
    Cancelled,

    #[error("fetch task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Settings(#[from] ::config::ConfigError),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

impl AppError {
    /// True for errors caused by inconsistent billing data rather than by a
    /// provider or network failure.
    pub fn is_bad_data(&self) -> bool {
        matches!(self, AppError::MergeMismatch { .. } | AppError::MalformedKey { .. })
    }

    pub fn mismatch(period: impl ToString, reason: impl Into<String>) -> Self {
        AppError::MergeMismatch {
            period: period.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Task(err.to_string())
    }
}
