//! Top-level error types for Agentco.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wire-level error code surfaced at the RPC boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Store(StoreError::NotFound { .. }) => ErrorCode::NotFound,
            Error::Store(StoreError::AlreadyExists { .. }) => ErrorCode::AlreadyExists,
            Error::Store(StoreError::InvalidValue(_)) => ErrorCode::InvalidRequest,
            Error::Config(_) => ErrorCode::InvalidRequest,
            _ => ErrorCode::Unavailable,
        }
    }
}

/// Error codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    AlreadyExists,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            // NOT_FOUND is reported as INVALID_REQUEST for frontend
            // compatibility; the message still says "not found".
            ErrorCode::InvalidRequest | ErrorCode::NotFound => "INVALID_REQUEST",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Unavailable => "UNAVAILABLE",
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Channel and task store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outbound gateway RPC errors. Logged and swallowed by the trigger engine;
/// never surfaced to the caller that posted the triggering message.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Request(String),

    #[error("gateway call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
