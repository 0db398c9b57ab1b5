//! Error types for the Sorta Mail sync core

use std::path::PathBuf;

/// Result type alias for sync core operations
pub type SortaResult<T> = Result<T, SortaError>;

/// Main error type for the sync core
#[derive(Debug, thiserror::Error)]
pub enum SortaError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to create a configuration or data directory
    #[error("Failed to create directory: {0}")]
    DirCreateFailed(PathBuf),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Database migration error
    #[error("Database migration error: {0}")]
    DatabaseMigration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// IMAP protocol errors
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    /// MIME parsing errors
    #[error("MIME parsing error: {0}")]
    Mime(#[from] mailparse::MailParseError),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// The remote session was dropped underneath us
    #[error("Session lost: {0}")]
    SessionLost(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A remote mutation did not produce the expected post-condition
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Some members of a multi-message operation failed remotely
    #[error("{operation}: {failed}/{total} failed")]
    PartialFailure {
        operation: String,
        failed: usize,
        total: usize,
    },

    /// A remote record could not be interpreted
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A detached task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),
}

impl SortaError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn session_lost(msg: impl Into<String>) -> Self {
        Self::SessionLost(msg.into())
    }

    /// Create a new verification error
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Aggregate error for a multi-message operation
    pub fn partial(operation: impl Into<String>, failed: usize, total: usize) -> Self {
        Self::PartialFailure {
            operation: operation.into(),
            failed,
            total,
        }
    }

    /// Check if the session should be torn down and re-established
    pub fn is_session_lost(&self) -> bool {
        match self {
            Self::SessionLost(_) | Self::Timeout(_) | Self::Network(_) => true,
            Self::Imap(e) => matches!(
                e,
                async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
            ),
            _ => false,
        }
    }

    /// Check if this is a verification failure
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Self::Verification(_))
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        self.is_session_lost() || matches!(self, Self::Io(_) | Self::Tls(_) | Self::Pool(_))
    }
}
