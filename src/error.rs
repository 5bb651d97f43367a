//! Error Module
//!
//! Failure classes of the agent. Probe and transport failures are absorbed
//! by the engines and only show up as state; auth and storage failures are
//! surfaced to the caller.

/// Failure while reading the current wireless network
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe IO error: {0}")]
    Io(String),

    #[error("Probe timed out")]
    Timeout,

    #[error("No network probe available on this platform")]
    Unsupported,
}

/// Failure to reach the remote service
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Authentication failures that need user attention
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Login rejected: {0}")]
    Rejected(String),

    #[error("Refresh token is no longer valid, please log in again")]
    InvalidRefreshToken,

    #[error("Not logged in")]
    Unauthenticated,

    #[error("Access token rejected by server")]
    Unauthorized,
}

/// Durable storage errors (event queue or credential store)
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}

/// Top-level error returned to UI collaborators
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
