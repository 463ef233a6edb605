use outpost_shared::{CryptoError, TokenError};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error other than busy/locked.
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// The database is busy or locked by another handle. Nothing was
    /// committed; the caller may retry on its next invocation.
    #[error("Database is busy, try again later")]
    Busy,

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Snapshot (de)serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    #[error("Invalid token: {0}")]
    Token(#[from] TokenError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wrong credentials, wrong factor or undecodable ciphertext. These are
    /// deliberately indistinguishable.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// No account row exists yet (first run).
    #[error("No user configured")]
    NoUserConfigured,

    #[error("An account for this user already exists")]
    AccountExists,

    /// An encrypted field was touched before any key was unlocked.
    #[error("No account is logged in")]
    NotLoggedIn,

    /// Writing under a policy whose key the active factor cannot unlock.
    #[error("Field policy unavailable: {0}")]
    PolicyUnavailable(&'static str),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// The operation does not apply to this kind of staged object.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A journal row disappeared inside the transaction that wrote it.
    #[error("Journal row missing for {0}")]
    MissingRow(String),

    #[error("Secret protector error: {0}")]
    Protector(String),
}

impl StoreError {
    /// Transient errors are safe to retry; nothing was committed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Busy,
            _ => StoreError::Sqlite(e),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
