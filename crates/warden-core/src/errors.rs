use std::path::PathBuf;

/// Core error type.
///
/// Policy outcomes (an OTP that failed to verify, an untrusted caller) are not
/// errors; they come back as typed results. This type covers the faults that
/// the host may want to surface or retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt store: {path}: {reason}")]
    CorruptStore { path: PathBuf, reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
