//! Error type shared by every store operation.

use thiserror::Error;

pub type PosResult<T> = Result<T, PosError>;

#[derive(Debug, Error)]
pub enum PosError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("e-mail error: {0}")]
    Email(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("the cash drawer for {0} is already closed")]
    DayClosed(String),

    #[error("database connection lock poisoned")]
    LockPoisoned,
}

impl PosError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<lettre::error::Error> for PosError {
    fn from(err: lettre::error::Error) -> Self {
        Self::Email(err.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for PosError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        Self::Email(err.to_string())
    }
}

impl From<lettre::address::AddressError> for PosError {
    fn from(err: lettre::address::AddressError) -> Self {
        Self::Email(format!("invalid address: {err}"))
    }
}
