//! Engine error type. Every public operation resolves to a `DbError` with a
//! stable code string; nothing panics across the API boundary.

use thiserror::Error;

use crate::format::FormatError;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Db(String),

    #[error("engine is shutting down")]
    Shutdown,

    #[error("cache is full")]
    CacheFull,

    #[error("invalid file id")]
    InvalidFileId,

    #[error("invalid engine type: {0}")]
    InvalidEngineType(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Meta(String),

    #[error("table does not exist: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),
}

impl DbError {
    /// Stable code string for status reporting and monitoring.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Db(_) => "DB_ERROR",
            DbError::Shutdown => "SHUTDOWN",
            DbError::CacheFull => "CACHE_FULL",
            DbError::InvalidFileId => "INVALID_FILE_ID",
            DbError::InvalidEngineType(_) => "INVALID_ENGINE_TYPE",
            DbError::Io(_) => "IO_ERROR",
            DbError::Meta(_) => "META_ERROR",
            DbError::TableNotFound(_) => "TABLE_NOT_EXIST",
            DbError::TableAlreadyExists(_) => "TABLE_ALREADY_EXIST",
        }
    }
}

impl From<FormatError> for DbError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Io(io) => DbError::Io(io),
            other => DbError::Db(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Meta(err.to_string())
    }
}
