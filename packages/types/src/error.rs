//! Error surface shared between drivers and their callers

use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors a storage driver can return to upper layers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("storage not found")]
    StorageNotFound,

    #[error("not implemented")]
    NotImplemented,

    #[error("not supported")]
    NotSupported,

    #[error("object not found")]
    ObjectNotFound,

    #[error("not a folder")]
    NotFolder,

    #[error("not a file")]
    NotFile,

    /// The backend rejected our credentials; the driver cannot recover
    /// without operator intervention.
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Other(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn other(message: impl Into<String>) -> Self {
        DriverError::Other(message.into())
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, DriverError::NotImplemented)
    }
}
