use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store holds invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store file {0} is not a json object")]
    NotAnObject(String),
}

#[derive(Debug, Error)]
pub enum BookmarkError {
    #[error("bookmark file io error: {0}")]
    Io(#[from] io::Error),
    #[error("bookmark file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bookmark file has no roots object")]
    MissingRoots,
    #[error("no bookmark with id {0}")]
    NotFound(String),
    #[error("bookmark {0} is not a folder")]
    NotAFolder(String),
    #[error("root folder {0} cannot be removed")]
    ProtectedRoot(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("settings are not valid: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("proxy address and port are required when proxy retry is enabled")]
    IncompleteProxy,
    #[error("proxy port must be between 1 and 65535, got '{0}'")]
    InvalidPort(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy control is not available")]
    Unavailable,
    #[error("proxy configuration rejected: {0}")]
    Rejected(String),
}

impl From<SettingsError> for io::Error {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::IncompleteProxy | SettingsError::InvalidPort(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
            }
            other => io::Error::other(other),
        }
    }
}

impl From<BookmarkError> for io::Error {
    fn from(err: BookmarkError) -> Self {
        match err {
            BookmarkError::Io(inner) => inner,
            BookmarkError::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, err.to_string()),
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

impl From<StoreError> for io::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
