use eew_common::stream::LogError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("archive operation failed: {0}")]
    OperationFailed(String),
    #[error("malformed archive data: {0}")]
    ParseError(String),
}

impl From<std::string::FromUtf8Error> for ArchiveError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ArchiveError::ParseError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Log(#[from] LogError),
}
