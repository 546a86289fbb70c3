use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Malformed record: {0}")]
    Format(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;
