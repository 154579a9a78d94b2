use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Isolation error: {0}")]
    Isolation(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Worker binary not found: {0}")]
    WorkerBinaryNotFound(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl Error {
    /// Whether the error came from the durable store.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
