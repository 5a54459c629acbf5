use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Stage of decoding at which a source file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// The file could not be opened or its container not recognized
    Open,
    /// The file opened but its content could not be read as rows
    Parse,
}

impl fmt::Display for DecodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodePhase::Open => write!(f, "open"),
            DecodePhase::Parse => write!(f, "parse"),
        }
    }
}

/// Failure to turn a source file into rows. Always fatal for the task.
#[derive(Error, Debug)]
#[error("Decode error ({phase}) in {}: {message}", path.display())]
pub struct DecodeError {
    pub path: PathBuf,
    pub phase: DecodePhase,
    pub message: String,
}

impl DecodeError {
    pub fn open(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            phase: DecodePhase::Open,
            message: message.to_string(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            phase: DecodePhase::Parse,
            message: message.to_string(),
        }
    }
}

/// Main error type for tabload
#[derive(Error, Debug)]
pub enum TabloadError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source file could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Duplicate policy `error` found rows that already exist downstream
    #[error("Duplicate policy violation: {conflicts} row(s) already exist in the target table")]
    ConflictPolicy { conflicts: usize },

    /// A single batch could not be written (recorded, not fatal)
    #[error("Batch write failed: {0}")]
    BatchWrite(String),

    /// Registry could not be persisted or loaded
    #[error("Registry error: {0}")]
    Registry(String),

    /// File, task or table not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A task is already processing this file
    #[error("Processing already in progress for file {0}")]
    AlreadyProcessing(String),

    /// Caller may not touch the requested target
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Request lacked a required parameter
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// Upload request carried no file
    #[error("No file was uploaded")]
    NoFile,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenient Result type using TabloadError
pub type Result<T> = std::result::Result<T, TabloadError>;
