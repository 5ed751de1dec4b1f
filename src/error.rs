use std::path::PathBuf;
use thiserror::Error;

/// Build, watch, and deploy error types
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{stage} failed to compile {path}: {message}")]
    Compile {
        stage: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("Failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory: {path}")]
    CreateDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid glob pattern: {pattern}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Failed to compress image {path}: {message}")]
    Image { path: PathBuf, message: String },

    #[error("Failed to write archive {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("Failed to transfer {path}: {message}")]
    Transfer { path: PathBuf, message: String },

    #[error("Watch mode failed: {message}")]
    Watch { message: String },

    #[error("Build cancelled")]
    Cancelled,
}

impl BuildError {
    pub fn config(message: impl Into<String>) -> Self {
        BuildError::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }

    /// Configuration errors exit with a distinct status code
    pub fn is_config(&self) -> bool {
        matches!(self, BuildError::Config { .. })
    }
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;
