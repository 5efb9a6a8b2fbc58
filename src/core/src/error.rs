use thiserror::Error;

/// Tarbox error types
#[derive(Error, Debug)]
pub enum TarboxError {
    /// Invalid flag value or flag combination
    #[error("{0}")]
    Validation(String),

    /// Standard output is attached to a terminal and no output file was given
    #[error("refusing to save to terminal. Use -o flag or redirect")]
    TerminalOutput,

    /// The stdout conduit could not be set up
    #[error("Failed to set up output pipe: {message}")]
    Conduit {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The export engine failed to write the archive
    #[error("{0}")]
    Export(String),

    /// Relaying archive bytes to standard output failed
    #[error("Failed to write archive to stdout: {0}")]
    Forward(String),

    /// Image is not present in the local store
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TarboxError {
    /// Build a conduit error wrapping an OS error.
    pub fn conduit(message: impl Into<String>, source: std::io::Error) -> Self {
        TarboxError::Conduit {
            message: format!("{}: {}", message.into(), source),
            source: Some(source),
        }
    }
}

impl From<serde_json::Error> for TarboxError {
    fn from(err: serde_json::Error) -> Self {
        TarboxError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for TarboxError {
    fn from(err: serde_yaml::Error) -> Self {
        TarboxError::Serialization(err.to_string())
    }
}

/// Result type alias for Tarbox operations
pub type Result<T> = std::result::Result<T, TarboxError>;
