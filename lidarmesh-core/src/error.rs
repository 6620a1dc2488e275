//! Error types for lidarmesh

use thiserror::Error;

/// Main error type for lidarmesh operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A configuration parameter is outside its declared range
    #[error("Configuration error: {0}")]
    Config(String),

    /// The point cloud is empty or degenerate
    #[error("Input error: {0}")]
    Input(String),

    /// Normal estimation or the implicit surface solve failed
    #[error("Reconstruction error: {0}")]
    Reconstruction(String),

    /// A caller-configured memory or time budget was exceeded
    #[error("Resource limit exceeded: {0}")]
    Resource(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification of an [`Error`], useful for matching without
/// inspecting messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Input,
    Reconstruction,
    Resource,
    Cancelled,
}

impl Error {
    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Input(_) => ErrorKind::Input,
            Error::Reconstruction(_) => ErrorKind::Reconstruction,
            Error::Resource(_) => ErrorKind::Resource,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Result type alias for lidarmesh operations
pub type Result<T> = std::result::Result<T, Error>;
