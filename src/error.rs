//! Error types for colbert-embed

use thiserror::Error;

/// Result type alias for colbert-embed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while reading, encoding or writing embeddings
#[derive(Error, Debug)]
pub enum Error {
    /// Standard input was not a JSON array of strings
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Invalid run or encoder configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Checkpoint could not be resolved or loaded
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Tokenization or inference failed
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// Error raised by ONNX Runtime
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    /// Error with array dimensions
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Error reading/writing streams or files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing or writing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller handed us something we cannot encode.
    MalformedInput,
    /// Configuration, checkpoint loading or inference went wrong.
    ModelFailure,
    /// Reading stdin or writing stdout failed.
    Io,
}

impl Error {
    /// Classify this error as bad input, model failure or stream failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedInput(_) => ErrorKind::MalformedInput,
            Error::Io(_) | Error::Json(_) => ErrorKind::Io,
            Error::Config(_)
            | Error::ModelLoad(_)
            | Error::Encoding(_)
            | Error::Ort(_)
            | Error::Shape(_) => ErrorKind::ModelFailure,
        }
    }
}
