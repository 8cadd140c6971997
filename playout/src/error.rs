//! Error types for playout
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for playout
#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input, checked synchronously with no side effects
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Allocation failure during session init
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Audio backend errors surfaced verbatim
    #[error("Audio backend error: {0}")]
    Backend(String),

    /// The playback device disappeared or was never available
    #[error("Audio device not initialized: {0}")]
    DeviceNotInitialized(String),

    /// Device acquisition conflict
    #[error("Audio device already initialized: {0}")]
    DeviceAlreadyInitialized(String),

    /// File I/O errors from the WAV mirror sink
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation; indicates a bug if observed
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Convenience Result type using playout Error
pub type Result<T> = std::result::Result<T, Error>;
