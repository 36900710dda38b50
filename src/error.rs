//! Error types for Framepipe.

use thiserror::Error;

/// Result type alias using Framepipe's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Framepipe operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Buffer allocation failed.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid configuration (dimensions, formats, sink set).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation attempted in the wrong pipeline state.
    #[error("invalid pipeline state: expected {expected}, was {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: &'static str,
        /// State the pipeline was actually in.
        actual: &'static str,
    },

    /// Crop/scale (blit) operation failed.
    #[error("blit failed: {0}")]
    Blit(String),

    /// JPEG encode failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Frame processing failed inside a unit.
    #[error("processing failed in unit '{unit}': {reason}")]
    Processing {
        /// Name of the unit that failed.
        unit: String,
        /// What went wrong.
        reason: String,
    },

    /// Protocol violation (out-of-order ids, double release, duplicate
    /// submission).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A message channel to a worker was closed.
    #[error("worker channel closed: {0}")]
    ChannelClosed(String),
}
