//! Error types for the voice bridge

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for audio handling
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),
}
