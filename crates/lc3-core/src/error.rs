//! Error handling for the codec library
//!
//! Errors split into two families the caller can tell apart: configuration
//! errors raised when a session or frame parameter is out of range, and
//! bitstream errors raised by the decoder on malformed payloads. Internal
//! invariant violations are bugs and panic instead of returning an error.

#![allow(missing_docs)]

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, Lc3Error>;

/// Comprehensive error type for codec operations
#[derive(Error, Debug)]
pub enum Lc3Error {
    /// Invalid codec configuration
    #[error("Invalid codec configuration: {details}")]
    InvalidConfig { details: String },

    /// Invalid sample rate
    #[error("Invalid sample rate: {rate}Hz (supported: {supported:?})")]
    InvalidSampleRate { rate: u32, supported: Vec<u32> },

    /// Invalid frame duration
    #[error("Invalid frame duration: {us}us")]
    InvalidFrameDuration { us: u32 },

    /// Invalid channel count
    #[error("Invalid channel count: {channels} (supported: 1-{max})")]
    InvalidChannelCount { channels: usize, max: usize },

    /// Invalid PCM frame size
    #[error("Invalid frame size: expected {expected} samples, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    /// Frame byte budget out of range
    #[error("Invalid frame bytes: {nbytes} (range: {min}-{max})")]
    InvalidFrameBytes { nbytes: usize, min: usize, max: usize },

    /// Output buffer too small for operation
    #[error("Buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    /// Malformed compressed payload
    #[error("Invalid bitstream: {details}")]
    InvalidBitstream { details: String },
}

impl Lc3Error {
    /// Create a new invalid configuration error
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }

    /// Create a new invalid bitstream error
    pub fn invalid_bitstream(details: impl Into<String>) -> Self {
        Self::InvalidBitstream {
            details: details.into(),
        }
    }

    /// True for errors raised by malformed payload data rather than by
    /// session or frame parameters. A decoder hitting one of these should
    /// conceal the frame and keep running.
    pub fn is_bitstream(&self) -> bool {
        matches!(self, Self::InvalidBitstream { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Lc3Error::InvalidFrameBytes {
            nbytes: 10,
            min: 20,
            max: 400,
        };
        assert_eq!(err.to_string(), "Invalid frame bytes: 10 (range: 20-400)");
        assert!(!err.is_bitstream());
    }

    #[test]
    fn test_bitstream_classification() {
        assert!(Lc3Error::invalid_bitstream("truncated frame").is_bitstream());
        assert!(!Lc3Error::invalid_config("bad rate").is_bitstream());
    }
}
