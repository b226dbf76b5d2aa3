//! Error types for the comparator.
//!
//! Decoding problems are fatal for a run and surface as [`WavError`]. Engine
//! failures are per block and are normally absorbed by the driver's fallback
//! policy, so [`EngineError`] only reaches the caller through configuration.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for comparator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reading or writing PCM16 WAV containers.
#[derive(Error, Debug)]
pub enum WavError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file too small: {len} bytes, a WAV header needs at least {min}")]
    TooSmall { len: usize, min: usize },

    #[error("missing RIFF tag")]
    MissingRiffTag,

    #[error("missing WAVE tag")]
    MissingWaveTag,

    #[error("no `fmt ` chunk before the `data` chunk")]
    MissingFormatChunk,

    #[error("`fmt ` chunk too short: {size} bytes")]
    TruncatedFormatChunk { size: usize },

    #[error("expected integer PCM16, got format tag {format_tag} with {bits_per_sample} bits per sample")]
    UnsupportedFormat {
        format_tag: u16,
        bits_per_sample: u16,
    },

    #[error("expected a sample rate of {expected} Hz, got {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("expected {expected} channel, got {actual}")]
    ChannelCountMismatch { expected: u16, actual: u16 },

    #[error("no `data` chunk")]
    MissingDataChunk,

    #[error("signal too long for a WAV container: {bytes} data bytes")]
    TooLong { bytes: usize },
}

impl WavError {
    /// True for errors caused by the container's content rather than by I/O.
    pub fn is_format_error(&self) -> bool {
        !matches!(self, WavError::Io { .. })
    }
}

/// Errors reported by an echo canceller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("stage configuration is locked once processing has started")]
    ConfigurationLocked,

    #[error("adaptive filter diverged at block {block}")]
    Diverged { block: u64 },

    #[error("engine rejected block {block}: {reason}")]
    Rejected { block: u64, reason: String },
}

/// Top-level error for a comparator run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: WavError,
    },

    #[error(transparent)]
    Wav(#[from] WavError),

    #[error("engine configuration failed: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to write report: {0}")]
    Report(#[source] io::Error),
}
