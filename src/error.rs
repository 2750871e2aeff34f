//! Error types for the paired-audio pipeline.

use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort index construction or an example access.
///
/// Spectrogram extraction failures are not represented here: they end up as
/// [`crate::transform::Spectrogram::Absent`] and are filtered by the collator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration (mismatched list lengths, zero crop length, ...).
    #[error("config: {0}")]
    Config(String),

    /// A pair was recorded at a different rate than the configured one.
    #[error(
        "invalid sample rate: content = {content} and timbre = {timbre} while sample rate in params is {expected}"
    )]
    SampleRate { content: u32, timbre: u32, expected: u32 },

    /// The file could not be decoded.
    #[error("decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    /// Stacking survivors into a batch failed.
    #[error("shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Bad glob pattern.
    #[error("glob: {0}")]
    Pattern(#[from] glob::PatternError),

    /// Unreadable directory entry while scanning.
    #[error("glob: {0}")]
    Glob(#[from] glob::GlobError),

    /// Worker pool construction failed.
    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
