//! Error types for sarq_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using sarq_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building an archive.
///
/// Every failure is terminal for the call that raised it; the writer never
/// retries or skips internally. After any error the writer should be closed,
/// not resumed.
#[derive(Error, Debug)]
pub enum Error {
    /// The encoder could not be constructed.
    #[error("Encoder initialization failed: {reason}")]
    InitFailed { reason: String },

    /// The requested archive format was rejected.
    #[error("Format selection failed: {reason}")]
    SetFormatFailed { reason: String },

    /// Compression filter or block size configuration was rejected.
    #[error("Compression setup failed: {reason}")]
    SetCompressionFailed { reason: String },

    /// The output sink, or a queued source file, could not be opened.
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Header emission or a data write into the archive failed.
    #[error("Archive write failed: {reason}")]
    WriteFailed { reason: String },

    /// Metadata lookup on a source file failed at dequeue time.
    #[error("Failed to stat {path}: {source}")]
    StatFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A source file hit end-of-data before its recorded size was written.
    #[error("File changed while being archived: {path} yielded {transferred} of {expected} bytes")]
    FileChanged {
        path: PathBuf,
        expected: u64,
        transferred: u64,
    },
}

impl Error {
    /// Create an InitFailed error.
    pub fn init_failed(reason: impl Into<String>) -> Self {
        Error::InitFailed {
            reason: reason.into(),
        }
    }

    /// Create a SetFormatFailed error.
    pub fn set_format_failed(reason: impl Into<String>) -> Self {
        Error::SetFormatFailed {
            reason: reason.into(),
        }
    }

    /// Create a SetCompressionFailed error.
    pub fn set_compression_failed(reason: impl Into<String>) -> Self {
        Error::SetCompressionFailed {
            reason: reason.into(),
        }
    }

    /// Create an OpenFailed error.
    pub fn open_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::OpenFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a WriteFailed error.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Error::WriteFailed {
            reason: reason.into(),
        }
    }

    /// Create a StatFailed error.
    pub fn stat_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StatFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a FileChanged error.
    pub fn file_changed(path: impl Into<PathBuf>, expected: u64, transferred: u64) -> Self {
        Error::FileChanged {
            path: path.into(),
            expected,
            transferred,
        }
    }
}
