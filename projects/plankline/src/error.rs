// Error taxonomy for segmentation and classification dispatch.
//
// Per-frame and per-work-item errors are isolated by the callers; only
// `SegmentError::CorruptInput` escalates to a run-level failure.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SegmentError {
    /// The container could not be opened or produced no frames.
    #[error("corrupt input {path:?}: {reason}")]
    CorruptInput { path: PathBuf, reason: String },

    /// A crop image or statistics row could not be persisted.
    #[error("failed to write {path:?}: {reason}")]
    WriteFailure { path: PathBuf, reason: String },

    #[error("detector failed on frame {frame_index}: {source}")]
    Detection {
        frame_index: usize,
        #[source]
        source: opencv::Error,
    },

    #[error("frame {frame_index} processing panicked: {message}")]
    WorkerPanic { frame_index: usize, message: String },
}

impl SegmentError {
    pub fn write_failure(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::WriteFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier for {item} could not be started: {source}")]
    Spawn {
        item: String,
        #[source]
        source: std::io::Error,
    },

    #[error("classifier for {item} exited with {status}")]
    ExitStatus { item: String, status: String },

    #[error("classifier for {item} timed out after {secs}s")]
    Timeout { item: String, secs: u64 },

    #[error("no result artifact for {item} appeared in {dir:?}")]
    MissingResult { item: String, dir: PathBuf },

    #[error("failed to relocate result for {item} to {dest:?}: {source}")]
    Relocate {
        item: String,
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dispatch of {item} cancelled")]
    Cancelled { item: String },
}

impl ClassifyError {
    /// Invocation failures worth another attempt on the same slot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::ExitStatus { .. } | Self::Timeout { .. } | Self::MissingResult { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
