use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SlamError>;

#[derive(Debug, Error)]
pub enum SlamError {
    /// The frame is missing required data or its data is malformed.
    #[error("frame {frame_id} is invalid: {reason}")]
    InvalidFrame { frame_id: u64, reason: String },
    /// A pose or operation referenced a frame that the mapper never received.
    #[error("frame {0} was never received by the mapper")]
    UnknownFrame(u64),
    /// Frames must be received in strictly increasing id order.
    #[error("frame {frame_id} received after frame {last}")]
    OutOfOrderFrame { frame_id: u64, last: u64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Global optimization produced an unusable result and was rolled back.
    #[error("global optimization diverged: {0}")]
    OptimizationDivergence(String),
    #[error("processing was cancelled before frame {frame_id}")]
    Cancelled { frame_id: u64 },
}

/// A failure to write or read one of the run's artifacts.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode or decode checkpoint {}: {source}", .path.display())]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("failed to write image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write trajectory archive {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: ndarray_npy::WriteNpzError,
    },
    #[error("failed to serialize {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to move finished file into place at {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
    #[error("malformed line {line} in {}", .path.display())]
    Parse { path: PathBuf, line: usize },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Which stage failed to reach its convergence threshold.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceStage {
    Tracking,
    Mapping,
}

/// A non-fatal record that an optimization kept its best result without converging.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceWarning {
    pub stage: ConvergenceStage,
    pub frame_id: u64,
    pub residual: f64,
}
