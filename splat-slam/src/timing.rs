use crate::{writers::persist_atomic, StorageError};
use average::{Estimate, Mean};
use serde::{Deserialize, Serialize};
use std::{
    io::Write,
    path::Path,
    time::{Duration, Instant},
};

/// Records how long tracking and mapping take per frame.
#[derive(Debug)]
pub struct TimeRecorder {
    tracking: Mean,
    mapping: Mean,
    started: Instant,
}

/// Mean stage durations in seconds and overall throughput.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub frames: u64,
    pub mean_tracking_seconds: f64,
    pub mean_mapping_seconds: f64,
    pub fps: f64,
}

impl Default for TimeRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeRecorder {
    pub fn new() -> Self {
        Self {
            tracking: Mean::new(),
            mapping: Mean::new(),
            started: Instant::now(),
        }
    }

    pub fn record_tracking(&mut self, duration: Duration) {
        self.tracking.add(duration.as_secs_f64());
    }

    pub fn record_mapping(&mut self, duration: Duration) {
        self.mapping.add(duration.as_secs_f64());
    }

    /// Summarizes the recorded frames against the wall time since the recorder was created.
    pub fn timings(&self) -> Timings {
        self.timings_over(self.started.elapsed())
    }

    fn timings_over(&self, elapsed: Duration) -> Timings {
        let mean = |m: &Mean| if m.is_empty() { 0.0 } else { m.mean() };
        let frames = self.mapping.len();
        let seconds = elapsed.as_secs_f64();
        Timings {
            frames,
            mean_tracking_seconds: mean(&self.tracking),
            mean_mapping_seconds: mean(&self.mapping),
            fps: if seconds > 0.0 {
                frames as f64 / seconds
            } else {
                0.0
            },
        }
    }
}

impl Timings {
    /// Writes the timings as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self).map_err(|source| StorageError::Json {
            path: path.to_owned(),
            source,
        })?;
        persist_atomic(path, |file| file.write_all(&json).map_err(StorageError::io(path)))
    }
}
