use crate::{
    frame::FrameRecord,
    map::{SplatMap, SplatPoint},
    trajectory::{Trajectory, TrajectoryEntry},
    writers::persist_atomic,
    StorageError,
};
use serde::{Deserialize, Serialize};
use splat_core::CameraToWorld;
use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyframeRecord {
    pub frame_id: u64,
    pub timestamp: f64,
    pub pose: CameraToWorld,
}

/// A point in time snapshot of the map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The number of frames integrated when the snapshot was taken.
    pub time: u64,
    pub stable: Vec<SplatPoint>,
    pub unstable: Vec<SplatPoint>,
    pub keyframes: Vec<KeyframeRecord>,
    pub trajectory: Vec<TrajectoryEntry>,
    /// The metadata of every received frame, if requested.
    pub frames: Option<Vec<FrameRecord>>,
}

impl Checkpoint {
    /// Writes `<dir>/checkpoint_<time>.bin` and `<dir>/latest.bin`, returning the former.
    ///
    /// Both files are replaced atomically, so a failed save leaves earlier checkpoints intact.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
        let dir = dir.as_ref();
        let path = dir.join(format!("checkpoint_{}.bin", self.time));
        self.write(&path)?;
        self.write(&dir.join("latest.bin"))?;
        Ok(path)
    }

    fn write(&self, path: &Path) -> Result<(), StorageError> {
        let bytes = bincode::serialize(self).map_err(|source| StorageError::Checkpoint {
            path: path.to_owned(),
            source,
        })?;
        persist_atomic(path, |file| {
            file.write_all(&bytes).map_err(StorageError::io(path))
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(StorageError::io(path))?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|source| {
            StorageError::Checkpoint {
                path: path.to_owned(),
                source,
            }
        })
    }

    pub fn map(&self) -> SplatMap {
        SplatMap::from_points(self.stable.clone(), self.unstable.clone())
    }

    pub fn trajectory(&self) -> Trajectory {
        Trajectory::from_entries(self.trajectory.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splat_core::{
        nalgebra::{Point3, Vector3},
        Pose,
    };

    fn checkpoint(time: u64) -> Checkpoint {
        let point = SplatPoint::new(
            Point3::new(0.5, -0.25, 2.0),
            -Vector3::z(),
            Vector3::new(0.1, 0.2, 0.3),
            0.5,
            0.01,
            3,
        );
        Checkpoint {
            time,
            stable: vec![point.clone()],
            unstable: vec![point.clone(), point],
            keyframes: vec![KeyframeRecord {
                frame_id: 0,
                timestamp: 0.5,
                pose: CameraToWorld::identity(),
            }],
            trajectory: vec![TrajectoryEntry {
                frame_id: 0,
                timestamp: 0.5,
                pose: CameraToWorld::identity(),
            }],
            frames: None,
        }
    }

    #[test]
    fn saved_checkpoint_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let saved = checkpoint(10);
        let path = saved.save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("checkpoint_10.bin"));
        let loaded = Checkpoint::load(dir.path().join("latest.bin")).unwrap();
        assert_eq!(loaded, saved);
        let map = loaded.map();
        assert_eq!(map.stable_num(), 1);
        assert_eq!(map.unstable_num(), 2);
        assert_eq!(loaded.trajectory().len(), 1);
    }

    #[test]
    fn latest_follows_the_newest_save() {
        let dir = tempfile::tempdir().unwrap();
        checkpoint(1).save(dir.path()).unwrap();
        checkpoint(2).save(dir.path()).unwrap();
        assert_eq!(Checkpoint::load(dir.path().join("latest.bin")).unwrap().time, 2);
        assert_eq!(
            Checkpoint::load(dir.path().join("checkpoint_1.bin")).unwrap().time,
            1
        );
    }
}
