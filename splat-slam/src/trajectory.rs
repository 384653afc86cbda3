use serde::{Deserialize, Serialize};
use splat_core::CameraToWorld;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub frame_id: u64,
    pub timestamp: f64,
    pub pose: CameraToWorld,
}

/// Camera poses keyed by frame id, always iterated in increasing id order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trajectory {
    entries: BTreeMap<u64, TrajectoryEntry>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = TrajectoryEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.frame_id, e)).collect(),
        }
    }

    /// Adds or replaces the entry of a frame.
    pub fn insert(&mut self, frame_id: u64, timestamp: f64, pose: CameraToWorld) {
        self.entries.insert(
            frame_id,
            TrajectoryEntry {
                frame_id,
                timestamp,
                pose,
            },
        );
    }

    /// Replaces the pose of a known frame. Returns false if the frame is unknown.
    pub fn set_pose(&mut self, frame_id: u64, pose: CameraToWorld) -> bool {
        match self.entries.get_mut(&frame_id) {
            Some(entry) => {
                entry.pose = pose;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, frame_id: u64) -> bool {
        self.entries.contains_key(&frame_id)
    }

    pub fn pose(&self, frame_id: u64) -> Option<CameraToWorld> {
        self.entries.get(&frame_id).map(|e| e.pose)
    }

    pub fn last(&self) -> Option<&TrajectoryEntry> {
        self.entries.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TrajectoryEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrajectoryEntry> {
        self.entries.values_mut()
    }

    pub fn entries(&self) -> Vec<TrajectoryEntry> {
        self.entries.values().copied().collect()
    }
}
