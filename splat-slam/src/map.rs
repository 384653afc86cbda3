use crate::settings::DensifySettings;
use itertools::Itertools;
use log::*;
use rstar::{primitives::PointWithData, RTree};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, DenseSlotMap};
use splat_core::{
    nalgebra::{Point3, Vector3},
    Projective, WorldPoint,
};
use std::collections::HashSet;

new_key_type! {
    pub struct UnstableKey;
    pub struct StableKey;
}

/// A surfel: a small oriented disk in world space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplatPoint {
    pub position: Point3<f64>,
    /// Unit normal in world space.
    pub normal: Vector3<f64>,
    pub color: Vector3<f64>,
    pub opacity: f64,
    /// Disk radius in meters.
    pub scale: f64,
    /// Number of frames that associated an observation with this point.
    pub observations: usize,
    /// Running mean of the absolute depth residual in meters.
    pub residual: f64,
    /// The id of the last frame that updated the point.
    pub last_frame: u64,
    /// Unit directions from the point towards the cameras that observed it.
    pub viewing_directions: Vec<Vector3<f64>>,
}

impl SplatPoint {
    pub fn new(
        position: Point3<f64>,
        normal: Vector3<f64>,
        color: Vector3<f64>,
        opacity: f64,
        scale: f64,
        frame_id: u64,
    ) -> Self {
        Self {
            position,
            normal,
            color,
            opacity,
            scale,
            observations: 0,
            residual: 0.0,
            last_frame: frame_id,
            viewing_directions: vec![],
        }
    }

    pub fn world_point(&self) -> WorldPoint {
        WorldPoint::from_point(self.position)
    }

    /// Records an observation from a camera centered at `camera_center`.
    ///
    /// Only the latest `max_directions` viewing directions are remembered.
    pub fn observe(
        &mut self,
        frame_id: u64,
        camera_center: Vector3<f64>,
        residual: f64,
        max_directions: usize,
    ) {
        self.residual = (self.residual * self.observations as f64 + residual.abs())
            / (self.observations + 1) as f64;
        self.observations += 1;
        self.last_frame = frame_id;
        let direction = camera_center - self.position.coords;
        if let Some(direction) = direction.try_normalize(1e-12) {
            self.viewing_directions.push(direction);
            if self.viewing_directions.len() > max_directions.max(2) {
                let excess = self.viewing_directions.len() - max_directions.max(2);
                self.viewing_directions.drain(..excess);
            }
        }
    }

    /// The largest cosine distance between any two remembered viewing directions.
    pub fn max_incidence_cosine_distance(&self) -> f64 {
        self.viewing_directions
            .iter()
            .tuple_combinations()
            .map(|(a, b)| 1.0 - a.dot(b))
            .fold(0.0, f64::max)
    }

    /// Whether every value of the point is finite.
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|n| n.is_finite())
            && self.normal.iter().all(|n| n.is_finite())
            && self.color.iter().all(|n| n.is_finite())
            && self.opacity.is_finite()
            && self.scale.is_finite()
    }
}

/// The two disjoint point populations of the map.
///
/// Points enter as unstable and may only move to stable. The counters always satisfy
/// `stable_num() + unstable_num() == allocated() - removed()`.
#[derive(Clone, Debug, Default)]
pub struct SplatMap {
    unstable: DenseSlotMap<UnstableKey, SplatPoint>,
    stable: DenseSlotMap<StableKey, SplatPoint>,
    allocated: usize,
    removed: usize,
}

impl SplatMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a map from saved populations. Every point counts as allocated.
    pub fn from_points(stable: Vec<SplatPoint>, unstable: Vec<SplatPoint>) -> Self {
        let mut map = Self::new();
        for point in stable {
            map.stable.insert(point);
        }
        for point in unstable {
            map.unstable.insert(point);
        }
        map.allocated = map.stable.len() + map.unstable.len();
        map
    }

    pub fn insert_unstable(&mut self, point: SplatPoint) -> UnstableKey {
        self.allocated += 1;
        self.unstable.insert(point)
    }

    pub fn remove_unstable(&mut self, key: UnstableKey) -> Option<SplatPoint> {
        let point = self.unstable.remove(key)?;
        self.removed += 1;
        Some(point)
    }

    /// Removes every unstable point for which `keep` returns false.
    ///
    /// Returns the number of removed points.
    pub fn retain_unstable(&mut self, mut keep: impl FnMut(&SplatPoint) -> bool) -> usize {
        let before = self.unstable.len();
        self.unstable.retain(|_, point| keep(point));
        let removed = before - self.unstable.len();
        self.removed += removed;
        removed
    }

    /// Moves an unstable point into the stable population.
    pub fn promote(&mut self, key: UnstableKey) -> Option<StableKey> {
        let point = self.unstable.remove(key)?;
        Some(self.stable.insert(point))
    }

    pub fn stable_num(&self) -> usize {
        self.stable.len()
    }

    pub fn unstable_num(&self) -> usize {
        self.unstable.len()
    }

    /// Total points ever inserted.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Total points explicitly removed.
    pub fn removed(&self) -> usize {
        self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.stable.is_empty() && self.unstable.is_empty()
    }

    pub fn unstable(&self) -> impl Iterator<Item = (UnstableKey, &SplatPoint)> {
        self.unstable.iter()
    }

    pub fn unstable_mut(&mut self) -> impl Iterator<Item = (UnstableKey, &mut SplatPoint)> {
        self.unstable.iter_mut()
    }

    pub fn stable(&self) -> impl Iterator<Item = (StableKey, &SplatPoint)> {
        self.stable.iter()
    }

    /// Every point of both populations, stable first.
    pub fn points(&self) -> impl Iterator<Item = &SplatPoint> {
        self.stable.values().chain(self.unstable.values())
    }

    /// Every point of both populations, stable first.
    pub fn points_mut(&mut self) -> impl Iterator<Item = &mut SplatPoint> {
        self.stable.values_mut().chain(self.unstable.values_mut())
    }

    /// Approximate number of bytes retained by the points.
    pub fn memory_bytes(&self) -> usize {
        self.points()
            .map(|p| {
                std::mem::size_of::<SplatPoint>()
                    + p.viewing_directions.capacity() * std::mem::size_of::<Vector3<f64>>()
            })
            .sum()
    }

    /// A densified copy of the stable points, leaving the map untouched.
    pub fn densified_stable(&self, settings: &DensifySettings) -> Vec<SplatPoint> {
        densify(self.stable.values().cloned().collect(), settings)
    }
}

type IndexedPoint = PointWithData<usize, [f64; 3]>;

/// Fills gaps in a point cloud by adding the midpoint of overlapping neighbors.
///
/// Each pass looks at the `neighbors` nearest points of every point and creates at most
/// `samples_per_point` midpoints with neighbors whose disks touch. Every pair is considered once.
/// Returns the input followed by all created points.
pub fn densify(mut points: Vec<SplatPoint>, settings: &DensifySettings) -> Vec<SplatPoint> {
    for iteration in 0..settings.iterations {
        let indexed: Vec<IndexedPoint> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_finite())
            .map(|(ix, p)| IndexedPoint::new(ix, [p.position.x, p.position.y, p.position.z]))
            .collect();
        let index: RTree<IndexedPoint> = RTree::bulk_load(indexed.clone());

        let mut seen = HashSet::new();
        let mut created = vec![];
        for a in &indexed {
            let mut samples = 0;
            for b in index
                .nearest_neighbor_iter(a.position())
                .take(settings.neighbors + 1)
            {
                if samples >= settings.samples_per_point {
                    break;
                }
                if a.data == b.data {
                    continue;
                }
                let pair = (a.data.min(b.data), a.data.max(b.data));
                if !seen.insert(pair) {
                    continue;
                }
                let (pa, pb) = (&points[a.data], &points[b.data]);
                let distance = (pa.position - pb.position).norm();
                if distance > 2.0 * (pa.scale + pb.scale) {
                    continue;
                }
                created.push(midpoint(pa, pb));
                samples += 1;
            }
        }
        debug!(
            "densify pass {} created {} points from {}",
            iteration,
            created.len(),
            points.len()
        );
        if created.is_empty() {
            break;
        }
        points.extend(created);
    }
    points
}

fn midpoint(a: &SplatPoint, b: &SplatPoint) -> SplatPoint {
    let normal = (a.normal + b.normal)
        .try_normalize(1e-12)
        .unwrap_or(a.normal);
    SplatPoint {
        position: Point3::from((a.position.coords + b.position.coords) * 0.5),
        normal,
        color: (a.color + b.color) * 0.5,
        opacity: 0.5 * (a.opacity + b.opacity),
        scale: 0.5 * a.scale.min(b.scale),
        observations: a.observations.min(b.observations),
        residual: a.residual.max(b.residual),
        last_frame: a.last_frame.max(b.last_frame),
        viewing_directions: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point(x: f64) -> SplatPoint {
        SplatPoint::new(
            Point3::new(x, 0.0, 2.0),
            -Vector3::z(),
            Vector3::repeat(0.5),
            0.5,
            0.05,
            0,
        )
    }

    fn counters_hold(map: &SplatMap) -> bool {
        map.stable_num() + map.unstable_num() == map.allocated() - map.removed()
    }

    #[test]
    fn population_counters_stay_consistent() {
        let mut map = SplatMap::new();
        let keys: Vec<_> = (0..6).map(|i| map.insert_unstable(point(i as f64))).collect();
        assert!(counters_hold(&map));
        map.promote(keys[0]).unwrap();
        map.promote(keys[1]).unwrap();
        assert!(counters_hold(&map));
        map.remove_unstable(keys[2]).unwrap();
        assert!(map.remove_unstable(keys[0]).is_none());
        assert_eq!(map.retain_unstable(|p| p.position.x < 4.0), 2);
        assert!(counters_hold(&map));
        assert_eq!(map.stable_num(), 2);
        assert_eq!(map.unstable_num(), 1);
        assert_eq!(map.removed(), 3);
    }

    #[test]
    fn viewing_directions_are_bounded() {
        let mut p = point(0.0);
        for i in 0..10 {
            p.observe(i, Vector3::new(i as f64, 0.0, 0.0), 0.01, 4);
        }
        assert_eq!(p.observations, 10);
        assert_eq!(p.viewing_directions.len(), 4);
        assert_eq!(p.last_frame, 9);
        assert_relative_eq!(p.residual, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn single_direction_has_no_incidence() {
        let mut p = point(0.0);
        p.observe(0, Vector3::zeros(), 0.0, 4);
        p.observe(1, Vector3::zeros(), 0.0, 4);
        assert_relative_eq!(p.max_incidence_cosine_distance(), 0.0, epsilon = 1e-12);
        p.observe(2, Vector3::new(2.0, 0.0, 2.0), 0.0, 4);
        assert!(p.max_incidence_cosine_distance() > 0.1);
    }

    #[test]
    fn densify_fills_touching_gaps_only() {
        let settings = DensifySettings {
            iterations: 1,
            neighbors: 4,
            samples_per_point: 5,
        };
        // The first two disks touch, the third is far away.
        let cloud = densify(vec![point(0.0), point(0.15), point(5.0)], &settings);
        assert_eq!(cloud.len(), 4);
        assert_relative_eq!(cloud[3].position.x, 0.075, epsilon = 1e-12);
    }

    #[test]
    fn densified_copy_leaves_the_map_alone() {
        let mut map = SplatMap::new();
        let a = map.insert_unstable(point(0.0));
        let b = map.insert_unstable(point(0.1));
        map.promote(a);
        map.promote(b);
        let cloud = map.densified_stable(&DensifySettings::default());
        assert!(cloud.len() > 2);
        assert_eq!(map.stable_num(), 2);
        assert_eq!(map.allocated(), 2);
    }
}
