use crate::{
    checkpoint::{Checkpoint, KeyframeRecord},
    frame::{Frame, FrameMap, FrameRecord},
    map::{SplatMap, SplatPoint},
    render::{RenderOutput, Renderer},
    settings::{DensifySettings, MappingSettings, OptimizationParams, SlamSettings},
    trajectory::Trajectory,
    ConvergenceStage, ConvergenceWarning, Result, SlamError, StorageError,
};
use average::{Estimate, Mean};
use log::*;
use splat_core::{
    nalgebra::{Point2, Vector3},
    CameraModel, CameraPoint, CameraToWorld, Pose, Projective,
};
use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
};

/// A frame retained to constrain global optimization.
#[derive(Clone, Debug)]
pub struct Keyframe {
    pub frame_id: u64,
    pub timestamp: f64,
    pub pose: CameraToWorld,
    pub frame_map: FrameMap,
}

impl Keyframe {
    pub fn record(&self) -> KeyframeRecord {
        KeyframeRecord {
            frame_id: self.frame_id,
            timestamp: self.timestamp,
            pose: self.pose,
        }
    }
}

/// A recently integrated frame that local optimization still revisits.
#[derive(Clone, Debug)]
pub(crate) struct WindowFrame {
    pub frame_id: u64,
    pub pose: CameraToWorld,
    pub frame_map: FrameMap,
}

/// What integrating one frame did to the map.
#[derive(Clone, Debug, PartialEq)]
pub struct MappingReport {
    pub frame_id: u64,
    /// New unstable points.
    pub allocated: usize,
    /// Unstable points removed as floaters.
    pub removed: usize,
    /// Unstable points promoted to stable.
    pub promoted: usize,
    pub keyframe: bool,
    /// Fraction of valid observed grid pixels the map did not cover before integration.
    pub coverage_gap: f64,
    /// Mean absolute depth residual in meters of the points associated with the frame.
    pub residual: f64,
    pub warning: Option<ConvergenceWarning>,
}

/// How a point relates to the observation of one frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Association {
    /// The point lies on the observed surface at pixel `ix`.
    Surface {
        ix: usize,
        camera: Vector3<f64>,
        depth: f64,
    },
    /// The point floats in front of the observed surface.
    Floater,
    /// The point is outside the view, behind the observed surface, or on an invalid pixel.
    Unseen,
}

pub(crate) fn associate(
    point: &SplatPoint,
    pose: CameraToWorld,
    frame_map: &FrameMap,
    params: &OptimizationParams,
) -> Association {
    let camera_point = pose.inverse().transform(point.world_point());
    let camera = match camera_point.point() {
        Some(p) if p.z > 0.0 => p.coords,
        _ => return Association::Unseen,
    };
    let ix = match frame_map.lookup(camera_point) {
        Some(ix) => ix,
        None => return Association::Unseen,
    };
    let depth = frame_map.depth[ix];
    let difference = camera.z - depth;
    if difference.abs() <= params.association_threshold {
        Association::Surface { ix, camera, depth }
    } else if difference < -params.floater_margin {
        Association::Floater
    } else {
        Association::Unseen
    }
}

/// Moves a point towards the surface a frame observed, along the frame's viewing ray, and
/// blends in the observed color and normal.
///
/// Returns the absolute depth residual before the update if the point was associated.
pub(crate) fn refine(
    point: &mut SplatPoint,
    pose: CameraToWorld,
    frame_map: &FrameMap,
    params: &OptimizationParams,
) -> Option<f64> {
    let (ix, camera, depth) = match associate(point, pose, frame_map, params) {
        Association::Surface { ix, camera, depth } => (ix, camera, depth),
        _ => return None,
    };
    let rate = params.learning_rate;
    let target = camera * (depth / camera.z);
    let moved = camera + (target - camera) * rate;
    let position = pose.transform(CameraPoint::from_point(moved.into())).point()?;
    point.position = position;
    point.color += (frame_map.colors[ix] - point.color) * rate;
    let observed_normal = pose.0.rotation * frame_map.normals[ix];
    if observed_normal.norm_squared() > 0.5 {
        point.normal = (point.normal + (observed_normal - point.normal) * rate)
            .try_normalize(1e-12)
            .unwrap_or(observed_normal);
    }
    point.opacity += (1.0 - point.opacity) * rate;
    Some((camera.z - depth).abs())
}

/// Whether an unstable point has been observed often, consistently and from different
/// enough directions to be frozen.
pub(crate) fn is_stable(point: &SplatPoint, settings: &MappingSettings) -> bool {
    point.observations >= settings.stable_min_observations
        && point.residual <= settings.stable_max_residual
        && point.max_incidence_cosine_distance() > settings.stable_min_incidence_cosine_distance
}

/// Owns the map and integrates tracked frames into it.
pub struct Mapper<R> {
    pub(crate) settings: MappingSettings,
    pub(crate) save_path: PathBuf,
    pub(crate) renderer: R,
    pub(crate) map: SplatMap,
    pub(crate) keyframes: Vec<Keyframe>,
    pub(crate) trajectory: Trajectory,
    pub(crate) window: VecDeque<WindowFrame>,
    /// The number of frames integrated so far.
    pub time: u64,
    last_received: Option<u64>,
    optimize_frames_ids: Vec<u64>,
    frames: BTreeMap<u64, FrameRecord>,
    pub(crate) warnings: Vec<ConvergenceWarning>,
}

impl<R: Renderer> Mapper<R> {
    pub fn new(settings: &SlamSettings, renderer: R) -> Self {
        Self {
            settings: settings.mapping,
            save_path: settings.save_path.clone(),
            renderer,
            map: SplatMap::new(),
            keyframes: vec![],
            trajectory: Trajectory::new(),
            window: VecDeque::new(),
            time: 0,
            last_received: None,
            optimize_frames_ids: vec![],
            frames: BTreeMap::new(),
            warnings: vec![],
        }
    }

    /// Creates the directories a run writes into.
    pub fn create_workspace(&self) -> std::result::Result<(), StorageError> {
        for dir in ["save_model", "eval_render", "renders"] {
            let path = self.save_path.join(dir);
            std::fs::create_dir_all(&path).map_err(StorageError::io(&path))?;
        }
        Ok(())
    }

    /// Registers a frame before its pose is merged. Frame ids must strictly increase.
    pub fn receive(&mut self, frame: &Frame) -> Result<()> {
        if let Some(last) = self.last_received {
            if frame.id <= last {
                return Err(SlamError::OutOfOrderFrame {
                    frame_id: frame.id,
                    last,
                });
            }
        }
        self.last_received = Some(frame.id);
        self.trajectory.insert(frame.id, frame.timestamp, frame.pose);
        self.frames.insert(frame.id, frame.record());
        Ok(())
    }

    /// Merges tracked poses into the trajectory.
    ///
    /// Every id is checked before anything is written, so an unknown id leaves the trajectory
    /// untouched. Writing the same poses again changes nothing.
    pub fn update_poses(&mut self, poses: &BTreeMap<u64, CameraToWorld>) -> Result<()> {
        if let Some(&unknown) = poses.keys().find(|&&id| !self.trajectory.contains(id)) {
            return Err(SlamError::UnknownFrame(unknown));
        }
        for (&frame_id, &pose) in poses {
            self.trajectory.set_pose(frame_id, pose);
            if let Some(record) = self.frames.get_mut(&frame_id) {
                record.pose = pose;
            }
            for keyframe in self.keyframes.iter_mut().filter(|k| k.frame_id == frame_id) {
                keyframe.pose = pose;
            }
            for recent in self.window.iter_mut().filter(|w| w.frame_id == frame_id) {
                recent.pose = pose;
            }
        }
        Ok(())
    }

    /// Integrates a tracked frame into the map at its pose in the trajectory.
    pub fn mapping(
        &mut self,
        frame: &mut Frame,
        frame_map: &FrameMap,
        frame_id: u64,
        params: &OptimizationParams,
    ) -> Result<MappingReport> {
        if frame.id != frame_id || frame_map.frame_id != frame_id {
            return Err(SlamError::InvalidFrame {
                frame_id,
                reason: format!(
                    "frame {} and working set {} do not match",
                    frame.id, frame_map.frame_id
                ),
            });
        }
        let pose = self
            .trajectory
            .pose(frame_id)
            .ok_or(SlamError::UnknownFrame(frame_id))?;
        frame.pose = pose;

        let render = self.renderer.render(
            &self.map,
            pose,
            &frame_map.intrinsics,
            (frame_map.width, frame_map.height),
        );

        let (allocated, coverage_gap) = self.allocate(frame_map, &render, pose, params);

        for _ in 0..params.mapping_iterations {
            let targets = self
                .window
                .iter()
                .map(|w| (w.pose, &w.frame_map))
                .chain(std::iter::once((pose, frame_map)));
            for (target_pose, target) in targets {
                for (_, point) in self.map.unstable_mut() {
                    refine(point, target_pose, target, params);
                }
            }
        }

        let mut residual = Mean::new();
        let camera_center = pose.center();
        let max_directions = self.settings.max_viewing_directions;
        for (_, point) in self.map.unstable_mut() {
            match associate(point, pose, frame_map, params) {
                Association::Surface { camera, depth, .. } => {
                    let r = (camera.z - depth).abs();
                    residual.add(r);
                    point.observe(frame_id, camera_center, r, max_directions);
                }
                Association::Floater => point.opacity *= params.opacity_decay,
                Association::Unseen => {}
            }
        }
        let min_opacity = params.min_opacity;
        let removed = self.map.retain_unstable(|p| p.opacity >= min_opacity && p.is_finite());

        let settings = self.settings;
        let ready: Vec<_> = self
            .map
            .unstable()
            .filter(|(_, p)| is_stable(p, &settings))
            .map(|(key, _)| key)
            .collect();
        for &key in &ready {
            self.map.promote(key);
        }

        let keyframe = match self.keyframes.last() {
            None => true,
            Some(last) => {
                pose.translation_distance(last.pose) > self.settings.keyframe_translation
                    || pose.rotation_angle(last.pose) > self.settings.keyframe_rotation
                    || coverage_gap > self.settings.keyframe_coverage_gap
            }
        };
        if keyframe {
            info!("frame {} is keyframe {}", frame_id, self.keyframes.len());
            self.keyframes.push(Keyframe {
                frame_id,
                timestamp: frame.timestamp,
                pose,
                frame_map: frame_map.clone(),
            });
        }

        self.window.push_back(WindowFrame {
            frame_id,
            pose,
            frame_map: frame_map.clone(),
        });
        while self.window.len() > self.settings.window {
            self.window.pop_front();
        }
        self.time += 1;
        self.optimize_frames_ids.push(frame_id);

        let residual = if residual.is_empty() {
            0.0
        } else {
            residual.mean()
        };
        let warning = if residual > params.mapping_convergence_residual {
            let warning = ConvergenceWarning {
                stage: ConvergenceStage::Mapping,
                frame_id,
                residual,
            };
            warn!(
                "local optimization of frame {} left a mean depth residual of {}",
                frame_id, residual
            );
            self.warnings.push(warning);
            Some(warning)
        } else {
            None
        };
        info!(
            "mapped frame {}: {} new, {} removed, {} promoted, {} stable, {} unstable",
            frame_id,
            allocated,
            removed,
            ready.len(),
            self.map.stable_num(),
            self.map.unstable_num()
        );
        Ok(MappingReport {
            frame_id,
            allocated,
            removed,
            promoted: ready.len(),
            keyframe,
            coverage_gap,
            residual,
            warning,
        })
    }

    /// Allocates unstable points where the map does not explain the observation.
    ///
    /// Returns the number of new points and the coverage gap of the render.
    fn allocate(
        &mut self,
        frame_map: &FrameMap,
        render: &RenderOutput,
        pose: CameraToWorld,
        params: &OptimizationParams,
    ) -> (usize, f64) {
        let stride = params.point_stride.max(1);
        let mut valid = 0usize;
        let mut uncovered = 0usize;
        let mut allocated = 0usize;
        for (u, v) in frame_map.grid(stride) {
            let ix = v * frame_map.width + u;
            let depth = frame_map.depth[ix];
            if depth <= 0.0 {
                continue;
            }
            valid += 1;
            let rendered = render.depth[ix];
            if rendered <= 0.0 {
                uncovered += 1;
            } else if (rendered - depth).abs() <= params.novel_depth_threshold {
                continue;
            }
            let camera = frame_map
                .intrinsics
                .backproject(Point2::new(u as f64, v as f64), depth);
            let position = match pose.transform(camera).point() {
                Some(position) => position,
                None => continue,
            };
            let normal = if frame_map.normals[ix].norm_squared() > 0.5 {
                frame_map.normals[ix]
            } else {
                -camera.bearing().into_inner()
            };
            let scale =
                params.point_scale_factor * stride as f64 * depth / frame_map.intrinsics.focals.x;
            self.map.insert_unstable(SplatPoint::new(
                position,
                pose.0.rotation * normal,
                frame_map.colors[ix],
                params.initial_opacity,
                scale,
                frame_map.frame_id,
            ));
            allocated += 1;
        }
        let gap = if valid == 0 {
            0.0
        } else {
            uncovered as f64 / valid as f64
        };
        (allocated, gap)
    }

    /// Renders the map at the frame's pose in the trajectory without changing anything.
    pub fn get_render_output(&self, frame: &Frame) -> RenderOutput {
        let pose = self.trajectory.pose(frame.id).unwrap_or(frame.pose);
        let (width, height) = frame.dimensions();
        self.renderer
            .render(&self.map, pose, &frame.intrinsics, (width, height))
    }

    /// Writes a checkpoint of the map under `<save_path>/save_model`.
    ///
    /// With `save_data` the metadata of every received frame is included.
    pub fn save_model(&self, save_data: bool) -> std::result::Result<PathBuf, StorageError> {
        self.checkpoint(save_data)
            .save(self.save_path.join("save_model"))
    }

    pub fn checkpoint(&self, save_data: bool) -> Checkpoint {
        Checkpoint {
            time: self.time,
            stable: self.map.stable().map(|(_, p)| p.clone()).collect(),
            unstable: self.map.unstable().map(|(_, p)| p.clone()).collect(),
            keyframes: self.keyframes.iter().map(Keyframe::record).collect(),
            trajectory: self.trajectory.entries(),
            frames: if save_data {
                Some(self.frames.values().cloned().collect())
            } else {
                None
            },
        }
    }

    /// A densified copy of the stable points for export. The map is left untouched.
    pub fn densify(&self, settings: &DensifySettings) -> Vec<SplatPoint> {
        self.map.densified_stable(settings)
    }

    pub fn get_stable_num(&self) -> usize {
        self.map.stable_num()
    }

    pub fn get_unstable_num(&self) -> usize {
        self.map.unstable_num()
    }

    pub fn map(&self) -> &SplatMap {
        &self.map
    }

    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Ids of the integrated frames in integration order.
    pub fn optimized_frame_ids(&self) -> &[u64] {
        &self.optimize_frames_ids
    }

    pub fn warnings(&self) -> &[ConvergenceWarning] {
        &self.warnings
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// Approximate number of bytes retained by the map, the window and the keyframes.
    pub fn memory_estimate(&self) -> usize {
        self.map.memory_bytes()
            + self
                .window
                .iter()
                .map(|w| w.frame_map.memory_bytes())
                .sum::<usize>()
            + self
                .keyframes
                .iter()
                .map(|k| k.frame_map.memory_bytes())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{ColorImage, DepthImage},
        render::PointSplatRenderer,
    };
    use image::{Luma, Rgb};
    use splat_core::{
        nalgebra::{Point3, Rotation3},
        CameraIntrinsics,
    };

    fn frame(id: u64) -> Frame {
        frame_with_depth(id, DepthImage::from_pixel(24, 18, Luma([2.0])))
    }

    fn frame_with_depth(id: u64, depth: DepthImage) -> Frame {
        let color = ColorImage::from_fn(24, 18, |u, v| Rgb([u as f32 / 24.0, v as f32 / 18.0, 0.5]));
        let intrinsics = CameraIntrinsics::identity()
            .focal(25.0)
            .principal_point(Point2::new(11.5, 8.5));
        Frame::new(id, id as f64, color, depth, intrinsics)
    }

    fn mapper(dir: &Path) -> Mapper<PointSplatRenderer> {
        mapper_with(dir, MappingSettings::default())
    }

    fn mapper_with(dir: &Path, mapping: MappingSettings) -> Mapper<PointSplatRenderer> {
        let settings = SlamSettings {
            save_path: dir.to_owned(),
            mapping,
            ..Default::default()
        };
        Mapper::new(&settings, PointSplatRenderer::default())
    }

    fn stability_settings() -> MappingSettings {
        MappingSettings {
            stable_min_observations: 3,
            stable_max_residual: 0.02,
            stable_min_incidence_cosine_distance: 0.01,
            ..Default::default()
        }
    }

    /// A point seen `observations` times from two directions `angle` radians apart.
    fn observed_point(observations: usize, residual: f64, angle: f64) -> SplatPoint {
        let mut point = SplatPoint::new(
            Point3::origin(),
            -Vector3::z(),
            Vector3::zeros(),
            1.0,
            0.01,
            0,
        );
        point.observations = observations;
        point.residual = residual;
        point.viewing_directions = vec![
            Vector3::z(),
            Rotation3::from_euler_angles(angle, 0.0, 0.0) * Vector3::z(),
        ];
        point
    }

    fn turned(angle: f64) -> CameraToWorld {
        CameraToWorld::from_parts(Vector3::zeros(), Rotation3::from_euler_angles(0.0, angle, 0.0))
    }

    fn integrate(mapper: &mut Mapper<PointSplatRenderer>, mut frame: Frame) -> MappingReport {
        let frame_map =
            FrameMap::from_frame(&frame, 0.1, 10.0, 4, frame.pose).unwrap();
        mapper.receive(&frame).unwrap();
        mapper
            .mapping(&mut frame, &frame_map, frame_map.frame_id, &OptimizationParams::default())
            .unwrap()
    }

    fn counters_hold<R: Renderer>(mapper: &Mapper<R>) -> bool {
        mapper.get_stable_num() + mapper.get_unstable_num()
            == mapper.map().allocated() - mapper.map().removed()
    }

    #[test]
    fn first_frame_fills_the_map_and_becomes_a_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        let report = integrate(&mut mapper, frame(0));
        // Every pixel of a 24 x 18 image on a stride 2 grid.
        assert_eq!(report.allocated, 12 * 9);
        assert!(report.keyframe);
        assert_eq!(report.coverage_gap, 1.0);
        assert_eq!(mapper.time, 1);
        assert_eq!(mapper.keyframes().len(), 1);
        assert!(counters_hold(&mapper));
    }

    #[test]
    fn repeated_view_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        integrate(&mut mapper, frame(0));
        let before = mapper.get_unstable_num();
        let report = integrate(&mut mapper, frame(1));
        assert_eq!(report.allocated, 0);
        assert!(!report.keyframe);
        assert!(report.residual < 1e-6);
        assert!(mapper.get_unstable_num() <= before);
        assert!(counters_hold(&mapper));
    }

    #[test]
    fn stability_needs_every_criterion() {
        let settings = stability_settings();
        // 1 - cos(0.15) is just above 0.01 and 1 - cos(0.13) just below.
        assert!(is_stable(&observed_point(3, 0.02, 0.15), &settings));
        assert!(is_stable(&observed_point(4, 0.019, 0.15), &settings));
        assert!(!is_stable(&observed_point(2, 0.0, 0.15), &settings));
        assert!(!is_stable(&observed_point(3, 0.0201, 0.15), &settings));
        assert!(!is_stable(&observed_point(3, 0.0, 0.13), &settings));
    }

    #[test]
    fn rotation_alone_makes_a_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        // Coverage can never exceed a gap of 1.
        let mut mapper = mapper_with(
            dir.path(),
            MappingSettings {
                keyframe_coverage_gap: 1.0,
                ..Default::default()
            },
        );
        assert!(integrate(&mut mapper, frame(0)).keyframe);
        assert!(!integrate(&mut mapper, frame(1).with_pose(turned(0.15))).keyframe);
        assert!(integrate(&mut mapper, frame(2).with_pose(turned(0.25))).keyframe);
        // Measured from the last keyframe, not from the first frame.
        assert!(!integrate(&mut mapper, frame(3).with_pose(turned(0.35))).keyframe);
        let ids: Vec<u64> = mapper.keyframes().iter().map(|k| k.frame_id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn newly_seen_ground_makes_a_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        // The first view only measures the left half of the wall.
        let half = DepthImage::from_fn(24, 18, |u, _| Luma([if u < 12 { 2.0 } else { 0.0 }]));
        integrate(&mut mapper, frame_with_depth(0, half));
        let report = integrate(&mut mapper, frame(1));
        assert!(report.coverage_gap > mapper.settings.keyframe_coverage_gap);
        assert!(report.allocated > 0);
        assert!(report.keyframe);
        assert_eq!(mapper.keyframes().len(), 2);
        assert!(counters_hold(&mapper));
    }

    #[test]
    fn frames_must_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        mapper.receive(&frame(3)).unwrap();
        assert!(matches!(
            mapper.receive(&frame(3)),
            Err(SlamError::OutOfOrderFrame { frame_id: 3, last: 3 })
        ));
        assert!(matches!(
            mapper.receive(&frame(1)),
            Err(SlamError::OutOfOrderFrame { .. })
        ));
    }

    #[test]
    fn poses_for_unknown_frames_are_rejected_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        mapper.receive(&frame(0)).unwrap();
        let moved = CameraToWorld::from_parts(Vector3::new(0.2, 0.0, 0.0), Rotation3::identity());
        let poses: BTreeMap<u64, CameraToWorld> = [(0, moved), (7, moved)].into_iter().collect();
        assert!(matches!(
            mapper.update_poses(&poses),
            Err(SlamError::UnknownFrame(7))
        ));
        assert_eq!(mapper.trajectory().pose(0), Some(CameraToWorld::identity()));
    }

    #[test]
    fn updating_poses_twice_is_the_same_as_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        mapper.receive(&frame(0)).unwrap();
        mapper.receive(&frame(1)).unwrap();
        let moved = CameraToWorld::from_parts(Vector3::new(0.2, 0.0, 0.0), Rotation3::identity());
        let poses: BTreeMap<u64, CameraToWorld> = [(1, moved)].into_iter().collect();
        mapper.update_poses(&poses).unwrap();
        let once = mapper.trajectory().clone();
        mapper.update_poses(&poses).unwrap();
        assert_eq!(mapper.trajectory(), &once);
    }

    #[test]
    fn unreceived_frame_cannot_be_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        let mut f = frame(2);
        let frame_map = FrameMap::from_frame(&f, 0.1, 10.0, 4, f.pose).unwrap();
        assert!(matches!(
            mapper.mapping(&mut f, &frame_map, 2, &OptimizationParams::default()),
            Err(SlamError::UnknownFrame(2))
        ));
    }

    #[test]
    fn floaters_fade_away() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        integrate(&mut mapper, frame(0));
        // A surfel a meter in front of the wall.
        mapper.map.insert_unstable(SplatPoint::new(
            splat_core::nalgebra::Point3::new(0.0, 0.0, 1.0),
            -Vector3::z(),
            Vector3::zeros(),
            0.5,
            0.001,
            0,
        ));
        let mut removed = 0;
        for id in 1..5 {
            removed += integrate(&mut mapper, frame(id)).removed;
        }
        assert_eq!(removed, 1);
        assert!(counters_hold(&mapper));
    }

    #[test]
    fn workspace_and_checkpoint_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = mapper(dir.path());
        mapper.create_workspace().unwrap();
        integrate(&mut mapper, frame(0));
        let path = mapper.save_model(true).unwrap();
        let checkpoint = Checkpoint::load(path).unwrap();
        assert_eq!(checkpoint.time, 1);
        assert_eq!(checkpoint.unstable.len(), mapper.get_unstable_num());
        assert_eq!(checkpoint.frames.map(|f| f.len()), Some(1));
        for dir_name in ["save_model", "eval_render", "renders"] {
            assert!(dir.path().join(dir_name).is_dir());
        }
    }
}
