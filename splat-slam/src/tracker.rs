use crate::{
    frame::{Confidence, Frame, FrameMap},
    map::SplatMap,
    render::Renderer,
    settings::TrackingSettings,
    trajectory::Trajectory,
    writers::TumTrajectoryWriter,
    ConvergenceStage, ConvergenceWarning, OptimizationObserver, Result, SlamError, StorageError,
};
use argmin::core::{Executor, ObserverMode};
use average::Mean;
use log::*;
use splat_core::{
    nalgebra::{Vector3, Vector6},
    CameraToWorld, Pose, Se3TangentSpace,
};
use splat_optimize::{single_view_nelder_mead, AlignmentLoss, PoseAlignment};
use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
};

/// The outcome of tracking one frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrackingReport {
    pub frame_id: u64,
    pub pose: CameraToWorld,
    /// The mean alignment cost of the final pose.
    pub cost: f64,
    /// The number of render and align rounds that ran.
    pub rounds: usize,
    pub converged: bool,
    pub warning: Option<ConvergenceWarning>,
}

/// Residual statistics of an integrated frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrackingStatus {
    pub frame_id: u64,
    /// Mean absolute difference between predicted and observed depth in meters.
    pub depth_residual: f64,
    /// Mean cosine distance between predicted and observed normals.
    pub normal_distance: f64,
    /// Whether the depth residual spiked compared to the recent frames.
    pub spike: bool,
}

/// Estimates the pose of each frame against the map without modifying it.
pub struct Tracker<R> {
    settings: TrackingSettings,
    depth_range: (f64, f64),
    renderer: R,
    trajectory: Trajectory,
    new_poses: BTreeMap<u64, CameraToWorld>,
    status: VecDeque<TrackingStatus>,
    spike: bool,
    warnings: Vec<ConvergenceWarning>,
}

impl<R: Renderer> Tracker<R> {
    /// `depth_range` is the `(min_depth, max_depth)` outside of which observed depth is invalid.
    pub fn new(settings: TrackingSettings, depth_range: (f64, f64), renderer: R) -> Self {
        Self {
            settings,
            depth_range,
            renderer,
            trajectory: Trajectory::new(),
            new_poses: BTreeMap::new(),
            status: VecDeque::new(),
            spike: false,
            warnings: vec![],
        }
    }

    /// Validates a frame and derives its working set, including the initial pose guess.
    pub fn preprocess(&self, frame: &Frame, frame_id: u64) -> Result<FrameMap> {
        if frame.id != frame_id {
            return Err(SlamError::InvalidFrame {
                frame_id,
                reason: format!("frame carries id {}", frame.id),
            });
        }
        let (min_depth, max_depth) = self.depth_range;
        FrameMap::from_frame(
            frame,
            min_depth,
            max_depth,
            self.settings.stride,
            self.predict(frame.pose),
        )
    }

    /// The initial guess for the next frame.
    ///
    /// `supplied` is used for the first frame. Afterwards the last motion is extrapolated with
    /// damping, unless only one pose is known or the last frame was a residual spike.
    fn predict(&self, supplied: CameraToWorld) -> CameraToWorld {
        let mut recent = self.trajectory.iter().rev();
        match (recent.next(), recent.next()) {
            (None, _) => supplied,
            (Some(last), _) if self.spike => last.pose,
            (Some(last), None) => last.pose,
            (Some(last), Some(previous)) => {
                let motion = previous.pose.isometry().inverse() * last.pose.isometry();
                let step = Se3TangentSpace::from_isometry(motion)
                    .scale(self.settings.velocity_damping)
                    .isometry();
                (last.pose.isometry() * step).into()
            }
        }
    }

    fn loss(&self) -> AlignmentLoss {
        AlignmentLoss {
            color_weight: self.settings.color_weight,
            loss_cutoff: self.settings.loss_cutoff,
        }
    }

    /// Aligns the frame to the map and writes the resulting pose and confidence into `frame`.
    ///
    /// Tracking never fails: if it does not converge, the best pose found is kept, the frame is
    /// marked [`Confidence::LowConfidence`] and a [`ConvergenceWarning`] is recorded.
    pub fn track(&mut self, frame: &mut Frame, frame_map: &FrameMap, map: &SplatMap) -> TrackingReport {
        let mut pose = frame_map.initial_pose;
        let size = (frame_map.width, frame_map.height);
        let mut cost = self.settings.loss_cutoff;
        let mut rounds = 0;
        let mut converged = false;

        if map.is_empty() {
            info!("frame {} anchors the map at its initial pose", frame.id);
            cost = 0.0;
            converged = true;
        } else {
            for _ in 0..self.settings.rounds {
                let render = self.renderer.render(map, pose, &frame_map.intrinsics, size);
                if render.coverage() == 0 {
                    warn!("frame {} sees none of the map at {:?}", frame.id, pose.center());
                    break;
                }
                rounds += 1;
                let problem = PoseAlignment::new(frame_map.samples.clone(), render.reference_view())
                    .loss(self.loss());
                let start_cost = problem.cost(pose);
                cost = start_cost;
                if start_cost <= self.settings.convergence_cost {
                    converged = true;
                    break;
                }

                let solver = single_view_nelder_mead(
                    pose,
                    self.settings.translation_step,
                    self.settings.rotation_step,
                )
                .sd_tolerance(self.settings.std_dev_threshold);
                // The initial parameter is empty because nelder mead is passed its own initial parameter directly.
                let result = Executor::new(problem, solver, vec![])
                    .add_observer(OptimizationObserver, ObserverMode::Always)
                    .max_iters(self.settings.patience as u64)
                    .run();
                match result {
                    Ok(result) => {
                        let state = result.state;
                        let candidate: CameraToWorld =
                            Pose::from_se3(Vector6::from_row_slice(&state.best_param));
                        if state.best_cost.is_finite()
                            && state.best_cost < start_cost
                            && candidate.is_rigid(1e-6)
                        {
                            pose = candidate;
                            cost = state.best_cost;
                        }
                    }
                    Err(e) => {
                        warn!("tracking optimization of frame {} failed: {}", frame.id, e);
                        break;
                    }
                }
                debug!(
                    "frame {} tracking round {} went from {} to {}",
                    frame.id, rounds, start_cost, cost
                );
                if start_cost - cost < self.settings.convergence_delta {
                    break;
                }
            }
            converged = converged || cost <= self.settings.accept_cost;
        }

        let warning = if converged {
            frame.confidence = Confidence::Nominal;
            None
        } else {
            frame.confidence = Confidence::LowConfidence;
            let warning = ConvergenceWarning {
                stage: ConvergenceStage::Tracking,
                frame_id: frame.id,
                residual: cost,
            };
            warn!(
                "tracking of frame {} did not converge, keeping best pose with cost {}",
                frame.id, cost
            );
            self.warnings.push(warning);
            Some(warning)
        };
        info!(
            "tracked frame {} in {} rounds with cost {} at {:?}",
            frame.id,
            rounds,
            cost,
            pose.center().as_slice()
        );

        frame.pose = pose;
        self.trajectory.insert(frame.id, frame.timestamp, pose);
        self.new_poses.insert(frame.id, pose);
        TrackingReport {
            frame_id: frame.id,
            pose,
            cost,
            rounds,
            converged,
            warning,
        }
    }

    /// Takes the poses tracked since the last call.
    pub fn get_new_poses(&mut self) -> BTreeMap<u64, CameraToWorld> {
        std::mem::take(&mut self.new_poses)
    }

    /// Records how well the map predicted the last frame.
    ///
    /// All slices are row-major images of the same size. Depth `<= 0` and zero normals are
    /// invalid, and normals must be expressed in the same space.
    pub fn update_last_status(
        &mut self,
        frame: &Frame,
        predicted_depth: &[f64],
        observed_depth: &[f64],
        predicted_normal: &[Vector3<f64>],
        observed_normal: &[Vector3<f64>],
    ) -> TrackingStatus {
        let depth: Mean = predicted_depth
            .iter()
            .zip(observed_depth)
            .filter(|&(&p, &o)| p > 0.0 && o > 0.0)
            .map(|(p, o)| (p - o).abs())
            .collect();
        let normal: Mean = predicted_normal
            .iter()
            .zip(observed_normal)
            .filter(|(p, o)| p.norm_squared() > 0.5 && o.norm_squared() > 0.5)
            .map(|(p, o)| 1.0 - p.dot(o))
            .collect();
        let depth_residual = if depth.is_empty() {
            f64::INFINITY
        } else {
            depth.mean()
        };
        let normal_distance = if normal.is_empty() { 1.0 } else { normal.mean() };

        let window: Mean = self
            .status
            .iter()
            .map(|s| s.depth_residual)
            .filter(|r| r.is_finite())
            .collect();
        let spike = !depth_residual.is_finite()
            || (!window.is_empty()
                && window.mean() > 0.0
                && depth_residual > self.settings.spike_ratio * window.mean());
        if spike {
            warn!(
                "frame {} depth residual {} spiked, next frame starts from the last pose",
                frame.id, depth_residual
            );
        }

        let status = TrackingStatus {
            frame_id: frame.id,
            depth_residual,
            normal_distance,
            spike,
        };
        self.spike = spike;
        self.status.push_back(status);
        while self.status.len() > self.settings.window.max(1) {
            self.status.pop_front();
        }
        status
    }

    /// The poses as tracked, before any global optimization.
    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn last_status(&self) -> Option<&TrackingStatus> {
        self.status.back()
    }

    pub fn warnings(&self) -> &[ConvergenceWarning] {
        &self.warnings
    }

    /// Saves the tracked trajectory in the TUM RGB-D format.
    pub fn save_trajectory(&self, path: impl AsRef<Path>) -> std::result::Result<(), StorageError> {
        let mut writer = TumTrajectoryWriter::create(path)?;
        for entry in self.trajectory.iter() {
            writer.write(entry.timestamp, entry.pose)?;
        }
        Ok(())
    }
}
