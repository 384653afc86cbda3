use crate::{
    mapper::{is_stable, refine, Mapper},
    render::Renderer,
    settings::OptimizationParams,
    OptimizationObserver, Result, SlamError,
};
use argmin::core::{Executor, ObserverMode};
use log::*;
use splat_core::{CameraToWorld, Pose, Projective, WorldToWorld};
use splat_optimize::{many_view_nelder_mead, AlignmentLoss, KeyframeAlignment, ManyViewAlignment};

/// The outcome of a committed global optimization.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GlobalReport {
    pub keyframes: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: u64,
    /// Unstable points promoted by the terminal stability sweep.
    pub promoted: usize,
}

/// At most `max` items taken at an even stride, always including the first.
fn spread<T: Clone>(items: &[T], max: usize) -> Vec<T> {
    if items.len() <= max {
        return items.to_vec();
    }
    let step = (items.len() + max.max(1) - 1) / max.max(1);
    items.iter().step_by(step).cloned().collect()
}

/// Finds the correction of the latest keyframe at or before `frame_id`, or the first
/// keyframe's correction for frames before every keyframe.
fn correction_for(corrections: &[(u64, WorldToWorld)], frame_id: u64) -> WorldToWorld {
    corrections
        .iter()
        .rev()
        .find(|(id, _)| *id <= frame_id)
        .or_else(|| corrections.first())
        .map(|&(_, correction)| correction)
        .unwrap_or_else(WorldToWorld::identity)
}

impl<R: Renderer> Mapper<R> {
    /// Jointly refines every keyframe pose after the first, carries the map and trajectory
    /// along, and refines all points against all keyframes.
    ///
    /// Chains longer than `global_max_keyframes` free keyframes are solved in consecutive
    /// pieces, each anchored on the last keyframe of the one before.
    ///
    /// The work happens on a copy of the map state. It is committed only if every pose stays
    /// rigid, every value stays finite and the cost did not grow beyond
    /// `global_divergence_ratio` times its initial value. Otherwise
    /// [`SlamError::OptimizationDivergence`] is returned and nothing changes.
    pub fn global_optimization(
        &mut self,
        params: &OptimizationParams,
        is_end: bool,
    ) -> Result<GlobalReport> {
        if self.keyframes.len() < 2 {
            info!(
                "skipping global optimization with {} keyframes",
                self.keyframes.len()
            );
            return Ok(GlobalReport {
                keyframes: self.keyframes.len(),
                initial_cost: 0.0,
                final_cost: 0.0,
                iterations: 0,
                promoted: 0,
            });
        }

        let alignments: Vec<KeyframeAlignment> = self
            .keyframes
            .iter()
            .map(|keyframe| {
                let frame_map = &keyframe.frame_map;
                let render = self.renderer.render(
                    &self.map,
                    keyframe.pose,
                    &frame_map.intrinsics,
                    (frame_map.width, frame_map.height),
                );
                KeyframeAlignment {
                    samples: spread(&frame_map.samples, params.global_max_samples),
                    observed: frame_map.observed_view(keyframe.pose),
                    rendered: if render.coverage() > 0 {
                        Some(render.reference_view())
                    } else {
                        None
                    },
                }
            })
            .collect();
        let initial = self.keyframe_poses();
        let patience = if is_end {
            params.final_global_patience
        } else {
            params.global_patience
        };
        let piece = params.global_max_keyframes.max(1);
        info!(
            "optimizing {} keyframes in pieces of {} for up to {} iterations each",
            initial.len(),
            piece,
            patience
        );

        let mut poses = initial.clone();
        let mut iterations = 0;
        let mut start = 1;
        while start < alignments.len() {
            let end = (start + piece).min(alignments.len());
            let problem = ManyViewAlignment::new(alignments[start - 1..end].to_vec())
                .anchor_pose(poses[start - 1])
                .loss(AlignmentLoss::default())
                .pair_weight(params.global_pair_weight);
            let solver = many_view_nelder_mead(
                &poses[start..end],
                params.global_translation_step,
                params.global_rotation_step,
            )
            .sd_tolerance(params.global_std_dev_threshold);
            // The initial parameter is empty because nelder mead is passed its own initial parameter directly.
            let result = Executor::new(problem, solver, vec![])
                .add_observer(OptimizationObserver, ObserverMode::Always)
                .max_iters(patience as u64)
                .run()
                .map_err(|e| SlamError::OptimizationDivergence(e.to_string()))?;
            let solved = result.operator.poses(&result.state.best_param);
            iterations += result.state.iter;
            poses[start..end].copy_from_slice(&solved[1..]);

            // Keyframes after this piece follow its last keyframe until their own piece runs.
            let carry = WorldToWorld::from_camera_poses(initial[end - 1], poses[end - 1]);
            for (pose, &original) in poses[end..].iter_mut().zip(&initial[end..]) {
                *pose = carry.correct(original);
            }
            start = end;
        }

        let problem = ManyViewAlignment::new(alignments)
            .loss(AlignmentLoss::default())
            .pair_weight(params.global_pair_weight);
        let initial_cost = problem.cost(&initial);
        let final_cost = problem.cost(&poses);
        if !final_cost.is_finite() {
            return Err(SlamError::OptimizationDivergence(format!(
                "final cost {} is not finite",
                final_cost
            )));
        }
        if let Some((ix, _)) = poses.iter().enumerate().find(|(_, p)| !p.is_rigid(1e-6)) {
            return Err(SlamError::OptimizationDivergence(format!(
                "keyframe {} left the space of rigid transforms",
                ix
            )));
        }
        if final_cost > params.global_divergence_ratio * initial_cost {
            return Err(SlamError::OptimizationDivergence(format!(
                "cost grew from {} to {}",
                initial_cost, final_cost
            )));
        }

        let corrections: Vec<(u64, WorldToWorld)> = self
            .keyframes
            .iter()
            .zip(&poses)
            .map(|(keyframe, &after)| {
                (
                    keyframe.frame_id,
                    WorldToWorld::from_camera_poses(keyframe.pose, after),
                )
            })
            .collect();

        let mut map = self.map.clone();
        for point in map.points_mut() {
            let correction = correction_for(&corrections, point.last_frame);
            point.position = correction
                .transform(point.world_point())
                .point()
                .ok_or_else(|| {
                    SlamError::OptimizationDivergence("a point went to infinity".to_string())
                })?;
            point.normal = correction.rotate(point.normal);
            for direction in &mut point.viewing_directions {
                *direction = correction.rotate(*direction);
            }
        }

        let mut keyframes = self.keyframes.clone();
        for (keyframe, &pose) in keyframes.iter_mut().zip(&poses) {
            keyframe.pose = pose;
        }
        let mut trajectory = self.trajectory.clone();
        for entry in trajectory.iter_mut() {
            entry.pose = correction_for(&corrections, entry.frame_id).correct(entry.pose);
        }
        let mut window = self.window.clone();
        for recent in window.iter_mut() {
            recent.pose = correction_for(&corrections, recent.frame_id).correct(recent.pose);
        }

        for _ in 0..params.global_point_iterations {
            for keyframe in &keyframes {
                for point in map.points_mut() {
                    refine(point, keyframe.pose, &keyframe.frame_map, params);
                }
            }
        }
        if !map.points().all(|p| p.is_finite()) {
            return Err(SlamError::OptimizationDivergence(
                "point refinement produced non-finite values".to_string(),
            ));
        }
        if !trajectory.iter().all(|e| e.pose.is_rigid(1e-6)) {
            return Err(SlamError::OptimizationDivergence(
                "a corrected trajectory pose is not rigid".to_string(),
            ));
        }

        let mut promoted = 0;
        if is_end {
            let settings = self.settings;
            let ready: Vec<_> = map
                .unstable()
                .filter(|(_, p)| is_stable(p, &settings))
                .map(|(key, _)| key)
                .collect();
            for key in ready {
                if map.promote(key).is_some() {
                    promoted += 1;
                }
            }
        }

        info!(
            "global optimization took cost from {} to {} in {} iterations",
            initial_cost, final_cost, iterations
        );
        self.map = map;
        self.keyframes = keyframes;
        self.trajectory = trajectory;
        self.window = window;
        Ok(GlobalReport {
            keyframes: poses.len(),
            initial_cost,
            final_cost,
            iterations,
            promoted,
        })
    }

    /// The current pose of every keyframe.
    pub fn keyframe_poses(&self) -> Vec<CameraToWorld> {
        self.keyframes.iter().map(|k| k.pose).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splat_core::nalgebra::{Rotation3, Vector3};

    #[test]
    fn samples_are_thinned_evenly() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(spread(&items, 4), vec![0, 3, 6, 9]);
        assert_eq!(spread(&items, 5), vec![0, 2, 4, 6, 8]);
        assert_eq!(spread(&items, 10), items);
        assert_eq!(spread(&items, 0), vec![0]);
    }

    #[test]
    fn frames_take_the_latest_preceding_correction() {
        let shift = |x: f64| {
            WorldToWorld::from_parts(Vector3::new(x, 0.0, 0.0), Rotation3::identity())
        };
        let corrections = vec![(2, shift(1.0)), (5, shift(2.0))];
        assert_eq!(correction_for(&corrections, 0), shift(1.0));
        assert_eq!(correction_for(&corrections, 2), shift(1.0));
        assert_eq!(correction_for(&corrections, 4), shift(1.0));
        assert_eq!(correction_for(&corrections, 9), shift(2.0));
        assert_eq!(correction_for(&[], 9), WorldToWorld::identity());
    }
}
