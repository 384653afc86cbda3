use crate::{alignment::sample_residuals, AlignmentLoss, AlignmentSample, ReferenceView};
use argmin::{
    core::{ArgminOp, Error},
    solver::neldermead::NelderMead,
};
use average::{Estimate, Mean};
use itertools::Itertools;
use splat_core::{nalgebra::Vector6, CameraToWorld, Pose};

/// Builds the simplex for a [`ManyViewAlignment`] over `poses`, which must not include the anchor.
///
/// The translation simplex steps by `translation_step` meters and the rotation simplex by
/// `rotation_step` radians.
pub fn many_view_nelder_mead(
    poses: &[CameraToWorld],
    translation_step: f64,
    rotation_step: f64,
) -> NelderMead<Vec<Vec<f64>>, f64> {
    let num_poses = poses.len();
    let se3s: Vec<Vec<f64>> = poses
        .iter()
        .map(|p| p.se3().iter().copied().collect())
        .collect();
    let mut variants = vec![se3s; num_poses * 6 + 1];
    #[allow(clippy::needless_range_loop)]
    for i in 0..num_poses * 6 {
        let pose = i / 6;
        let subi = i % 6;
        if subi < 3 {
            variants[i][pose][subi] += translation_step;
        } else {
            variants[i][pose][subi] += rotation_step;
        }
    }
    NelderMead::new().with_initial_params(variants)
}

/// Everything a keyframe contributes to a [`ManyViewAlignment`].
#[derive(Clone, Debug)]
pub struct KeyframeAlignment {
    /// Sub-sampled observations of the keyframe in its own camera space.
    pub samples: Vec<AlignmentSample>,
    /// The keyframe's own observed geometry, posed at the keyframe's pose before optimization.
    pub observed: ReferenceView,
    /// The map rendered at the keyframe's pose before optimization.
    pub rendered: Option<ReferenceView>,
}

/// Jointly aligns a chain of keyframes.
///
/// The first keyframe is the gauge anchor and keeps its pose. Every other keyframe is a
/// parameter. Each keyframe's samples are scored against the map rendered at its original
/// pose, and each consecutive pair of keyframes is scored in both directions against the
/// other keyframe's observed geometry at the candidate poses.
#[derive(Clone)]
pub struct ManyViewAlignment {
    keyframes: Vec<KeyframeAlignment>,
    anchor: CameraToWorld,
    loss: AlignmentLoss,
    pair_weight: f64,
}

impl ManyViewAlignment {
    /// Creates a ManyViewAlignment.
    ///
    /// You must pass at least 2 keyframes, as the first is held fixed.
    pub fn new(keyframes: Vec<KeyframeAlignment>) -> Self {
        assert!(
            keyframes.len() >= 2,
            "many-view alignment needs an anchor and at least one free keyframe"
        );
        Self {
            anchor: keyframes[0].observed.pose,
            keyframes,
            loss: AlignmentLoss::default(),
            pair_weight: 1.0,
        }
    }

    pub fn loss(self, loss: AlignmentLoss) -> Self {
        Self { loss, ..self }
    }

    /// Holds the first keyframe at `anchor` instead of its original pose.
    ///
    /// Used when a chain is solved in pieces and the anchor was already moved by an earlier piece.
    pub fn anchor_pose(self, anchor: CameraToWorld) -> Self {
        Self { anchor, ..self }
    }

    /// Weight of the consecutive keyframe terms relative to the map terms.
    pub fn pair_weight(self, pair_weight: f64) -> Self {
        Self {
            pair_weight,
            ..self
        }
    }

    /// The anchor pose followed by the original pose of every free keyframe.
    pub fn initial_poses(&self) -> Vec<CameraToWorld> {
        std::iter::once(self.anchor)
            .chain(self.keyframes[1..].iter().map(|k| k.observed.pose))
            .collect()
    }

    /// Expands parameters into the full pose list, anchor first.
    pub fn poses(&self, params: &[Vec<f64>]) -> Vec<CameraToWorld> {
        std::iter::once(self.anchor)
            .chain(
                params
                    .iter()
                    .map(|p| Pose::from_se3(Vector6::from_row_slice(p))),
            )
            .collect()
    }

    /// Mean capped cost of the whole chain at `poses`, anchor first.
    pub fn cost(&self, poses: &[CameraToWorld]) -> f64 {
        let mut map_terms = Mean::new();
        for (keyframe, &pose) in self.keyframes.iter().zip(poses) {
            if let Some(rendered) = &keyframe.rendered {
                for residual in sample_residuals(
                    pose,
                    rendered.pose.inverse(),
                    &keyframe.samples,
                    rendered,
                    self.loss,
                ) {
                    map_terms.add(residual);
                }
            }
        }

        let mut pair_terms = Mean::new();
        for ((a, &pose_a), (b, &pose_b)) in self.keyframes.iter().zip(poses).tuple_windows() {
            let forward = sample_residuals(
                pose_b,
                pose_a.inverse(),
                &b.samples,
                &a.observed,
                self.loss,
            );
            let backward = sample_residuals(
                pose_a,
                pose_b.inverse(),
                &a.samples,
                &b.observed,
                self.loss,
            );
            for residual in forward.chain(backward) {
                pair_terms.add(residual);
            }
        }

        match (map_terms.is_empty(), pair_terms.is_empty()) {
            (true, true) => self.loss.loss_cutoff,
            (false, true) => map_terms.mean(),
            (true, false) => pair_terms.mean(),
            (false, false) => {
                (map_terms.mean() + self.pair_weight * pair_terms.mean()) / (1.0 + self.pair_weight)
            }
        }
    }
}

impl ArgminOp for ManyViewAlignment {
    type Param = Vec<Vec<f64>>;
    type Output = f64;
    type Hessian = ();
    type Jacobian = ();
    type Float = f64;

    fn apply(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.cost(&self.poses(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::tests::{wall, wall_samples};
    use approx::assert_relative_eq;
    use splat_core::nalgebra::{Rotation3, Vector3};

    fn chain(offsets: &[f64]) -> ManyViewAlignment {
        let keyframes = offsets
            .iter()
            .map(|&x| {
                let pose = CameraToWorld::from_parts(Vector3::new(x, 0.0, 0.0), Rotation3::identity());
                let observed = wall(pose);
                KeyframeAlignment {
                    samples: wall_samples(&observed),
                    rendered: Some(observed.clone()),
                    observed,
                }
            })
            .collect();
        ManyViewAlignment::new(keyframes)
    }

    #[test]
    fn parameters_expand_behind_the_anchor() {
        let problem = chain(&[0.0, 0.1, 0.2]);
        let initial = problem.initial_poses();
        let params: Vec<Vec<f64>> = initial[1..]
            .iter()
            .map(|p| p.se3().iter().copied().collect())
            .collect();
        let poses = problem.poses(&params);
        assert_eq!(poses.len(), 3);
        for (a, b) in poses.iter().zip(&initial) {
            assert_relative_eq!(a.0, b.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn a_moved_anchor_leads_the_expanded_poses() {
        let anchor = CameraToWorld::from_parts(Vector3::new(0.0, 0.02, 0.0), Rotation3::identity());
        let problem = chain(&[0.0, 0.1]).anchor_pose(anchor);
        assert_eq!(problem.initial_poses()[0], anchor);
        let params: Vec<Vec<f64>> = vec![problem.initial_poses()[1].se3().iter().copied().collect()];
        assert_eq!(problem.poses(&params)[0], anchor);
    }

    #[test]
    fn moving_a_free_keyframe_off_the_wall_costs_more() {
        let problem = chain(&[0.0, 0.05]);
        let mut poses = problem.initial_poses();
        let at_rest = problem.cost(&poses);
        poses[1] = CameraToWorld::from_parts(Vector3::new(0.05, 0.0, 0.06), Rotation3::identity());
        assert!(problem.cost(&poses) > at_rest + 1e-3);
    }
}
