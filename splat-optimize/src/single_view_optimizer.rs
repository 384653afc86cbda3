use crate::{alignment::sample_residuals, AlignmentLoss, AlignmentSample, ReferenceView};
use argmin::{
    core::{ArgminOp, Error},
    solver::neldermead::NelderMead,
};
use average::Mean;
use splat_core::{nalgebra::Vector6, CameraToWorld, Pose};

/// Builds the simplex around `pose` for a [`PoseAlignment`].
///
/// The translation simplex steps by `translation_step` meters and the rotation simplex by
/// `rotation_step` radians, one vertex per degree of freedom.
pub fn single_view_nelder_mead(
    pose: CameraToWorld,
    translation_step: f64,
    rotation_step: f64,
) -> NelderMead<Vec<f64>, f64> {
    let original: Vec<f64> = pose.se3().iter().copied().collect();
    let mut variants = vec![original; 7];
    #[allow(clippy::needless_range_loop)]
    for i in 0..6 {
        if i < 3 {
            variants[i][i] += translation_step;
        } else {
            variants[i][i] += rotation_step;
        }
    }
    NelderMead::new().with_initial_params(variants)
}

/// Aligns the samples of one frame to a reference view by optimizing the frame's
/// [`CameraToWorld`] pose in se(3).
#[derive(Clone)]
pub struct PoseAlignment {
    samples: Vec<AlignmentSample>,
    reference: ReferenceView,
    loss: AlignmentLoss,
}

impl PoseAlignment {
    pub fn new(samples: Vec<AlignmentSample>, reference: ReferenceView) -> Self {
        Self {
            samples,
            reference,
            loss: AlignmentLoss::default(),
        }
    }

    pub fn loss(self, loss: AlignmentLoss) -> Self {
        Self { loss, ..self }
    }

    /// Mean capped cost of all samples when the frame is placed at `pose`.
    pub fn cost(&self, pose: CameraToWorld) -> f64 {
        let mean: Mean = sample_residuals(
            pose,
            self.reference.pose.inverse(),
            &self.samples,
            &self.reference,
            self.loss,
        )
        .collect();
        if mean.is_empty() {
            self.loss.loss_cutoff
        } else {
            mean.mean()
        }
    }
}

impl ArgminOp for PoseAlignment {
    type Param = Vec<f64>;
    type Output = f64;
    type Hessian = ();
    type Jacobian = ();
    type Float = f64;

    fn apply(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        let pose: CameraToWorld = Pose::from_se3(Vector6::from_row_slice(p));
        Ok(self.cost(pose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::tests::{wall, wall_samples};
    use argmin::core::Executor;
    use splat_core::nalgebra::{Rotation3, Vector3};

    #[test]
    fn identical_view_is_a_minimum() {
        let reference = wall(CameraToWorld::identity());
        let samples = wall_samples(&reference);
        let problem = PoseAlignment::new(samples, reference);
        let at_rest = problem.cost(CameraToWorld::identity());
        let pushed = problem.cost(CameraToWorld::from_parts(
            Vector3::new(0.0, 0.0, 0.04),
            Rotation3::identity(),
        ));
        assert!(at_rest < 1e-12);
        assert!(pushed > 1e-3);
    }

    #[test]
    fn recovers_depth_offset() {
        let reference = wall(CameraToWorld::identity());
        let samples = wall_samples(&reference);
        let problem = PoseAlignment::new(samples, reference);
        let start = CameraToWorld::from_parts(Vector3::new(0.0, 0.0, 0.05), Rotation3::identity());
        let solver = single_view_nelder_mead(start, 0.01, 0.005).sd_tolerance(1e-14);
        let state = Executor::new(problem.clone(), solver, vec![])
            .max_iters(600)
            .run()
            .unwrap()
            .state;
        let pose: CameraToWorld = Pose::from_se3(Vector6::from_row_slice(&state.best_param));
        assert!(state.best_cost < problem.cost(start));
        assert!(pose.center().z.abs() < 0.02);
    }
}
