use crate::{CameraPoint, Projective, Skew3, WorldPoint};
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{
    IsometryMatrix3, Matrix3, Matrix4, Quaternion, Rotation3, Translation3, UnitQuaternion,
    Vector3, Vector6,
};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A rigid transform tagged with the frames it maps between.
///
/// [`CameraToWorld`] is what trajectories store, [`WorldToCamera`] is what rendering needs,
/// and [`WorldToWorld`] moves map geometry after a keyframe pose changes.
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type InputPoint: Projective;
    type OutputPoint: Projective;
    type Inverse: Pose;

    fn isometry(self) -> IsometryMatrix3<f64>;

    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    fn homogeneous(self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Builds the pose from a 4x4 homogeneous matrix.
    ///
    /// Returns `None` unless the matrix is a finite rigid transform within `1e-6`.
    fn from_homogeneous(matrix: Matrix4<f64>) -> Option<Self> {
        if !is_rigid_matrix(&matrix, 1e-6) {
            return None;
        }
        let rotation =
            Rotation3::from_matrix_unchecked(matrix.fixed_slice::<3, 3>(0, 0).into_owned());
        let translation = matrix.fixed_slice::<3, 1>(0, 3).into_owned();
        Some(Self::from_parts(translation, rotation))
    }

    /// Translation followed by the rotation vector, the parameter layout the optimizers use.
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r: Skew3 = isometry.rotation.into();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    fn from_se3(se3: Vector6<f64>) -> Self {
        let translation = se3.xyz();
        let rotation = Skew3(Vector3::new(se3[3], se3[4], se3[5])).into();
        Self::from_parts(translation, rotation)
    }

    /// Checks the pose is a finite rigid transform: orthonormal rotation block with
    /// unit determinant.
    fn is_rigid(self, tolerance: f64) -> bool {
        is_rigid_matrix(&self.homogeneous(), tolerance)
    }

    fn transform(self, input: Self::InputPoint) -> Self::OutputPoint {
        (self.isometry().to_homogeneous() * input.homogeneous()).into()
    }
}

fn is_rigid_matrix(matrix: &Matrix4<f64>, tolerance: f64) -> bool {
    if !matrix.iter().all(|n| n.is_finite()) {
        return false;
    }
    let bottom = matrix.fixed_slice::<1, 4>(3, 0);
    if (bottom[0].abs() + bottom[1].abs() + bottom[2].abs() + (bottom[3] - 1.0).abs()) > tolerance
    {
        return false;
    }
    let rotation: Matrix3<f64> = matrix.fixed_slice::<3, 3>(0, 0).into_owned();
    let orthonormal =
        (rotation.transpose() * rotation - Matrix3::identity()).abs().max() <= tolerance;
    orthonormal && (rotation.determinant() - 1.0).abs() <= tolerance
}

/// Maps [`WorldPoint`] into [`CameraPoint`].
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    type InputPoint = WorldPoint;
    type OutputPoint = CameraPoint;
    type Inverse = CameraToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

/// The pose of a camera in the world, mapping [`CameraPoint`] into [`WorldPoint`].
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToWorld(pub IsometryMatrix3<f64>);

impl Pose for CameraToWorld {
    type InputPoint = CameraPoint;
    type OutputPoint = WorldPoint;
    type Inverse = WorldToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl CameraToWorld {
    /// The optical center of the camera in world coordinates.
    pub fn center(self) -> Vector3<f64> {
        self.0.translation.vector
    }

    /// The direction the camera looks at (its positive z axis) in world coordinates.
    pub fn forward(self) -> Vector3<f64> {
        self.0.rotation * Vector3::z()
    }

    /// Distance between the optical centers of two poses.
    pub fn translation_distance(self, other: Self) -> f64 {
        (self.center() - other.center()).norm()
    }

    /// Angle in radians of the relative rotation between two poses.
    pub fn rotation_angle(self, other: Self) -> f64 {
        self.0.rotation.angle_to(&other.0.rotation)
    }

    /// Converts to the TUM RGB-D layout `[tx, ty, tz, qx, qy, qz, qw]`.
    pub fn to_tum(self) -> [f64; 7] {
        let t = self.center();
        let q = UnitQuaternion::from_rotation_matrix(&self.0.rotation);
        [t.x, t.y, t.z, q.i, q.j, q.k, q.w]
    }

    /// Reads a pose in the TUM RGB-D layout `[tx, ty, tz, qx, qy, qz, qw]`.
    ///
    /// The quaternion is normalized. Returns `None` if it is degenerate or any value is not finite.
    pub fn from_tum(values: [f64; 7]) -> Option<Self> {
        if !values.iter().all(|n| n.is_finite()) {
            return None;
        }
        let [tx, ty, tz, qx, qy, qz, qw] = values;
        let q = UnitQuaternion::try_new(Quaternion::new(qw, qx, qy, qz), 1e-12)?;
        Some(
            IsometryMatrix3::from_parts(Translation3::new(tx, ty, tz), q.to_rotation_matrix())
                .into(),
        )
    }
}

/// A correction applied to world geometry when the pose it hangs off is re-estimated.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToWorld(pub IsometryMatrix3<f64>);

impl Pose for WorldToWorld {
    type InputPoint = WorldPoint;
    type OutputPoint = WorldPoint;
    type Inverse = WorldToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToWorld {
    /// If a camera was moved from pose `before` to pose `after`, this is the correction
    /// that carries anything attached to the camera along with it.
    pub fn from_camera_poses(before: CameraToWorld, after: CameraToWorld) -> Self {
        (after.isometry() * before.isometry().inverse()).into()
    }

    /// Applies the correction to a camera pose.
    pub fn correct(self, pose: CameraToWorld) -> CameraToWorld {
        (self.isometry() * pose.isometry()).into()
    }

    /// Rotates a direction vector, ignoring the translation.
    pub fn rotate(self, vector: Vector3<f64>) -> Vector3<f64> {
        self.0.rotation * vector
    }
}
