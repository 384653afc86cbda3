use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Point3, Unit, Vector3, Vector4};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A 3d point stored in homogeneous coordinates so poses can act on it as a 4x4 matrix.
pub trait Projective: From<Vector4<f64>> + Clone + Copy {
    /// The raw homogeneous vector, not normalized.
    fn homogeneous(self) -> Vector4<f64>;

    /// Divides out `w`. Returns `None` for points at infinity.
    fn point(self) -> Option<Point3<f64>> {
        Point3::from_homogeneous(self.homogeneous())
    }

    fn from_point(point: Point3<f64>) -> Self {
        point.to_homogeneous().into()
    }

    /// Unit direction from the origin of the frame towards the point.
    fn bearing(self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.homogeneous().xyz())
    }

    /// Checks that every homogeneous component is finite and the point is not at infinity.
    fn is_finite(self) -> bool {
        let h = self.homogeneous();
        h.iter().all(|n| n.is_finite()) && h.w != 0.0
    }
}

/// A metric point in the camera frame: x right, y down, z along the optical axis.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPoint(pub Vector4<f64>);

impl Projective for CameraPoint {
    fn homogeneous(self) -> Vector4<f64> {
        self.into()
    }
}

impl CameraPoint {
    /// The depth of the point, which is its z coordinate in camera space.
    ///
    /// Returns `None` if the point is at infinity.
    pub fn depth(self) -> Option<f64> {
        self.point().map(|p| p.z)
    }
}

/// A point in world coordinates, the frame in which the map is stored.
///
/// The world frame is fixed by the pose of the first frame of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldPoint(pub Vector4<f64>);

impl Projective for WorldPoint {
    fn homogeneous(self) -> Vector4<f64> {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_z_coordinate() {
        let p = CameraPoint::from_point(Point3::new(0.5, -0.25, 2.0));
        assert_eq!(p.depth(), Some(2.0));
    }

    #[test]
    fn point_at_infinity_is_not_finite() {
        let p = WorldPoint(Vector4::new(1.0, 0.0, 0.0, 0.0));
        assert!(!p.is_finite());
        assert!(p.point().is_none());
    }
}
