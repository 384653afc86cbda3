use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{IsometryMatrix3, Rotation3, Vector3};
#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A rigid motion as an element of se(3): a rotation vector and a translation expressed
/// before the rotation is applied.
///
/// Scaling it scales the motion along the same screw, which is what motion extrapolation needs.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Se3TangentSpace {
    pub translation: Vector3<f64>,
    pub rotation: Vector3<f64>,
}

impl Se3TangentSpace {
    /// NaN components are replaced with zero.
    pub fn new(translation: Vector3<f64>, rotation: Vector3<f64>) -> Self {
        let finite = |v: Vector3<f64>| {
            if v.iter().any(|n| n.is_nan()) {
                Vector3::zeros()
            } else {
                v
            }
        };
        Self {
            translation: finite(translation),
            rotation: finite(rotation),
        }
    }

    /// The inverse of [`Se3TangentSpace::isometry`].
    pub fn from_isometry(isometry: IsometryMatrix3<f64>) -> Self {
        let rotation = isometry.rotation;
        Self::new(
            rotation.inverse() * isometry.translation.vector,
            Skew3::from(rotation).0,
        )
    }

    #[must_use]
    pub fn isometry(self) -> IsometryMatrix3<f64> {
        let rotation: Rotation3<f64> = Skew3(self.rotation).into();
        IsometryMatrix3::from_parts((rotation * self.translation).into(), rotation)
    }

    #[must_use]
    pub fn scale(self, scale: f64) -> Self {
        Self {
            translation: self.translation * scale,
            rotation: self.rotation * scale,
        }
    }
}

/// A rotation vector in so(3), used where a rotation must be unconstrained parameters.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Skew3(pub Vector3<f64>);

/// Exponential map.
impl From<Skew3> for Rotation3<f64> {
    fn from(w: Skew3) -> Self {
        Rotation3::from_scaled_axis(w.0)
    }
}

/// Logarithm map.
impl From<Rotation3<f64>> for Skew3 {
    fn from(r: Rotation3<f64>) -> Self {
        let w = r.scaled_axis();
        if w.iter().any(|n| n.is_nan()) {
            Self(Vector3::zeros())
        } else {
            Self(w)
        }
    }
}
