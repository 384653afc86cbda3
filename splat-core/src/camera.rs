use crate::{CameraPoint, Projective};
use nalgebra::{Matrix3, Point2, Vector2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows conversion between pixel coordinates with a known depth and [`CameraPoint`].
///
/// Pixel centers sit on integer coordinates, so pixel `(u, v)` of an image is the
/// point `Point2::new(u as f64, v as f64)`.
pub trait CameraModel {
    /// Lifts a pixel with a metric depth (its z coordinate) into camera space.
    fn backproject(&self, pixel: Point2<f64>, depth: f64) -> CameraPoint;

    /// Projects a camera space point onto the image plane.
    ///
    /// Returns `None` when the point is behind the camera or not finite.
    fn project(&self, point: CameraPoint) -> Option<Point2<f64>>;
}

/// This contains intrinsic camera parameters as per
/// [this Wikipedia page](https://en.wikipedia.org/wiki/Camera_resectioning#Intrinsic_parameters).
///
/// Depth cameras deliver already rectified images, so no distortion model is applied.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl CameraIntrinsics {
    /// Creates camera intrinsics that would create an identity intrinsic matrix.
    pub fn identity() -> Self {
        Self {
            focals: Vector2::new(1.0, 1.0),
            skew: 0.0,
            principal_point: Point2::new(0.0, 0.0),
        }
    }

    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    pub fn focal(self, focal: f64) -> Self {
        Self {
            focals: Vector2::new(focal, focal),
            ..self
        }
    }

    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,  self.skew,      self.principal_point.x,
            0.0,            self.focals.y,  self.principal_point.y,
            0.0,            0.0,            1.0,
        )
    }

    /// Reads the intrinsics out of an upper triangular 3x3 calibration matrix.
    ///
    /// Returns `None` if the bottom row is not `[0, 0, 1]` or the lower triangle is not zero.
    pub fn from_matrix(matrix: &Matrix3<f64>) -> Option<Self> {
        let upper = matrix.m21 == 0.0
            && matrix.m31 == 0.0
            && matrix.m32 == 0.0
            && matrix.m33 == 1.0;
        if !upper {
            return None;
        }
        Some(Self {
            focals: Vector2::new(matrix.m11, matrix.m22),
            principal_point: Point2::new(matrix.m13, matrix.m23),
            skew: matrix.m12,
        })
    }

    /// Checks that every parameter is finite and both focal lengths are positive.
    pub fn is_valid(&self) -> bool {
        self.focals.iter().all(|f| f.is_finite() && *f > 0.0)
            && self.principal_point.iter().all(|c| c.is_finite())
            && self.skew.is_finite()
    }
}

impl CameraModel for CameraIntrinsics {
    /// ```
    /// use splat_core::{CameraIntrinsics, CameraModel};
    /// use splat_core::nalgebra::{Point2, Vector2};
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(525.0, 520.0),
    ///     principal_point: Point2::new(319.5, 239.5),
    ///     skew: 0.0,
    /// };
    /// let pixel = Point2::new(100.0, 42.0);
    /// let point = intrinsics.backproject(pixel, 1.7);
    /// let back = intrinsics.project(point).unwrap();
    /// assert!((back - pixel).norm() < 1e-9);
    /// ```
    fn backproject(&self, pixel: Point2<f64>, depth: f64) -> CameraPoint {
        let centered = pixel - self.principal_point;
        let y = centered.y / self.focals.y;
        let x = (centered.x - self.skew * y) / self.focals.x;
        CameraPoint::from_point(nalgebra::Point3::new(x * depth, y * depth, depth))
    }

    fn project(&self, point: CameraPoint) -> Option<Point2<f64>> {
        let p = point.point()?;
        if !(p.z > 0.0) || !p.coords.iter().all(|n| n.is_finite()) {
            return None;
        }
        let x = p.x / p.z;
        let y = p.y / p.z;
        Some(Point2::new(
            x * self.focals.x + self.skew * y + self.principal_point.x,
            y * self.focals.y + self.principal_point.y,
        ))
    }
}
