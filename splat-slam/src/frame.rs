use crate::{render::RenderOutput, Result, SlamError};
use image::{ImageBuffer, Luma, Rgb32FImage};
use serde::{Deserialize, Serialize};
use splat_core::{
    nalgebra::{Point2, Vector3},
    CameraIntrinsics, CameraModel, CameraPoint, CameraToWorld, Pose, Projective,
};
use splat_optimize::{AlignmentSample, ReferenceView};

/// An RGB image with channels in `[0, 1]`.
pub type ColorImage = Rgb32FImage;
/// A metric depth image. Non-positive or non-finite values mark invalid pixels.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Whether the tracker trusts the pose it produced for a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    Nominal,
    LowConfidence,
}

/// One timestep of RGB-D observations.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: u64,
    pub timestamp: f64,
    pub color: ColorImage,
    pub depth: DepthImage,
    pub intrinsics: CameraIntrinsics,
    /// The best known camera pose, overwritten by tracking and global optimization.
    pub pose: CameraToWorld,
    pub confidence: Confidence,
    /// The map rendered at this frame's pose once it has been integrated.
    pub rendered: Option<RenderOutput>,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: f64,
        color: ColorImage,
        depth: DepthImage,
        intrinsics: CameraIntrinsics,
    ) -> Self {
        Self {
            id,
            timestamp,
            color,
            depth,
            intrinsics,
            pose: CameraToWorld::identity(),
            confidence: Confidence::Nominal,
            rendered: None,
        }
    }

    /// Sets the initial pose estimate supplied by the frame source.
    pub fn with_pose(self, pose: CameraToWorld) -> Self {
        Self { pose, ..self }
    }

    /// Width and height in pixels.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.depth.width() as usize, self.depth.height() as usize)
    }

    pub fn record(&self) -> FrameRecord {
        FrameRecord {
            id: self.id,
            timestamp: self.timestamp,
            pose: self.pose,
            intrinsics: self.intrinsics,
            confidence: self.confidence,
            width: self.depth.width(),
            height: self.depth.height(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> SlamError {
        SlamError::InvalidFrame {
            frame_id: self.id,
            reason: reason.into(),
        }
    }
}

/// The metadata of a frame kept in checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub id: u64,
    pub timestamp: f64,
    pub pose: CameraToWorld,
    pub intrinsics: CameraIntrinsics,
    pub confidence: Confidence,
    pub width: u32,
    pub height: u32,
}

/// The working set derived from a frame for tracking and mapping.
///
/// All per-pixel arrays are row-major. Depth is clamped to the configured range with `0.0`
/// marking invalid pixels, and normals are in camera space, zero where unknown.
#[derive(Clone, Debug)]
pub struct FrameMap {
    pub frame_id: u64,
    pub width: usize,
    pub height: usize,
    pub intrinsics: CameraIntrinsics,
    pub depth: Vec<f64>,
    pub normals: Vec<Vector3<f64>>,
    pub colors: Vec<Vector3<f64>>,
    /// The pose tracking starts from.
    pub initial_pose: CameraToWorld,
    /// Observations sub-sampled on the tracking stride.
    pub samples: Vec<AlignmentSample>,
    pub valid_pixels: usize,
}

impl FrameMap {
    /// Validates the frame and derives its working set.
    ///
    /// Fails with [`SlamError::InvalidFrame`] if the images disagree in size, are empty, the
    /// intrinsics are unusable, color is not finite, or no depth pixel lies in `[min_depth, max_depth]`.
    pub fn from_frame(
        frame: &Frame,
        min_depth: f64,
        max_depth: f64,
        stride: usize,
        initial_pose: CameraToWorld,
    ) -> Result<Self> {
        if frame.color.dimensions() != frame.depth.dimensions() {
            return Err(frame.invalid(format!(
                "color is {:?} but depth is {:?}",
                frame.color.dimensions(),
                frame.depth.dimensions()
            )));
        }
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(frame.invalid("frame has no pixels"));
        }
        if !frame.intrinsics.is_valid() {
            return Err(frame.invalid("camera intrinsics are not finite and positive"));
        }
        if !initial_pose.is_rigid(1e-6) {
            return Err(frame.invalid("initial pose is not a rigid transform"));
        }

        let depth: Vec<f64> = frame
            .depth
            .pixels()
            .map(|&Luma([d])| {
                let d = d as f64;
                if d.is_finite() && d > 0.0 && d >= min_depth && d <= max_depth {
                    d
                } else {
                    0.0
                }
            })
            .collect();
        let valid_pixels = depth.iter().filter(|&&d| d > 0.0).count();
        if valid_pixels == 0 {
            return Err(frame.invalid(format!(
                "depth has no valid pixel in [{}, {}]",
                min_depth, max_depth
            )));
        }

        let mut colors = Vec::with_capacity(width * height);
        for pixel in frame.color.pixels() {
            if !pixel.0.iter().all(|c| c.is_finite()) {
                return Err(frame.invalid("color contains non-finite values"));
            }
            colors.push(Vector3::new(pixel.0[0] as f64, pixel.0[1] as f64, pixel.0[2] as f64));
        }

        let normals = depth_normals(&frame.intrinsics, width, height, &depth);

        let stride = stride.max(1);
        let samples = (0..height)
            .step_by(stride)
            .flat_map(|v| (0..width).step_by(stride).map(move |u| (u, v)))
            .filter_map(|(u, v)| {
                let ix = v * width + u;
                let d = depth[ix];
                if d <= 0.0 {
                    return None;
                }
                let point = frame
                    .intrinsics
                    .backproject(Point2::new(u as f64, v as f64), d)
                    .point()?;
                Some(AlignmentSample {
                    point,
                    color: colors[ix],
                })
            })
            .collect();

        Ok(Self {
            frame_id: frame.id,
            width,
            height,
            intrinsics: frame.intrinsics,
            depth,
            normals,
            colors,
            initial_pose,
            samples,
            valid_pixels,
        })
    }

    /// Pixel centers `(u, v)` on a grid with the given spacing.
    pub fn grid(&self, stride: usize) -> impl Iterator<Item = (usize, usize)> {
        let (width, height) = (self.width, self.height);
        let stride = stride.max(1);
        (0..height)
            .step_by(stride)
            .flat_map(move |v| (0..width).step_by(stride).map(move |u| (u, v)))
    }

    /// The pixel index a camera point projects onto, if that pixel has valid depth.
    pub fn lookup(&self, point: CameraPoint) -> Option<usize> {
        let projected = self.intrinsics.project(point)?;
        let (u, v) = (projected.x.round(), projected.y.round());
        if u < 0.0 || v < 0.0 || u >= self.width as f64 || v >= self.height as f64 {
            return None;
        }
        let ix = v as usize * self.width + u as usize;
        if self.depth[ix] > 0.0 {
            Some(ix)
        } else {
            None
        }
    }

    /// The observed geometry of the frame as an alignment target at `pose`.
    pub fn observed_view(&self, pose: CameraToWorld) -> ReferenceView {
        ReferenceView::new(
            pose,
            self.intrinsics,
            (self.width, self.height),
            self.depth.clone(),
            self.normals.clone(),
            self.colors.clone(),
        )
    }

    /// Approximate number of bytes retained by the working set.
    pub fn memory_bytes(&self) -> usize {
        self.depth.len() * std::mem::size_of::<f64>()
            + (self.normals.len() + self.colors.len()) * std::mem::size_of::<Vector3<f64>>()
            + self.samples.len() * std::mem::size_of::<AlignmentSample>()
    }
}

/// Estimates camera space normals from the cross product of neighboring back-projected pixels.
///
/// Forward differences are used where possible, backward differences at the right and bottom
/// borders. Normals point towards the camera.
fn depth_normals(
    intrinsics: &CameraIntrinsics,
    width: usize,
    height: usize,
    depth: &[f64],
) -> Vec<Vector3<f64>> {
    let point = |u: usize, v: usize| -> Option<Vector3<f64>> {
        let d = depth[v * width + u];
        if d > 0.0 {
            intrinsics
                .backproject(Point2::new(u as f64, v as f64), d)
                .point()
                .map(|p| p.coords)
        } else {
            None
        }
    };
    let mut normals = vec![Vector3::zeros(); width * height];
    if width < 2 || height < 2 {
        return normals;
    }
    for v in 0..height {
        for u in 0..width {
            let center = match point(u, v) {
                Some(p) => p,
                None => continue,
            };
            let (du, su) = if u + 1 < width { (u + 1, 1.0) } else { (u - 1, -1.0) };
            let (dv, sv) = if v + 1 < height { (v + 1, 1.0) } else { (v - 1, -1.0) };
            let (right, down) = match (point(du, v), point(u, dv)) {
                (Some(right), Some(down)) => (right, down),
                _ => continue,
            };
            let normal = ((right - center) * su).cross(&((down - center) * sv));
            let norm = normal.norm();
            if !(norm > 0.0) || !norm.is_finite() {
                continue;
            }
            let mut normal = normal / norm;
            if normal.dot(&center) > 0.0 {
                normal = -normal;
            }
            normals[v * width + u] = normal;
        }
    }
    normals
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::identity()
            .focal(20.0)
            .principal_point(Point2::new(7.5, 5.5))
    }

    fn frame_with_depth(depth: impl Fn(u32, u32) -> f32) -> Frame {
        let color = Rgb32FImage::from_pixel(16, 12, image::Rgb([0.5, 0.25, 1.0]));
        let depth = DepthImage::from_fn(16, 12, |u, v| Luma([depth(u, v)]));
        Frame::new(7, 0.25, color, depth, intrinsics())
    }

    #[test]
    fn all_invalid_depth_is_rejected() {
        let frame = frame_with_depth(|_, _| f32::NAN);
        let err = FrameMap::from_frame(&frame, 0.1, 10.0, 2, CameraToWorld::identity()).unwrap_err();
        assert!(matches!(err, SlamError::InvalidFrame { frame_id: 7, .. }));
    }

    #[test]
    fn out_of_range_depth_is_rejected() {
        let frame = frame_with_depth(|_, _| 20.0);
        assert!(FrameMap::from_frame(&frame, 0.1, 10.0, 2, CameraToWorld::identity()).is_err());
    }

    #[test]
    fn mismatched_images_are_rejected() {
        let mut frame = frame_with_depth(|_, _| 1.0);
        frame.color = Rgb32FImage::new(8, 8);
        assert!(FrameMap::from_frame(&frame, 0.1, 10.0, 2, CameraToWorld::identity()).is_err());
    }

    #[test]
    fn invalid_pixels_are_zeroed() {
        let frame = frame_with_depth(|u, _| if u < 4 { 0.0 } else { 1.5 });
        let map = FrameMap::from_frame(&frame, 0.1, 10.0, 2, CameraToWorld::identity()).unwrap();
        assert_eq!(map.valid_pixels, 12 * 12);
        assert_eq!(map.depth[0], 0.0);
        assert_eq!(map.depth[5], 1.5);
        assert!(map.samples.iter().all(|s| s.point.z == 1.5));
    }

    #[test]
    fn flat_wall_normals_face_the_camera() {
        let frame = frame_with_depth(|_, _| 2.0);
        let map = FrameMap::from_frame(&frame, 0.1, 10.0, 2, CameraToWorld::identity()).unwrap();
        for normal in &map.normals {
            assert_relative_eq!(*normal, -Vector3::z(), epsilon = 1e-9);
        }
    }
}
