use splat_core::{
    nalgebra::{Point2, Point3, Vector3},
    CameraIntrinsics, CameraModel, CameraPoint, CameraToWorld, Pose, Projective, WorldPoint,
    WorldToCamera,
};

/// A 3d point observed by a frame, in that frame's camera space, with its observed color.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AlignmentSample {
    pub point: Point3<f64>,
    pub color: Vector3<f64>,
}

/// How the geometric and photometric disagreement of a sample are combined.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AlignmentLoss {
    /// The weight of the squared color difference relative to the squared metric distance.
    pub color_weight: f64,
    /// The maximum cost of a single sample.
    pub loss_cutoff: f64,
}

impl Default for AlignmentLoss {
    fn default() -> Self {
        Self {
            color_weight: 0.1,
            loss_cutoff: 0.01,
        }
    }
}

/// Dense per-pixel geometry and color of one view, used as the target of an alignment.
///
/// Depth is the z coordinate in the view's camera space, with `0.0` marking pixels without
/// geometry. Normals are in the view's camera space; a zero normal means it is unknown.
#[derive(Clone, Debug)]
pub struct ReferenceView {
    pub pose: CameraToWorld,
    pub intrinsics: CameraIntrinsics,
    pub width: usize,
    pub height: usize,
    pub depth: Vec<f64>,
    pub normals: Vec<Vector3<f64>>,
    pub colors: Vec<Vector3<f64>>,
    view: WorldToCamera,
}

impl ReferenceView {
    /// Creates a reference view.
    ///
    /// `depth`, `normals` and `colors` are row-major and must all hold `width * height` entries.
    pub fn new(
        pose: CameraToWorld,
        intrinsics: CameraIntrinsics,
        (width, height): (usize, usize),
        depth: Vec<f64>,
        normals: Vec<Vector3<f64>>,
        colors: Vec<Vector3<f64>>,
    ) -> Self {
        assert_eq!(depth.len(), width * height);
        assert_eq!(normals.len(), width * height);
        assert_eq!(colors.len(), width * height);
        Self {
            pose,
            intrinsics,
            width,
            height,
            depth,
            normals,
            colors,
            view: pose.inverse(),
        }
    }

    /// Number of pixels that hold geometry.
    pub fn valid_pixels(&self) -> usize {
        self.depth.iter().filter(|&&d| d > 0.0).count()
    }

    /// Scores a world point and its color against the view at its own pose.
    pub fn residual(&self, point: WorldPoint, color: Vector3<f64>, loss: AlignmentLoss) -> f64 {
        self.residual_at(self.view, point, color, loss)
    }

    /// Scores a world point and its color against the view as if the view had been
    /// captured from `view` instead.
    pub fn residual_at(
        &self,
        view: WorldToCamera,
        point: WorldPoint,
        color: Vector3<f64>,
        loss: AlignmentLoss,
    ) -> f64 {
        let camera_point = view.transform(point);
        let (ix, pixel) = match self.pixel_of(camera_point) {
            Some(found) => found,
            None => return loss.loss_cutoff,
        };
        let depth = self.depth[ix];
        let p = match camera_point.point() {
            Some(p) => p,
            None => return loss.loss_cutoff,
        };
        let reference = match self.intrinsics.backproject(pixel, depth).point() {
            Some(reference) => reference,
            None => return loss.loss_cutoff,
        };
        let normal = self.normals[ix];
        let geometric = if normal.norm_squared() > 0.5 {
            (p - reference).dot(&normal)
        } else {
            p.z - depth
        };
        let photometric = (color - self.colors[ix]).norm_squared();
        let cost = geometric * geometric + loss.color_weight * photometric;
        if cost.is_finite() {
            cost.min(loss.loss_cutoff)
        } else {
            loss.loss_cutoff
        }
    }

    /// Finds the pixel index and pixel center a camera point lands on, if it holds geometry.
    fn pixel_of(&self, point: CameraPoint) -> Option<(usize, Point2<f64>)> {
        let projected = self.intrinsics.project(point)?;
        let (u, v) = (projected.x.round(), projected.y.round());
        if u < 0.0 || v < 0.0 || u >= self.width as f64 || v >= self.height as f64 {
            return None;
        }
        let ix = v as usize * self.width + u as usize;
        if self.depth[ix] > 0.0 {
            Some((ix, Point2::new(u, v)))
        } else {
            None
        }
    }
}

/// Transforms the samples of a frame into the world at `pose` and scores them against `reference`.
pub(crate) fn sample_residuals<'a>(
    pose: CameraToWorld,
    view: WorldToCamera,
    samples: &'a [AlignmentSample],
    reference: &'a ReferenceView,
    loss: AlignmentLoss,
) -> impl Iterator<Item = f64> + 'a {
    samples.iter().map(move |sample| {
        let world = pose.transform(CameraPoint::from_point(sample.point));
        reference.residual_at(view, world, sample.color, loss)
    })
}
