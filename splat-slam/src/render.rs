use crate::{
    frame::{ColorImage, DepthImage},
    map::{SplatMap, SplatPoint},
};
use image::{Luma, Rgb};
use splat_core::{
    nalgebra::{Point2, Vector3},
    CameraIntrinsics, CameraModel, CameraPoint, CameraToWorld, Pose, Projective, WorldToCamera,
};
use splat_optimize::ReferenceView;

/// The prediction of a view from the map.
///
/// Per-pixel arrays are row-major. Depth is `0.0` where nothing was rendered. Normals are in
/// world space and zero where nothing was rendered.
#[derive(Clone, Debug)]
pub struct RenderOutput {
    pub pose: CameraToWorld,
    pub intrinsics: CameraIntrinsics,
    pub width: usize,
    pub height: usize,
    pub color: Vec<Vector3<f64>>,
    pub depth: Vec<f64>,
    pub normal: Vec<Vector3<f64>>,
}

impl RenderOutput {
    /// An empty render with no coverage.
    pub fn empty(pose: CameraToWorld, intrinsics: CameraIntrinsics, (width, height): (usize, usize)) -> Self {
        Self {
            pose,
            intrinsics,
            width,
            height,
            color: vec![Vector3::zeros(); width * height],
            depth: vec![0.0; width * height],
            normal: vec![Vector3::zeros(); width * height],
        }
    }

    /// Number of pixels something was rendered into.
    pub fn coverage(&self) -> usize {
        self.depth.iter().filter(|&&d| d > 0.0).count()
    }

    /// The rendered normals rotated into the camera space of the render.
    pub fn camera_normals(&self) -> Vec<Vector3<f64>> {
        let to_camera = self.pose.0.rotation.inverse();
        self.normal.iter().map(|n| to_camera * n).collect()
    }

    /// The render as an alignment target.
    pub fn reference_view(&self) -> ReferenceView {
        ReferenceView::new(
            self.pose,
            self.intrinsics,
            (self.width, self.height),
            self.depth.clone(),
            self.camera_normals(),
            self.color.clone(),
        )
    }

    pub fn color_image(&self) -> ColorImage {
        ColorImage::from_fn(self.width as u32, self.height as u32, |u, v| {
            let c = self.color[v as usize * self.width + u as usize];
            Rgb([c.x as f32, c.y as f32, c.z as f32])
        })
    }

    pub fn depth_image(&self) -> DepthImage {
        DepthImage::from_fn(self.width as u32, self.height as u32, |u, v| {
            Luma([self.depth[v as usize * self.width + u as usize] as f32])
        })
    }
}

/// Produces predicted color, depth and normals of a view from the map.
///
/// Implementations must be pure functions of their inputs.
pub trait Renderer {
    fn render(
        &self,
        map: &SplatMap,
        pose: CameraToWorld,
        intrinsics: &CameraIntrinsics,
        size: (usize, usize),
    ) -> RenderOutput;
}

/// Renders every point of the map as an opaque surfel disk.
///
/// The depth of a covered pixel is where the pixel's ray meets the surfel's plane. The nearest
/// surfel wins a pixel, and surfels within `tie_epsilon` of each other in depth are decided by
/// the pixel's distance to their projected centers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PointSplatRenderer {
    /// The largest radius in pixels a surfel is drawn with.
    pub max_radius: f64,
    /// Depth difference in meters under which two surfels are considered tied.
    pub tie_epsilon: f64,
}

impl Default for PointSplatRenderer {
    fn default() -> Self {
        Self {
            max_radius: 8.0,
            tie_epsilon: 1e-3,
        }
    }
}

impl PointSplatRenderer {
    fn splat(
        &self,
        point: &SplatPoint,
        view: WorldToCamera,
        intrinsics: &CameraIntrinsics,
        output: &mut RenderOutput,
        center_distances: &mut [f64],
    ) {
        let center = match view.transform(point.world_point()).point() {
            Some(center) if center.z > 0.0 => center.coords,
            _ => return,
        };
        let projected = match intrinsics.project(CameraPoint::from_point(center.into())) {
            Some(projected) => projected,
            None => return,
        };
        let normal = view.0.rotation * point.normal;
        let radius = (intrinsics.focals.x * point.scale / center.z)
            .min(self.max_radius)
            .max(0.5);
        if !radius.is_finite() {
            return;
        }
        let (width, height) = (output.width as f64, output.height as f64);
        let u_min = (projected.x - radius).ceil().max(0.0);
        let u_max = (projected.x + radius).floor().min(width - 1.0);
        let v_min = (projected.y - radius).ceil().max(0.0);
        let v_max = (projected.y + radius).floor().min(height - 1.0);
        if u_min > u_max || v_min > v_max {
            return;
        }
        for v in v_min as usize..=v_max as usize {
            for u in u_min as usize..=u_max as usize {
                let pixel = Point2::new(u as f64, v as f64);
                let distance_squared = (pixel - projected).norm_squared();
                if distance_squared > radius * radius {
                    continue;
                }
                let ray = match intrinsics.backproject(pixel, 1.0).point() {
                    Some(ray) => ray.coords,
                    None => continue,
                };
                let facing = ray.dot(&normal);
                let depth = if facing.abs() > 1e-6 {
                    center.dot(&normal) / facing
                } else {
                    center.z
                };
                if !(depth > 0.0) || !depth.is_finite() {
                    continue;
                }
                let ix = v * output.width + u;
                let current = output.depth[ix];
                let wins = if current <= 0.0 || depth < current - self.tie_epsilon {
                    true
                } else if depth <= current + self.tie_epsilon {
                    distance_squared < center_distances[ix]
                } else {
                    false
                };
                if wins {
                    output.depth[ix] = depth;
                    output.color[ix] = point.color;
                    output.normal[ix] = point.normal;
                    center_distances[ix] = distance_squared;
                }
            }
        }
    }
}

impl Renderer for PointSplatRenderer {
    fn render(
        &self,
        map: &SplatMap,
        pose: CameraToWorld,
        intrinsics: &CameraIntrinsics,
        size: (usize, usize),
    ) -> RenderOutput {
        let mut output = RenderOutput::empty(pose, *intrinsics, size);
        let mut center_distances = vec![f64::INFINITY; size.0 * size.1];
        let view = pose.inverse();
        for point in map.points() {
            self.splat(point, view, intrinsics, &mut output, &mut center_distances);
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use splat_core::nalgebra::Point3;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::identity()
            .focal(20.0)
            .principal_point(Point2::new(9.5, 9.5))
    }

    fn surfel(position: Point3<f64>, color: Vector3<f64>) -> SplatPoint {
        SplatPoint::new(position, -Vector3::z(), color, 0.5, 0.1, 0)
    }

    #[test]
    fn empty_map_renders_nothing() {
        let output = PointSplatRenderer::default().render(
            &SplatMap::new(),
            CameraToWorld::identity(),
            &intrinsics(),
            (20, 20),
        );
        assert_eq!(output.coverage(), 0);
    }

    #[test]
    fn nearest_surfel_wins() {
        let mut map = SplatMap::new();
        map.insert_unstable(surfel(Point3::new(0.0, 0.0, 2.0), Vector3::new(1.0, 0.0, 0.0)));
        map.insert_unstable(surfel(Point3::new(0.0, 0.0, 1.0), Vector3::new(0.0, 1.0, 0.0)));
        let output = PointSplatRenderer::default().render(
            &map,
            CameraToWorld::identity(),
            &intrinsics(),
            (20, 20),
        );
        let ix = 10 * 20 + 10;
        assert_relative_eq!(output.depth[ix], 1.0, epsilon = 1e-12);
        assert_eq!(output.color[ix], Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(output.normal[ix], -Vector3::z());
    }

    #[test]
    fn ties_go_to_the_closest_center() {
        let mut map = SplatMap::new();
        // Two surfels on the same plane, centered on pixels 8 and 11 of row 10.
        let left = Point3::new((8.0 - 9.5) / 20.0 * 2.0, (10.0 - 9.5) / 20.0 * 2.0, 2.0);
        let right = Point3::new((11.0 - 9.5) / 20.0 * 2.0, (10.0 - 9.5) / 20.0 * 2.0, 2.0);
        map.insert_unstable(surfel(left, Vector3::new(1.0, 0.0, 0.0)));
        map.insert_unstable(surfel(right, Vector3::new(0.0, 0.0, 1.0)));
        let output = PointSplatRenderer::default().render(
            &map,
            CameraToWorld::identity(),
            &intrinsics(),
            (20, 20),
        );
        assert_eq!(output.color[10 * 20 + 9], Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(output.color[10 * 20 + 10], Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn surfels_behind_the_camera_are_skipped() {
        let mut map = SplatMap::new();
        map.insert_unstable(surfel(Point3::new(0.0, 0.0, -2.0), Vector3::new(1.0, 1.0, 1.0)));
        let output = PointSplatRenderer::default().render(
            &map,
            CameraToWorld::identity(),
            &intrinsics(),
            (20, 20),
        );
        assert_eq!(output.coverage(), 0);
    }
}
