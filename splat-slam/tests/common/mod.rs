#![allow(dead_code)]

use image::{Luma, Rgb};
use splat_core::{
    nalgebra::{Point2, Rotation3, Vector3},
    CameraIntrinsics, CameraToWorld, Pose,
};
use splat_slam::{ColorImage, DepthImage, Frame, Mapper, Renderer, SlamSettings};
use std::path::Path;

pub const WIDTH: u32 = 48;
pub const HEIGHT: u32 = 36;

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

pub fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::identity()
        .focal(40.0)
        .principal_point(Point2::new(23.5, 17.5))
}

pub fn settings(dir: &Path) -> SlamSettings {
    SlamSettings {
        save_path: dir.to_owned(),
        ..Default::default()
    }
}

pub fn camera_at(center: Vector3<f64>) -> CameraToWorld {
    CameraToWorld::from_parts(center, Rotation3::identity())
}

/// Views the textured plane `z = 2 + 0.2 x` from an unrotated camera at `center`.
pub fn plane_frame(id: u64, center: Vector3<f64>) -> Frame {
    let k = intrinsics();
    let ray = |u: u32, v: u32| {
        Vector3::new(
            (u as f64 - k.principal_point.x) / k.focals.x,
            (v as f64 - k.principal_point.y) / k.focals.y,
            1.0,
        )
    };
    let depth_at = |u: u32, v: u32| (2.0 + 0.2 * center.x - center.z) / (1.0 - 0.2 * ray(u, v).x);
    let depth = DepthImage::from_fn(WIDTH, HEIGHT, |u, v| Luma([depth_at(u, v) as f32]));
    let color = ColorImage::from_fn(WIDTH, HEIGHT, |u, v| {
        let world = center + ray(u, v) * depth_at(u, v);
        Rgb([
            (0.5 + 0.5 * (4.0 * world.x).sin()) as f32,
            (0.5 + 0.5 * (3.0 * world.y).cos()) as f32,
            (0.5 + 0.25 * (2.0 * (world.x + world.y)).sin()) as f32,
        ])
    });
    Frame::new(id, id as f64 / 30.0, color, depth, k)
}

pub fn counters_hold<R: Renderer>(mapper: &Mapper<R>) -> bool {
    mapper.get_stable_num() + mapper.get_unstable_num()
        == mapper.map().allocated() - mapper.map().removed()
}
