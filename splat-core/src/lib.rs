//! # Splat Core
//!
//! Common geometry types for the splat-slam crates: camera poses, homogeneous points,
//! the so(3)/se(3) tangent spaces used by the optimizers, and the pinhole camera model
//! used to lift depth images into 3d and project map points back onto the image.
//!
//! ## Coordinate conventions
//!
//! Camera space is right-handed with the optical center at the origin:
//!
//! * Positive z axis is forwards
//! * Positive y axis is down
//! * Positive x axis is right
//!
//! Depth is the z coordinate of a [`CameraPoint`], not the euclidean distance from the
//! optical center. A frame's pose is stored as a [`CameraToWorld`] (the "c2w" pose), which
//! also tells you where the camera is located and oriented in the world. Use
//! [`Pose::inverse`] to obtain the [`WorldToCamera`] needed to bring map points into view.
//!
//! ```text
//!         z (forward)
//!        /
//!       /
//!      O-------- x (right)
//!      |
//!      |
//!      y (down)
//! ```

mod camera;
mod point;
mod pose;
mod so3;

pub use camera::*;
pub use nalgebra;
pub use point::*;
pub use pose::*;
pub use so3::*;
