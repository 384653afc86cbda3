//! # Splat SLAM
//!
//! Online RGB-D tracking and mapping against a map of oriented surfels.
//!
//! Every frame goes through the same steps in [`SlamSystem::process_frame`]:
//!
//! 1. The [`Tracker`] validates the frame, predicts its pose from recent motion and aligns it
//!    to a render of the current map.
//! 2. The [`Mapper`] receives the tracked pose, allocates surfels where the map does not yet
//!    explain the observed depth, refines existing surfels, removes floaters and promotes
//!    well-observed surfels from the unstable set to the stable set.
//! 3. On the configured cadence the frame is evaluated against its render and the map is
//!    checkpointed.
//!
//! When the stream ends, [`SlamSystem::finish`] runs a global optimization over all
//! keyframes, then writes the final trajectory, renders, timings and checkpoint.
//!
//! Frame ids must increase strictly. Poses are [`CameraToWorld`](splat_core::CameraToWorld)
//! transforms and depth is the z coordinate in camera space, in meters.

mod checkpoint;
mod error;
mod eval;
mod export;
mod frame;
mod global;
mod map;
mod mapper;
mod render;
mod settings;
mod system;
mod timing;
mod tracker;
mod trajectory;
mod writers;

pub use checkpoint::*;
pub use error::*;
pub use eval::*;
pub use export::*;
pub use frame::*;
pub use global::*;
pub use map::*;
pub use mapper::*;
pub use render::*;
pub use settings::*;
pub use system::*;
pub use timing::*;
pub use tracker::*;
pub use trajectory::*;
pub use writers::*;

use argmin::core::{ArgminKV, ArgminOp, Error, IterState, Observe};
use log::*;

pub(crate) struct OptimizationObserver;

impl<T: ArgminOp> Observe<T> for OptimizationObserver
where
    T::Param: std::fmt::Debug,
{
    fn observe_iter(&mut self, state: &IterState<T>, _kv: &ArgminKV) -> std::result::Result<(), Error> {
        debug!(
            "on iteration {} out of {} with total evaluations {} and current cost {}, params {:?}",
            state.iter, state.max_iters, state.cost_func_count, state.cost, state.param
        );
        Ok(())
    }
}
