//! Pose alignment problems solved with Nelder-Mead through [`argmin`].
//!
//! Every problem here scores a candidate pose by transforming observed 3d samples into a
//! [`ReferenceView`] (either a render of the map or another frame's observed depth) and
//! measuring point-to-plane and color disagreement. The costs are capped per sample, so
//! gross outliers and samples that fall outside the reference view contribute a constant.

mod alignment;
mod many_view_optimizer;
mod single_view_optimizer;

pub use alignment::*;
pub use many_view_optimizer::*;
pub use single_view_optimizer::*;
