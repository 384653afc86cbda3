use crate::{
    frame::Frame,
    render::RenderOutput,
    writers::{ImageCategory, ImageData, ImageWriter},
    StorageError,
};
use average::{Estimate, Mean};
use image::Luma;
use log::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Image quality of the map rendered at one frame.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub frame_id: u64,
    /// Peak signal to noise ratio of the rendered color in dB, over pixels with valid observed depth.
    pub psnr: f64,
    /// Mean absolute difference in meters between rendered and observed depth.
    pub depth_l1: f64,
    /// Number of pixels the metrics were computed over.
    pub pixels: usize,
}

/// Scores a render of the map against the frame it was rendered for and writes the render,
/// the observed color and the rendered depth under `rel_path`.
///
/// Rendered depth is clamped into `[min_depth, max_depth]` before comparison, so pixels the
/// map does not cover count as the nearest representable depth.
pub fn eval_frame(
    frame: &Frame,
    render: &RenderOutput,
    (min_depth, max_depth): (f64, f64),
    writer: &ImageWriter,
    rel_path: impl AsRef<Path>,
) -> Result<EvalReport, StorageError> {
    let mut color_error = Mean::new();
    let mut depth_error = Mean::new();
    for (ix, (&Luma([observed]), pixel)) in frame
        .depth
        .pixels()
        .zip(frame.color.pixels())
        .enumerate()
    {
        let observed = observed as f64;
        if !(observed.is_finite() && observed >= min_depth && observed <= max_depth && observed > 0.0)
        {
            continue;
        }
        let rendered_color = match render.color.get(ix) {
            Some(rendered_color) => rendered_color,
            None => continue,
        };
        for (c, &o) in rendered_color.iter().zip(pixel.0.iter()) {
            let diff = c.clamp(0.0, 1.0) - o as f64;
            color_error.add(diff * diff);
        }
        let rendered_depth = render.depth[ix].clamp(min_depth, max_depth);
        depth_error.add((rendered_depth - observed).abs());
    }

    let pixels = depth_error.len() as usize;
    let (psnr, depth_l1) = if pixels == 0 {
        (0.0, f64::INFINITY)
    } else {
        (
            -10.0 * color_error.mean().max(1e-10).log10(),
            depth_error.mean(),
        )
    };
    info!(
        "frame {} PSNR: {:.3} depth L1: {:.4} over {} pixels",
        frame.id, psnr, depth_l1, pixels
    );

    let rel_path = rel_path.as_ref();
    let rendered_color = render.color_image();
    let rendered_depth = render.depth_image();
    writer.write_image(
        &format!("{:06}_rgb", frame.id),
        ImageCategory::Color,
        ImageData::Rgb(&rendered_color),
        rel_path,
    )?;
    writer.write_image(
        &format!("{:06}_gt", frame.id),
        ImageCategory::Color,
        ImageData::Rgb(&frame.color),
        rel_path,
    )?;
    writer.write_image(
        &format!("{:06}_depth", frame.id),
        ImageCategory::Raw,
        ImageData::Luma(&rendered_depth),
        rel_path,
    )?;

    Ok(EvalReport {
        frame_id: frame.id,
        psnr,
        depth_l1,
        pixels,
    })
}
