//! Crop/scale (blit) capability.
//!
//! Hardware 2D engines (RGA, GPU blitters) implement [`Blitter`] and are
//! injected into the pipeline; [`SoftwareBlitter`] is the always-available
//! CPU fallback and the reference for correctness. Both take the same crop
//! rectangle and mirror flag, so a hardware failure can be retried in
//! software with pixel-identical intent.

use crate::buffer::FrameBuffer;
use crate::error::{Error, Result};
use crate::format::{PixelFormat, Rect};

/// A 2D crop/scale engine.
pub trait Blitter: Send + Sync {
    /// Scale the `src_rect` region of `src` to fill all of `dst`,
    /// optionally mirrored horizontally.
    ///
    /// `src` and `dst` must share a pixel format. An `Err` from a hardware
    /// implementation is recoverable: callers fall back to
    /// [`SoftwareBlitter`].
    fn transform(
        &self,
        src: &FrameBuffer,
        src_rect: Rect,
        dst: &mut FrameBuffer,
        mirror: bool,
    ) -> Result<()>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Pure-CPU bilinear crop/scale for NV12 and Gray8.
#[derive(Debug, Default)]
pub struct SoftwareBlitter;

impl Blitter for SoftwareBlitter {
    fn transform(
        &self,
        src: &FrameBuffer,
        src_rect: Rect,
        dst: &mut FrameBuffer,
        mirror: bool,
    ) -> Result<()> {
        let src_desc = src.descriptor().clone();
        let dst_desc = dst.descriptor().clone();

        if src_desc.format != dst_desc.format {
            return Err(Error::Blit(format!(
                "format mismatch: {:?} -> {:?}",
                src_desc.format, dst_desc.format
            )));
        }
        if !src_rect.fits_in(src_desc.width, src_desc.height) {
            return Err(Error::Blit(format!(
                "crop {:?} outside {}x{} source",
                src_rect, src_desc.width, src_desc.height
            )));
        }

        let dst_w = dst_desc.width as usize;
        let dst_h = dst_desc.height as usize;
        let src_w = src_desc.width as usize;
        let src_h = src_desc.height as usize;

        match src_desc.format {
            PixelFormat::Gray8 => {
                scale_plane_region(
                    src.as_slice(),
                    src_w,
                    src_rect,
                    &mut dst.as_mut_slice()[..dst_w * dst_h],
                    dst_w,
                    dst_h,
                    1,
                    mirror,
                );
            }
            PixelFormat::Nv12 => {
                if src_rect.x % 2 != 0
                    || src_rect.y % 2 != 0
                    || src_rect.width % 2 != 0
                    || src_rect.height % 2 != 0
                {
                    return Err(Error::Blit(format!(
                        "NV12 crop must be even-aligned, got {:?}",
                        src_rect
                    )));
                }

                let (src_y, src_uv) = src.as_slice().split_at(src_w * src_h);
                let dst_bytes = dst.as_mut_slice();
                let (dst_y, dst_uv) = dst_bytes.split_at_mut(dst_w * dst_h);

                scale_plane_region(src_y, src_w, src_rect, dst_y, dst_w, dst_h, 1, mirror);

                // UV plane is half resolution with interleaved 2-byte
                // samples.
                let uv_rect = Rect {
                    x: src_rect.x / 2,
                    y: src_rect.y / 2,
                    width: src_rect.width / 2,
                    height: src_rect.height / 2,
                };
                scale_plane_region(
                    src_uv,
                    src_w / 2,
                    uv_rect,
                    &mut dst_uv[..dst_w * (dst_h / 2)],
                    dst_w / 2,
                    dst_h / 2,
                    2,
                    mirror,
                );
            }
            other => {
                return Err(Error::Blit(format!(
                    "unsupported blit format: {:?}",
                    other
                )));
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "sw-blit"
    }
}

/// Bilinear-scale the `rect` region of a plane into the full destination.
///
/// `src_w`/`dst_w` are in pixels; each pixel is `channels` consecutive
/// bytes (1 for luma, 2 for interleaved NV12 chroma). `mirror` flips
/// sampling horizontally.
#[allow(clippy::too_many_arguments)]
fn scale_plane_region(
    src: &[u8],
    src_w: usize,
    rect: Rect,
    dst: &mut [u8],
    dst_w: usize,
    dst_h: usize,
    channels: usize,
    mirror: bool,
) {
    let rx = rect.x as usize;
    let ry = rect.y as usize;
    let rw = rect.width as usize;
    let rh = rect.height as usize;

    // Endpoints map to endpoints: the last source row/column of the crop
    // is sampled exactly, and a same-size blit is an identity copy.
    let x_ratio = (rw as f32 - 1.0) / ((dst_w - 1) as f32).max(1.0);
    let y_ratio = (rh as f32 - 1.0) / ((dst_h - 1) as f32).max(1.0);

    for out_y in 0..dst_h {
        let src_y = out_y as f32 * y_ratio;
        let y0 = src_y.floor() as usize;
        let y1 = (y0 + 1).min(rh - 1);
        let y_frac = src_y - y0 as f32;

        for out_x in 0..dst_w {
            let sample_x = if mirror {
                (rw as f32 - 1.0) - out_x as f32 * x_ratio
            } else {
                out_x as f32 * x_ratio
            };
            let x0 = sample_x.floor() as usize;
            let x1 = (x0 + 1).min(rw - 1);
            let x_frac = sample_x - x0 as f32;

            for c in 0..channels {
                let p00 = src[((ry + y0) * src_w + rx + x0) * channels + c] as f32;
                let p10 = src[((ry + y0) * src_w + rx + x1) * channels + c] as f32;
                let p01 = src[((ry + y1) * src_w + rx + x0) * channels + c] as f32;
                let p11 = src[((ry + y1) * src_w + rx + x1) * channels + c] as f32;

                let top = p00 + x_frac * (p10 - p00);
                let bottom = p01 + x_frac * (p11 - p01);
                let value = top + y_frac * (bottom - top);

                dst[(out_y * dst_w + out_x) * channels + c] = value.round() as u8;
            }
        }
    }
}
