//! Concrete processing unit kinds.

use std::fmt;
use std::sync::Arc;

use crate::blit::{Blitter, SoftwareBlitter};
use crate::buffer::FrameBuffer;
use crate::encode::JpegEncoder;
use crate::error::{Error, Result};
use crate::format::{FrameDescriptor, PixelFormat, Rect};
use crate::settings::ProcessSettings;
use crate::unit::{BufferPolicy, Disposition, FrameProcessor};

/// The kinds of processing stages the pipeline knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Aspect-preserving crop + scale between shapes.
    CopyScale,
    /// Crop to the per-request zoom window, scale back to full shape.
    DigitalZoom,
    /// Software lens shading correction.
    LensCorrection,
    /// Still JPEG encoding.
    JpegEncode,
    /// Raw sensor data, untouched.
    RawPassthrough,
    /// No-op stage for degenerate single-stream chains.
    Dummy,
}

impl UnitKind {
    /// Short stable name, used for unit and thread names.
    pub fn label(&self) -> &'static str {
        match self {
            UnitKind::CopyScale => "copy-scale",
            UnitKind::DigitalZoom => "digital-zoom",
            UnitKind::LensCorrection => "lens-correction",
            UnitKind::JpegEncode => "jpeg-encode",
            UnitKind::RawPassthrough => "raw-passthrough",
            UnitKind::Dummy => "dummy",
        }
    }

    /// Buffer policy for this kind when it is not the last unit of a
    /// chain (terminal units always take caller buffers instead).
    pub fn base_policy(&self) -> BufferPolicy {
        match self {
            UnitKind::CopyScale => BufferPolicy::Internal,
            UnitKind::DigitalZoom => BufferPolicy::Internal,
            UnitKind::LensCorrection => BufferPolicy::Internal,
            UnitKind::JpegEncode => BufferPolicy::External,
            UnitKind::RawPassthrough => BufferPolicy::Borrowed,
            UnitKind::Dummy => BufferPolicy::Borrowed,
        }
    }

    /// Whether frames without a queued caller buffer should be dropped
    /// rather than queued (still encoders see sparse requests).
    pub fn needs_output_to_enqueue(&self) -> bool {
        matches!(self, UnitKind::JpegEncode)
    }

    /// Build the processor implementing this kind.
    pub fn make_processor(&self, caps: &PipelineCapabilities) -> Result<Box<dyn FrameProcessor>> {
        Ok(match self {
            UnitKind::CopyScale => Box::new(CopyScale::new(caps.blitter.clone())),
            UnitKind::DigitalZoom => Box::new(DigitalZoom::new(caps.blitter.clone())),
            UnitKind::LensCorrection => Box::new(LensCorrection::default()),
            UnitKind::JpegEncode => {
                let encoder = caps.encoder.clone().ok_or_else(|| {
                    Error::Config("JPEG sink configured without an encoder".into())
                })?;
                Box::new(JpegEncode::new(encoder))
            }
            UnitKind::RawPassthrough => Box::new(Passthrough),
            UnitKind::Dummy => Box::new(Passthrough),
        })
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Injected hardware capabilities.
///
/// Everything here is optional: missing hardware degrades to the software
/// paths (or, for JPEG, to a configuration error when a JPEG sink is
/// requested).
#[derive(Clone, Default)]
pub struct PipelineCapabilities {
    /// Hardware 2D crop/scale engine.
    pub blitter: Option<Arc<dyn Blitter>>,
    /// JPEG still encoder.
    pub encoder: Option<Arc<dyn JpegEncoder>>,
}

impl fmt::Debug for PipelineCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCapabilities")
            .field("blitter", &self.blitter.as_ref().map(|b| b.name().to_string()))
            .field("encoder", &self.encoder.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

/// Run a blit on the hardware engine if present, falling back to software
/// when it is absent or fails.
fn blit_with_fallback(
    hw: Option<&Arc<dyn Blitter>>,
    src: &FrameBuffer,
    src_rect: Rect,
    dst: &mut FrameBuffer,
    mirror: bool,
) -> Result<()> {
    if let Some(hw) = hw {
        match hw.transform(src, src_rect, dst, mirror) {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(engine = hw.name(), error = %e, "hardware blit failed, using software fallback");
            }
        }
    }
    SoftwareBlitter.transform(src, src_rect, dst, mirror)
}

/// Crop/scale between the input and output shapes.
pub struct CopyScale {
    blitter: Option<Arc<dyn Blitter>>,
}

impl CopyScale {
    /// Scale through `blitter` when present, software otherwise.
    pub fn new(blitter: Option<Arc<dyn Blitter>>) -> Self {
        Self { blitter }
    }
}

impl FrameProcessor for CopyScale {
    fn process(
        &mut self,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        settings: &ProcessSettings,
    ) -> Result<Disposition> {
        let src = input.descriptor();
        let dst = output.descriptor().clone();

        let crop = Rect::center_crop_for_aspect(src.width, src.height, dst.width, dst.height);
        blit_with_fallback(self.blitter.as_ref(), input, crop, output, settings.mirror)?;
        Ok(Disposition::Done)
    }
}

/// Crop the request's zoom window and scale back to the full shape.
pub struct DigitalZoom {
    blitter: Option<Arc<dyn Blitter>>,
}

impl DigitalZoom {
    /// Zoom through `blitter` when present, software otherwise.
    pub fn new(blitter: Option<Arc<dyn Blitter>>) -> Self {
        Self { blitter }
    }
}

impl FrameProcessor for DigitalZoom {
    fn process(
        &mut self,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        settings: &ProcessSettings,
    ) -> Result<Disposition> {
        let src = input.descriptor().clone();

        let zoom = match settings.zoom {
            Some(z) if z != Rect::full(&src) => z,
            _ => {
                // No zoom requested: straight copy.
                output.copy_from(input)?;
                return Ok(Disposition::Done);
            }
        };

        if !zoom.fits_in(src.width, src.height) {
            return Err(Error::Blit(format!(
                "zoom window {:?} outside {}x{} frame",
                zoom, src.width, src.height
            )));
        }

        blit_with_fallback(self.blitter.as_ref(), input, zoom, output, false)?;
        Ok(Disposition::Done)
    }
}

/// Software lens shading correction.
///
/// Applies a radial gain to the luma plane to compensate vignetting: gain
/// grows quadratically from the optical center up to `1 + strength` at
/// the corners. Chroma passes through.
pub struct LensCorrection {
    strength: f32,
}

impl LensCorrection {
    /// Corner gain of `1 + strength`, clamped to `0.0..=2.0`.
    pub fn new(strength: f32) -> Self {
        Self {
            strength: strength.clamp(0.0, 2.0),
        }
    }
}

impl Default for LensCorrection {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl FrameProcessor for LensCorrection {
    fn process(
        &mut self,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        _settings: &ProcessSettings,
    ) -> Result<Disposition> {
        let desc = input.descriptor().clone();
        if !desc.same_shape(output.descriptor()) {
            return Err(Error::Processing {
                unit: "lens-correction".into(),
                reason: "input and output shapes differ".into(),
            });
        }

        let w = desc.width as usize;
        let h = desc.height as usize;
        let y_len = match desc.format {
            PixelFormat::Nv12 | PixelFormat::Gray8 => w * h,
            other => {
                return Err(Error::Processing {
                    unit: "lens-correction".into(),
                    reason: format!("unsupported format {:?}", other),
                });
            }
        };

        let src = input.as_slice();
        let dst = output.as_mut_slice();

        let cx = (w as f32 - 1.0) / 2.0;
        let cy = (h as f32 - 1.0) / 2.0;
        let r_max_sq = cx * cx + cy * cy;

        for y in 0..h {
            let dy = y as f32 - cy;
            for x in 0..w {
                let dx = x as f32 - cx;
                let gain = 1.0 + self.strength * (dx * dx + dy * dy) / r_max_sq;
                let v = (src[y * w + x] as f32 * gain).round();
                dst[y * w + x] = v.min(255.0) as u8;
            }
        }

        // Chroma is untouched.
        dst[y_len..].copy_from_slice(&src[y_len..]);
        Ok(Disposition::Done)
    }
}

/// Encode the input into the caller's JPEG buffer.
pub struct JpegEncode {
    encoder: Arc<dyn JpegEncoder>,
}

impl JpegEncode {
    /// Encode through the injected still encoder.
    pub fn new(encoder: Arc<dyn JpegEncoder>) -> Self {
        Self { encoder }
    }
}

impl FrameProcessor for JpegEncode {
    fn process(
        &mut self,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        settings: &ProcessSettings,
    ) -> Result<Disposition> {
        let stream = self.encoder.encode(
            input.as_slice(),
            input.descriptor(),
            settings.jpeg_quality,
            &settings.exif,
        )?;

        if stream.len() > output.len() {
            return Err(Error::Encode(format!(
                "encoded stream ({} bytes) exceeds output buffer ({} bytes)",
                stream.len(),
                output.len()
            )));
        }

        output.as_mut_slice()[..stream.len()].copy_from_slice(&stream);
        output.set_payload_len(stream.len());
        Ok(Disposition::Done)
    }
}

/// Relays content unchanged.
///
/// A borrowed output is already the input and nothing moves; a caller
/// buffer gets the frame copied in.
pub struct Passthrough;

impl FrameProcessor for Passthrough {
    fn process(
        &mut self,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        _settings: &ProcessSettings,
    ) -> Result<Disposition> {
        if output.identity() != input.identity() {
            output.copy_from(input)?;
        }
        Ok(Disposition::Done)
    }
}
