//! Frame geometry and pixel format descriptions.

use crate::error::{Error, Result};

/// Pixel formats handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Semi-planar YUV 4:2:0 (Y plane followed by interleaved UV).
    Nv12,
    /// Packed YUV 4:2:2.
    Yuyv,
    /// Single-plane 8-bit luma.
    Gray8,
    /// Compressed JPEG stream.
    Jpeg,
    /// 16-bit raw sensor data, untouched by the pipeline.
    Raw16,
}

impl PixelFormat {
    /// Whether this is a YUV format (requires even dimensions).
    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::Yuyv)
    }

    /// Whether this format carries raw sensor data that must pass through
    /// untransformed.
    pub fn is_raw(&self) -> bool {
        matches!(self, PixelFormat::Raw16)
    }

    /// Buffer size in bytes for a frame of the given dimensions.
    ///
    /// For `Jpeg` this is a worst-case bound (the encoded stream is
    /// variable length).
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Nv12 => w * h * 3 / 2,
            PixelFormat::Yuyv => w * h * 2,
            PixelFormat::Gray8 => w * h,
            // JPEG output lands in a YUV-sized buffer; real streams are
            // far smaller.
            PixelFormat::Jpeg => w * h * 3 / 2,
            PixelFormat::Raw16 => w * h * 2,
        }
    }
}

/// Immutable description of a frame's geometry and layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameDescriptor {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Row stride of the first plane in bytes.
    pub stride: u32,
    /// Total buffer size in bytes.
    pub size: usize,
}

impl FrameDescriptor {
    /// Create a descriptor with tightly packed rows.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Config("dimensions must be non-zero".into()));
        }
        if format.is_yuv() && (width % 2 != 0 || height % 2 != 0) {
            return Err(Error::Config("YUV formats require even dimensions".into()));
        }

        let bytes_per_row = match format {
            PixelFormat::Yuyv | PixelFormat::Raw16 => width * 2,
            _ => width,
        };

        Ok(Self {
            width,
            height,
            format,
            stride: bytes_per_row,
            size: format.buffer_size(width, height),
        })
    }

    /// Whether `other` has the same width, height and format.
    pub fn same_shape(&self, other: &FrameDescriptor) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }
}

/// A rectangular region within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// A rect covering the full frame described by `desc`.
    pub fn full(desc: &FrameDescriptor) -> Self {
        Self {
            x: 0,
            y: 0,
            width: desc.width,
            height: desc.height,
        }
    }

    /// Whether this rect fits entirely inside a `width` x `height` frame.
    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }

    /// Largest centered sub-rect of a `src_w` x `src_h` frame with the
    /// aspect ratio of `dst_w` x `dst_h`.
    ///
    /// Crop dimensions are rounded down to multiples of 4 and the offsets
    /// to multiples of 2, so the result is always usable for 4:2:0 chroma
    /// subsampling and DMA-aligned hardware blitters.
    pub fn center_crop_for_aspect(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        let (mut crop_w, mut crop_h) = if (src_w as u64) * (dst_h as u64) > (dst_w as u64) * (src_h as u64)
        {
            // Source is wider than the target aspect: trim the sides.
            ((src_h as u64 * dst_w as u64 / dst_h as u64) as u32, src_h)
        } else {
            // Source is taller: trim top and bottom.
            (src_w, (src_w as u64 * dst_h as u64 / dst_w as u64) as u32)
        };

        crop_w &= !0x3;
        crop_h &= !0x3;

        let x = ((src_w - crop_w) / 2) & !0x1;
        let y = ((src_h - crop_h) / 2) & !0x1;

        Self {
            x,
            y,
            width: crop_w,
            height: crop_h,
        }
    }
}
