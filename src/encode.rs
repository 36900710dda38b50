//! JPEG encode capability.
//!
//! The pipeline never encodes JPEG itself: an encoder (hardware codec or a
//! software library binding) is injected behind this trait and driven by
//! the JPEG processing unit.

use std::sync::Arc;

use crate::error::Result;
use crate::format::FrameDescriptor;

/// A JPEG still encoder.
pub trait JpegEncoder: Send + Sync {
    /// Encode one YUV frame.
    ///
    /// `quality` is 1..=100; `exif` is an opaque application segment
    /// payload prepended to the stream (empty slice for none). Returns the
    /// complete JPEG byte stream.
    fn encode(
        &self,
        frame: &[u8],
        descriptor: &Arc<FrameDescriptor>,
        quality: u8,
        exif: &[u8],
    ) -> Result<Vec<u8>>;

    /// Short name for logs.
    fn name(&self) -> &str;
}
