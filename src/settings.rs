//! Per-request processing settings.

use crate::format::Rect;

/// Snapshot of the controls that apply to one capture request.
///
/// Taken once at submission and shared (via `Arc`) with every unit that
/// touches a frame of that request, so mid-flight control changes never
/// tear a single frame's processing.
#[derive(Debug, Clone, Default)]
pub struct ProcessSettings {
    /// Monotonically increasing capture request id.
    pub request_id: u64,
    /// Digital zoom crop window in source coordinates. `None` means no
    /// zoom.
    pub zoom: Option<Rect>,
    /// Mirror the frame horizontally (front-facing sensors).
    pub mirror: bool,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Opaque EXIF/maker-note payload forwarded to the encoder.
    pub exif: Vec<u8>,
}

impl ProcessSettings {
    /// Settings for a request with default controls.
    pub fn for_request(request_id: u64) -> Self {
        Self {
            request_id,
            jpeg_quality: 95,
            ..Default::default()
        }
    }
}
