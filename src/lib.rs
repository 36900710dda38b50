//! # Framepipe
//!
//! A post-capture frame processing pipeline for camera stacks.
//!
//! Framepipe takes frames from a capture device and fans them out to any
//! number of caller-owned sink buffers, running the transformations each
//! sink needs: scaling and cropping, digital zoom, lens shading
//! correction, JPEG encoding, raw passthrough. Processing units run on
//! their own threads connected by bounded channels, a synchronization
//! layer makes shared intermediate buffers complete exactly once per
//! consumer, and a coordinator reorders out-of-order capture completions
//! back into submission order.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use framepipe::prelude::*;
//!
//! let dispatcher = Arc::new(PipelineDispatcher::new(capabilities, completion));
//! dispatcher.configure(&source_descriptor, &sinks, &BuildOptions::default())?;
//! dispatcher.start()?;
//!
//! let coordinator = CaptureCoordinator::new(dispatcher, completion)
//!     .with_source(camera);
//! coordinator.start()?;
//! coordinator.submit(output_buffers, settings)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod blit;
pub mod buffer;
pub mod coordinator;
pub mod dispatcher;
pub mod encode;
pub mod error;
pub mod format;
pub mod graph;
pub mod pool;
pub mod settings;
pub mod sync;
pub mod unit;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::blit::{Blitter, SoftwareBlitter};
    pub use crate::buffer::{BufferAllocator, BufferOwnership, FrameBuffer, SinkId};
    pub use crate::coordinator::{CaptureCoordinator, FrameSource};
    pub use crate::dispatcher::{CompletionHandler, PipelineDispatcher, PipelineState};
    pub use crate::encode::JpegEncoder;
    pub use crate::error::{Error, Result};
    pub use crate::format::{FrameDescriptor, PixelFormat, Rect};
    pub use crate::graph::{BuildOptions, Requirement, SinkConfig};
    pub use crate::settings::ProcessSettings;
    pub use crate::unit::kinds::PipelineCapabilities;
    pub use crate::unit::{FrameListener, FrameStatus, ProcessingUnit};
}

pub use error::{Error, Result};
