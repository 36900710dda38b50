//! Frame buffer handles.
//!
//! A [`FrameBuffer`] is a cheap-to-clone handle over a reference-counted
//! byte backing. Clones share the backing; per-handle metadata (request id,
//! sink id) is copied, so a unit can stamp its output without touching
//! other holders of the same memory.
//!
//! Buffer *identity* is the address of the backing allocation. The
//! synchronization layer uses it to recognize outputs that alias the
//! pipeline input (zero-copy passthrough).

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::format::FrameDescriptor;

/// Identifies one configured output stream of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(
    /// Stream index assigned by the caller's configuration.
    pub u32,
);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink{}", self.0)
    }
}

/// Who owns a buffer's backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwnership {
    /// Loaned from a unit's internal pool; the slot returns on last drop.
    Pooled,
    /// Borrowed from an upstream stage; passed through unchanged.
    Borrowed,
    /// Supplied by the caller; must be handed back via completion.
    External,
}

/// Heap backing for a frame.
///
/// Interior mutability through a raw pointer, as the pipeline hands each
/// buffer to exactly one processing stage at a time.
pub(crate) struct Backing {
    data: Box<[u8]>,
}

impl Backing {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

// The raw-pointer access above does not change the Send/Sync story of the
// owned Box<[u8]>.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

/// Hook invoked when the last handle to a pooled backing is dropped.
///
/// The buffer pool installs one of these to return the slot.
pub(crate) trait SlotReturn: Send + Sync {
    fn on_last_drop(&self, slot: usize);
}

struct PoolTicket {
    returner: Arc<dyn SlotReturn>,
    slot: usize,
}

impl Drop for PoolTicket {
    fn drop(&mut self) {
        self.returner.on_last_drop(self.slot);
    }
}

/// A frame buffer handle.
#[derive(Clone)]
pub struct FrameBuffer {
    backing: Arc<Backing>,
    descriptor: Arc<FrameDescriptor>,
    ownership: BufferOwnership,
    request_id: u64,
    sink_id: Option<SinkId>,
    /// Valid bytes in the backing; differs from `len()` only for
    /// variable-length payloads (encoded JPEG).
    payload_len: Option<usize>,
    ticket: Option<Arc<PoolTicket>>,
}

impl FrameBuffer {
    /// Allocate a fresh heap-backed buffer sized by `descriptor`.
    pub fn alloc(descriptor: Arc<FrameDescriptor>, ownership: BufferOwnership) -> Self {
        let backing = Backing::new(descriptor.size);

        Self {
            backing: Arc::new(backing),
            descriptor,
            ownership,
            request_id: 0,
            sink_id: None,
            payload_len: None,
            ticket: None,
        }
    }

    /// Build a pooled buffer over an existing backing with a slot-return
    /// ticket. Used by the buffer pool only.
    pub(crate) fn pooled(
        backing: Arc<Backing>,
        descriptor: Arc<FrameDescriptor>,
        returner: Arc<dyn SlotReturn>,
        slot: usize,
    ) -> Self {
        Self {
            backing,
            descriptor,
            ownership: BufferOwnership::Pooled,
            request_id: 0,
            sink_id: None,
            payload_len: None,
            ticket: Some(Arc::new(PoolTicket { returner, slot })),
        }
    }

    /// Backing identity: the address of the underlying allocation.
    ///
    /// Two handles compare equal here exactly when they alias the same
    /// memory.
    pub fn identity(&self) -> usize {
        self.backing.as_ptr() as usize
    }

    /// Frame geometry of this buffer.
    pub fn descriptor(&self) -> &Arc<FrameDescriptor> {
        &self.descriptor
    }

    /// Ownership of the backing memory.
    pub fn ownership(&self) -> BufferOwnership {
        self.ownership
    }

    /// The capture request this buffer belongs to.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Stamp the owning request id on this handle.
    pub fn set_request_id(&mut self, id: u64) {
        self.request_id = id;
    }

    /// The output stream this buffer is destined for, if any.
    pub fn sink_id(&self) -> Option<SinkId> {
        self.sink_id
    }

    /// Tag this handle with its destination stream.
    pub fn set_sink_id(&mut self, sink: SinkId) {
        self.sink_id = Some(sink);
    }

    /// Number of valid payload bytes (the full backing unless a
    /// variable-length encoder set it).
    pub fn payload_len(&self) -> usize {
        self.payload_len.unwrap_or_else(|| self.backing.len())
    }

    /// Record how many bytes of the backing hold valid payload.
    pub fn set_payload_len(&mut self, len: usize) {
        self.payload_len = Some(len.min(self.backing.len()));
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.backing.len()
    }

    /// Whether the backing is zero bytes long.
    pub fn is_empty(&self) -> bool {
        self.backing.len() == 0
    }

    /// Read access to the frame bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.backing.as_ptr(), self.backing.len()) }
    }

    /// Write access to the frame bytes.
    ///
    /// # Safety contract
    ///
    /// The pipeline guarantees a buffer is written by at most one stage at
    /// a time; concurrent writers through separate clones are a logic bug
    /// upstream of this call.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.backing.as_ptr(), self.backing.len()) }
    }

    /// Copy the full contents of `src` into this buffer.
    pub fn copy_from(&mut self, src: &FrameBuffer) -> Result<()> {
        if src.len() > self.len() {
            return Err(Error::AllocationFailed(format!(
                "copy source ({} bytes) exceeds destination ({} bytes)",
                src.len(),
                self.len()
            )));
        }
        let n = src.len();
        self.as_mut_slice()[..n].copy_from_slice(src.as_slice());
        Ok(())
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("identity", &format_args!("{:#x}", self.identity()))
            .field("descriptor", &*self.descriptor)
            .field("ownership", &self.ownership)
            .field("request_id", &self.request_id)
            .field("sink_id", &self.sink_id)
            .finish()
    }
}

/// Allocates caller-side frame buffers.
///
/// Injected where buffers must come from a platform allocator (gralloc,
/// dmabuf heaps); the default heap implementation suffices for tests and
/// software pipelines.
pub trait BufferAllocator: Send + Sync {
    /// Allocate one buffer for `descriptor`.
    fn allocate(&self, descriptor: &Arc<FrameDescriptor>) -> Result<FrameBuffer>;
}

/// Plain heap allocator.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, descriptor: &Arc<FrameDescriptor>) -> Result<FrameBuffer> {
        Ok(FrameBuffer::alloc(
            Arc::clone(descriptor),
            BufferOwnership::External,
        ))
    }
}

#[cfg(test)]
pub(crate) fn make_test_buffer(width: u32, height: u32) -> FrameBuffer {
    use crate::format::PixelFormat;

    let desc = Arc::new(FrameDescriptor::new(width, height, PixelFormat::Nv12).unwrap());
    FrameBuffer::alloc(desc, BufferOwnership::External)
}
