//! Fixed-capacity frame buffer pools.
//!
//! Each processing unit with internal ownership carries one of these.
//! Acquisition is lock-free and non-blocking: an exhausted pool tells the
//! unit to relay the frame unprocessed rather than stall the capture path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::{Backing, FrameBuffer, SlotReturn};
use crate::error::{Error, Result};
use crate::format::FrameDescriptor;

/// A lock-free bitmap for tracking slot allocation.
///
/// Uses atomic operations to allow concurrent allocation and deallocation
/// without locks. Each bit represents one slot: 0 = free, 1 = allocated.
pub struct AtomicBitmap {
    /// Array of atomic 64-bit words.
    words: Box<[AtomicU64]>,
    /// Total number of slots (may be less than words.len() * 64).
    num_slots: usize,
}

impl AtomicBitmap {
    /// Create a new bitmap with all slots free.
    pub fn new(num_slots: usize) -> Self {
        let num_words = num_slots.div_ceil(64);
        let words: Vec<AtomicU64> = (0..num_words).map(|_| AtomicU64::new(0)).collect();

        Self {
            words: words.into_boxed_slice(),
            num_slots,
        }
    }

    /// Try to acquire a free slot.
    ///
    /// Returns the slot index if successful, or `None` if all slots are
    /// allocated. Lock-free and thread-safe.
    pub fn acquire_slot(&self) -> Option<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            loop {
                let current = word.load(Ordering::Relaxed);

                // All bits set? Try next word.
                if current == u64::MAX {
                    break;
                }

                let bit_idx = (!current).trailing_zeros() as usize;
                let slot_idx = word_idx * 64 + bit_idx;

                if slot_idx >= self.num_slots {
                    return None;
                }

                let new_value = current | (1u64 << bit_idx);
                match word.compare_exchange_weak(
                    current,
                    new_value,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(slot_idx),
                    Err(_) => continue, // Another thread modified; retry
                }
            }
        }

        None
    }

    /// Release a previously acquired slot.
    ///
    /// Returns `false` if the slot was already free (a double release) or
    /// out of bounds; the bitmap is left unchanged in that case.
    pub fn release_slot(&self, slot_idx: usize) -> bool {
        if slot_idx >= self.num_slots {
            return false;
        }

        let word_idx = slot_idx / 64;
        let bit = 1u64 << (slot_idx % 64);

        let prev = self.words[word_idx].fetch_and(!bit, Ordering::Release);
        prev & bit != 0
    }

    /// Check if a slot is currently allocated.
    ///
    /// Note: this is a snapshot and may change immediately after returning.
    pub fn is_allocated(&self, slot_idx: usize) -> bool {
        if slot_idx >= self.num_slots {
            return false;
        }

        let word_idx = slot_idx / 64;
        let bit_idx = slot_idx % 64;

        (self.words[word_idx].load(Ordering::Relaxed) & (1u64 << bit_idx)) != 0
    }

    /// Count the number of free slots.
    ///
    /// Note: this is a snapshot and may change immediately after returning.
    pub fn count_free(&self) -> usize {
        let allocated: usize = self
            .words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                let bits = word.load(Ordering::Relaxed);
                if i == self.words.len() - 1 {
                    // Last word may have unused bits
                    let valid_bits = self.num_slots - i * 64;
                    if valid_bits >= 64 {
                        bits.count_ones() as usize
                    } else {
                        (bits & ((1u64 << valid_bits) - 1)).count_ones() as usize
                    }
                } else {
                    bits.count_ones() as usize
                }
            })
            .sum();

        self.num_slots - allocated
    }

    /// Get the total number of slots.
    pub fn capacity(&self) -> usize {
        self.num_slots
    }
}

struct PoolInner {
    name: String,
    descriptor: Arc<FrameDescriptor>,
    backings: Vec<Arc<Backing>>,
    bitmap: AtomicBitmap,
}

impl SlotReturn for PoolInner {
    fn on_last_drop(&self, slot: usize) {
        if !self.bitmap.release_slot(slot) {
            tracing::warn!(
                pool = %self.name,
                slot,
                "double release of pool slot ignored"
            );
        }
    }
}

/// A pool of same-shaped frame buffers with RAII return.
///
/// All backings are allocated up front; [`BufferPool::acquire`] only flips
/// a bitmap bit and wraps the slot in a [`FrameBuffer`]. When the last
/// clone of that buffer drops, the slot is returned automatically.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers shaped by `descriptor`.
    pub fn new(name: &str, descriptor: Arc<FrameDescriptor>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::AllocationFailed(format!(
                "pool '{name}' needs at least one buffer"
            )));
        }

        let backings = (0..capacity)
            .map(|_| Arc::new(Backing::new(descriptor.size)))
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                descriptor,
                backings,
                bitmap: AtomicBitmap::new(capacity),
            }),
        })
    }

    /// Acquire a free buffer, or `None` if the pool is exhausted.
    ///
    /// Never blocks. Exhaustion is an expected transient state handled by
    /// the caller, not an error.
    pub fn acquire(&self) -> Option<FrameBuffer> {
        let slot = self.inner.bitmap.acquire_slot()?;

        Some(FrameBuffer::pooled(
            Arc::clone(&self.inner.backings[slot]),
            Arc::clone(&self.inner.descriptor),
            Arc::clone(&self.inner) as Arc<dyn SlotReturn>,
            slot,
        ))
    }

    /// Shape of the buffers in this pool.
    pub fn descriptor(&self) -> &Arc<FrameDescriptor> {
        &self.inner.descriptor
    }

    /// Total number of buffers.
    pub fn capacity(&self) -> usize {
        self.inner.bitmap.capacity()
    }

    /// Number of currently free buffers.
    pub fn available(&self) -> usize {
        self.inner.bitmap.count_free()
    }
}
