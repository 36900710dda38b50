//! Fan-out completion synchronization.
//!
//! When the dispatcher hands the caller's own buffer to the pipeline as
//! the shared input (zero-copy: one sink reads the frame in place while
//! the others copy from it), that buffer must not reach completion until
//! every chain reading from it has finished. [`SyncRegistry`] sits
//! between the terminal units and the completion handler and holds the
//! whole fan-out group back until its last member reports in, then
//! forwards every recorded completion exactly once.
//!
//! Buffers are tracked by backing identity; a frame that was never
//! registered (no aliasing, single output) passes straight through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffer::FrameBuffer;
use crate::settings::ProcessSettings;
use crate::unit::{FrameListener, FrameStatus};

struct SyncItem {
    /// Identities mapped to this item, removed together at completion.
    keys: Vec<usize>,
    /// Completions still outstanding.
    expected: usize,
    recorded: Vec<(FrameBuffer, Arc<ProcessSettings>, FrameStatus)>,
}

/// Holds fan-out groups until all their completions arrived.
pub struct SyncRegistry {
    items: Mutex<HashMap<usize, Arc<Mutex<SyncItem>>>>,
    downstream: Arc<dyn FrameListener>,
}

impl SyncRegistry {
    /// Forward released completions to `downstream`.
    pub fn new(downstream: Arc<dyn FrameListener>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            downstream,
        }
    }

    /// Register one request's fan-out group.
    ///
    /// A group forms only when several outputs are in flight and at least
    /// one of them aliases the input backing; anything else needs no
    /// synchronization and is not tracked. Returns whether a group was
    /// created.
    pub fn register(&self, input: &FrameBuffer, outputs: &[FrameBuffer]) -> bool {
        if outputs.len() < 2 {
            return false;
        }
        let aliased = outputs.iter().any(|o| o.identity() == input.identity());
        if !aliased {
            return false;
        }

        let keys: Vec<usize> = outputs.iter().map(|o| o.identity()).collect();
        let item = Arc::new(Mutex::new(SyncItem {
            keys: keys.clone(),
            expected: outputs.len(),
            recorded: Vec::with_capacity(outputs.len()),
        }));

        let mut map = self.lock_items();
        for key in keys {
            if map.insert(key, Arc::clone(&item)).is_some() {
                tracing::warn!(
                    identity = format_args!("{key:#x}"),
                    "buffer re-registered while still in a sync group"
                );
            }
        }
        true
    }

    /// Drop every tracked group without forwarding (reconfigure/stop).
    pub fn clear(&self) {
        self.lock_items().clear();
    }

    /// Number of identities currently held back.
    pub fn tracked(&self) -> usize {
        self.lock_items().len()
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Arc<Mutex<SyncItem>>>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameListener for SyncRegistry {
    fn notify_frame(
        &self,
        buffer: FrameBuffer,
        settings: Arc<ProcessSettings>,
        status: FrameStatus,
    ) {
        let item = self.lock_items().get(&buffer.identity()).cloned();

        let Some(item) = item else {
            self.downstream.notify_frame(buffer, settings, status);
            return;
        };

        let complete = {
            let mut item = item.lock().unwrap_or_else(|e| e.into_inner());
            item.recorded.push((buffer, settings, status));
            item.recorded.len() >= item.expected
        };

        if !complete {
            return;
        }

        // Last member arrived: release the whole group.
        let (keys, recorded) = {
            let mut item = item.lock().unwrap_or_else(|e| e.into_inner());
            (std::mem::take(&mut item.keys), std::mem::take(&mut item.recorded))
        };
        {
            let mut map = self.lock_items();
            for key in &keys {
                map.remove(key);
            }
        }
        for (buffer, settings, status) in recorded {
            self.downstream.notify_frame(buffer, settings, status);
        }
    }
}
