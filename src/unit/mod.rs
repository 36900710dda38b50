//! Processing units.
//!
//! A [`ProcessingUnit`] is one stage of the post-processing pipeline. Each
//! asynchronous unit owns a worker thread fed by a bounded channel; frames
//! arrive via [`FrameListener::notify_frame`], are paired with an output
//! buffer according to the unit's [`BufferPolicy`], run through the unit's
//! [`FrameProcessor`], and the result fans out to the attached listeners.
//!
//! Units never block the capture path on missing buffers: an exhausted
//! pool or a not-yet-arrived caller buffer relays the input downstream
//! unprocessed instead of stalling.

pub mod kinds;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kanal::{Receiver, Sender, bounded};
use smallvec::SmallVec;

use crate::buffer::FrameBuffer;
use crate::error::{Error, Result};
use crate::format::FrameDescriptor;
use crate::pool::BufferPool;
use crate::settings::ProcessSettings;

/// Total time `stop` waits for in-flight frames before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Poll interval while draining.
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Default depth of a unit's input channel.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Outcome attached to a frame as it moves between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Frame was processed normally.
    Ok,
    /// Frame was relayed without processing (disabled unit, exhausted
    /// pool, missing caller buffer). Content is still valid input data.
    Bypassed,
    /// Processing failed; the buffer must still travel to completion so
    /// its owner gets it back.
    Error,
}

impl FrameStatus {
    /// Whether downstream stages should still process this frame.
    pub fn is_processable(&self) -> bool {
        !matches!(self, FrameStatus::Error)
    }
}

/// Receives frames emitted by a unit.
///
/// Implemented by downstream units, the synchronization layer, and the
/// final completion handler.
pub trait FrameListener: Send + Sync {
    /// Deliver one frame with its request settings and status.
    fn notify_frame(
        &self,
        buffer: FrameBuffer,
        settings: Arc<ProcessSettings>,
        status: FrameStatus,
    );
}

/// How a unit obtains its output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Loan from the unit's internal pool.
    Internal,
    /// Reuse the incoming buffer (in-place or passthrough stages).
    Borrowed,
    /// Pop a caller-supplied buffer queued via
    /// [`ProcessingUnit::add_output_buffer`], matched by request id.
    External,
}

/// What the processor did with the frame pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Output is complete; emit it.
    Done,
    /// Output needs more input frames (multi-frame composition); emit
    /// nothing and keep the output for the next input.
    NeedNextInput,
}

/// The per-kind transformation a unit runs.
pub trait FrameProcessor: Send {
    /// Called once per configuration with the negotiated shapes.
    fn prepare(
        &mut self,
        input: &Arc<FrameDescriptor>,
        output: &Arc<FrameDescriptor>,
    ) -> Result<()> {
        let _ = (input, output);
        Ok(())
    }

    /// Transform `input` into `output` under `settings`.
    fn process(
        &mut self,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        settings: &ProcessSettings,
    ) -> Result<Disposition>;
}

struct WorkItem {
    input: FrameBuffer,
    settings: Arc<ProcessSettings>,
    status: FrameStatus,
}

/// Mutable unit state, held only while pairing and processing one frame.
struct UnitInner {
    processor: Box<dyn FrameProcessor>,
    pool: Option<BufferPool>,
    output_desc: Option<Arc<FrameDescriptor>>,
    /// Caller buffers awaiting their request (External policy).
    pending_outputs: VecDeque<FrameBuffer>,
    /// Output carried across inputs after `NeedNextInput`.
    carried_output: Option<FrameBuffer>,
    listeners: SmallVec<[Arc<dyn FrameListener>; 2]>,
}

/// One stage of the pipeline.
pub struct ProcessingUnit {
    name: String,
    policy: BufferPolicy,
    /// External-policy units that must not queue inputs without a caller
    /// buffer to pair them with (still-capture encoders).
    require_output: bool,
    queue_depth: usize,

    enabled: AtomicBool,
    synchronous: AtomicBool,
    /// Frames accepted but not yet fully handled.
    in_flight: AtomicUsize,

    inner: Mutex<UnitInner>,
    tx: Mutex<Option<Sender<WorkItem>>>,
    rx: Mutex<Option<Receiver<WorkItem>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ProcessingUnit {
    /// Create a unit with the given buffer policy and processor.
    pub fn new(name: &str, policy: BufferPolicy, processor: Box<dyn FrameProcessor>) -> Self {
        Self {
            name: name.to_string(),
            policy,
            require_output: false,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            enabled: AtomicBool::new(true),
            synchronous: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            inner: Mutex::new(UnitInner {
                processor,
                pool: None,
                output_desc: None,
                pending_outputs: VecDeque::new(),
                carried_output: None,
                listeners: SmallVec::new(),
            }),
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Refuse to accept inputs while no caller buffer is queued.
    pub fn with_required_output(mut self) -> Self {
        self.require_output = true;
        self
    }

    /// Override the input channel depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Unit name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer policy of this unit.
    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Allocate/replace the internal pool and negotiate shapes.
    ///
    /// Idempotent for equal arguments: an existing pool of the same shape
    /// and capacity is kept.
    pub fn prepare(
        &self,
        input: &Arc<FrameDescriptor>,
        output: &Arc<FrameDescriptor>,
        buffer_count: usize,
    ) -> Result<()> {
        let mut inner = self.lock_inner();

        if self.policy == BufferPolicy::Internal {
            let reuse = inner
                .pool
                .as_ref()
                .is_some_and(|p| p.descriptor().same_shape(output) && p.capacity() == buffer_count);
            if !reuse {
                inner.pool = Some(BufferPool::new(&self.name, Arc::clone(output), buffer_count)?);
            }
        }

        inner.output_desc = Some(Arc::clone(output));
        inner.processor.prepare(input, output)
    }

    /// Attach a downstream listener.
    pub fn attach_listener(&self, listener: Arc<dyn FrameListener>) {
        self.lock_inner().listeners.push(listener);
    }

    /// Drop all listeners.
    pub fn clear_listeners(&self) {
        self.lock_inner().listeners.clear();
    }

    /// Enable or disable processing. Disabled units relay every frame
    /// downstream untouched.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Switch to synchronous mode: frames are processed on the notifying
    /// thread instead of a worker. Must be set before `start`.
    pub fn set_synchronous(&self, synchronous: bool) {
        self.synchronous.store(synchronous, Ordering::Release);
    }

    /// Queue a caller-supplied output buffer (External policy only).
    pub fn add_output_buffer(&self, buffer: FrameBuffer) -> Result<()> {
        if self.policy != BufferPolicy::External {
            return Err(Error::Config(format!(
                "unit '{}' does not take external buffers",
                self.name
            )));
        }
        self.lock_inner().pending_outputs.push_back(buffer);
        Ok(())
    }

    /// Spawn the worker thread. No-op for synchronous units and when
    /// already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.synchronous.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut worker = self.lock_worker();
        if worker.is_some() {
            return Ok(());
        }

        let (tx, rx) = bounded::<WorkItem>(self.queue_depth);
        *self.lock_tx() = Some(tx);
        *self.lock_rx() = Some(rx.clone());

        let unit = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("unit-{}", self.name))
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    unit.handle_item(item);
                    unit.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
                tracing::debug!(unit = %unit.name, "worker stopped");
            })
            .map_err(|e| Error::AllocationFailed(format!("spawn worker: {e}")))?;

        *worker = Some(handle);
        Ok(())
    }

    /// Discard queued work without blocking.
    ///
    /// Queued inputs are dropped (pooled buffers return via RAII); queued
    /// caller buffers are emitted to the listeners with
    /// [`FrameStatus::Error`] so their owners get them back. The frame
    /// currently being processed, if any, finishes normally.
    pub fn flush(&self) {
        // Drain queued inputs through the receiver clone.
        if let Some(rx) = self.lock_rx().as_ref() {
            while let Ok(Some(_item)) = rx.try_recv() {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }

        let (orphaned, listeners) = {
            let mut inner = self.lock_inner();
            inner.carried_output = None;
            let orphaned: Vec<FrameBuffer> = inner.pending_outputs.drain(..).collect();
            (orphaned, inner.listeners.clone())
        };

        if !orphaned.is_empty() {
            tracing::debug!(
                unit = %self.name,
                count = orphaned.len(),
                "flush returning queued caller buffers with error"
            );
        }
        for buf in orphaned {
            let settings = Arc::new(ProcessSettings::for_request(buf.request_id()));
            for listener in &listeners {
                listener.notify_frame(buf.clone(), Arc::clone(&settings), FrameStatus::Error);
            }
        }
    }

    /// Wait until no frames are queued or in process.
    ///
    /// Bounded: gives up after 500 ms and returns `false`.
    pub fn drain(&self) -> bool {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    unit = %self.name,
                    in_flight = self.in_flight.load(Ordering::Acquire),
                    "drain timed out"
                );
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
        true
    }

    /// Drain, close the channel and join the worker.
    ///
    /// A drain timeout is logged and teardown proceeds anyway.
    pub fn stop(&self) {
        self.drain();

        // Closing every sender ends the worker's recv loop.
        self.lock_tx().take();
        self.lock_rx().take();

        if let Some(handle) = self.lock_worker().take() {
            if handle.join().is_err() {
                tracing::error!(unit = %self.name, "worker panicked");
            }
        }

        let mut inner = self.lock_inner();
        inner.carried_output = None;
        inner.pending_outputs.clear();
    }

    /// Number of frames accepted but not yet handled.
    pub fn queued(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, UnitInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tx(&self) -> std::sync::MutexGuard<'_, Option<Sender<WorkItem>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rx(&self) -> std::sync::MutexGuard<'_, Option<Receiver<WorkItem>>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<thread::JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forward(&self, buffer: FrameBuffer, settings: Arc<ProcessSettings>, status: FrameStatus) {
        let listeners = self.lock_inner().listeners.clone();
        for listener in &listeners {
            listener.notify_frame(buffer.clone(), Arc::clone(&settings), status);
        }
    }

    /// Pair the input with an output, run the processor, emit the result.
    fn handle_item(&self, item: WorkItem) {
        let WorkItem {
            input,
            settings,
            status,
        } = item;

        let (emissions, listeners) = {
            let mut inner = self.lock_inner();
            let mut emissions = SmallVec::<[(FrameBuffer, FrameStatus); 2]>::new();
            if status.is_processable() {
                self.pair_and_process(&mut inner, &input, &settings, &mut emissions);
            } else {
                // A failed frame is not processed, but it still releases
                // this unit's caller buffer for the request: without that
                // the buffer would sit queued until a later request
                // supersedes it.
                if self.policy == BufferPolicy::External {
                    if let Some(output) = self.match_external(&mut inner, &settings, &mut emissions)
                    {
                        emissions.push((output, FrameStatus::Error));
                    }
                }
                emissions.push((input.clone(), status));
            }
            (emissions, inner.listeners.clone())
        };

        for (buffer, status) in emissions {
            for listener in &listeners {
                listener.notify_frame(buffer.clone(), Arc::clone(&settings), status);
            }
        }
    }

    /// Pairs, processes and pushes everything to emit for this frame:
    /// dropped stale caller buffers first, then the frame's own result
    /// (nothing when the frame was consumed by `NeedNextInput`).
    fn pair_and_process(
        &self,
        inner: &mut UnitInner,
        input: &FrameBuffer,
        settings: &Arc<ProcessSettings>,
        emissions: &mut SmallVec<[(FrameBuffer, FrameStatus); 2]>,
    ) {
        let mut output = match self.take_output(inner, input, settings, emissions) {
            Some(buf) => buf,
            None => {
                emissions.push((input.clone(), FrameStatus::Bypassed));
                return;
            }
        };

        output.set_request_id(settings.request_id);

        match inner.processor.process(input, &mut output, settings) {
            Ok(Disposition::Done) => emissions.push((output, FrameStatus::Ok)),
            Ok(Disposition::NeedNextInput) => {
                inner.carried_output = Some(output);
            }
            Err(e) => {
                tracing::error!(unit = %self.name, request = settings.request_id, error = %e, "processing failed");
                // The caller's buffer must still come back; hand the
                // output on with error status for External, the input
                // otherwise.
                if self.policy == BufferPolicy::External {
                    emissions.push((output, FrameStatus::Error));
                } else {
                    emissions.push((input.clone(), FrameStatus::Error));
                }
            }
        }
    }

    /// Pick the output buffer for this frame, or `None` to relay the
    /// input unprocessed.
    fn take_output(
        &self,
        inner: &mut UnitInner,
        input: &FrameBuffer,
        settings: &Arc<ProcessSettings>,
        emissions: &mut SmallVec<[(FrameBuffer, FrameStatus); 2]>,
    ) -> Option<FrameBuffer> {
        if let Some(carried) = inner.carried_output.take() {
            return Some(carried);
        }

        match self.policy {
            BufferPolicy::Borrowed => Some(input.clone()),
            BufferPolicy::Internal => {
                let buf = inner.pool.as_ref().and_then(|p| p.acquire());
                if buf.is_none() {
                    tracing::warn!(
                        unit = %self.name,
                        request = settings.request_id,
                        "pool exhausted, relaying frame unprocessed"
                    );
                }
                buf
            }
            BufferPolicy::External => self.match_external(inner, settings, emissions),
        }
    }

    /// Pop the caller buffer for this request.
    ///
    /// Buffers queued for already-superseded requests are emitted with
    /// error so their owner gets them back; a buffer for a future request
    /// stays queued and the frame relays unprocessed.
    fn match_external(
        &self,
        inner: &mut UnitInner,
        settings: &Arc<ProcessSettings>,
        emissions: &mut SmallVec<[(FrameBuffer, FrameStatus); 2]>,
    ) -> Option<FrameBuffer> {
        let request = settings.request_id;

        while let Some(front) = inner.pending_outputs.front() {
            match front.request_id().cmp(&request) {
                std::cmp::Ordering::Less => {
                    if let Some(stale) = inner.pending_outputs.pop_front() {
                        tracing::error!(
                            unit = %self.name,
                            stale_request = stale.request_id(),
                            current_request = request,
                            "dropping stale caller buffer"
                        );
                        emissions.push((stale, FrameStatus::Error));
                    }
                }
                std::cmp::Ordering::Greater => {
                    tracing::warn!(
                        unit = %self.name,
                        queued_request = front.request_id(),
                        current_request = request,
                        "caller buffer is for a future request, relaying frame"
                    );
                    return None;
                }
                std::cmp::Ordering::Equal => return inner.pending_outputs.pop_front(),
            }
        }

        tracing::debug!(
            unit = %self.name,
            request,
            "no caller buffer queued, relaying frame"
        );
        None
    }
}

impl FrameListener for ProcessingUnit {
    fn notify_frame(
        &self,
        buffer: FrameBuffer,
        settings: Arc<ProcessSettings>,
        status: FrameStatus,
    ) {
        if !self.enabled.load(Ordering::Acquire) {
            self.forward(buffer, settings, status);
            return;
        }

        if self.require_output
            && self.policy == BufferPolicy::External
            && self.lock_inner().pending_outputs.is_empty()
        {
            tracing::debug!(
                unit = %self.name,
                request = settings.request_id,
                "no caller buffer queued, dropping frame"
            );
            return;
        }

        let item = WorkItem {
            input: buffer,
            settings,
            status,
        };

        if self.synchronous.load(Ordering::Acquire) {
            self.handle_item(item);
            return;
        }

        let tx = self.lock_tx().clone();
        match tx {
            Some(tx) => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                if tx.send(item).is_err() {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    tracing::warn!(unit = %self.name, "channel closed, frame dropped");
                }
            }
            None => {
                tracing::warn!(unit = %self.name, "unit not started, frame dropped");
            }
        }
    }
}

impl Drop for ProcessingUnit {
    fn drop(&mut self) {
        // Closing the channel here covers units dropped without stop().
        self.lock_tx().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::make_test_buffer;
    use crate::format::PixelFormat;
    use std::sync::Mutex as StdMutex;

    /// Records every notification it receives.
    pub(crate) struct RecordingListener {
        pub frames: StdMutex<Vec<(u64, FrameStatus, usize)>>,
    }

    impl RecordingListener {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: StdMutex::new(Vec::new()),
            })
        }

        pub(crate) fn received(&self) -> Vec<(u64, FrameStatus, usize)> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FrameListener for RecordingListener {
        fn notify_frame(
            &self,
            buffer: FrameBuffer,
            _settings: Arc<ProcessSettings>,
            status: FrameStatus,
        ) {
            self.frames
                .lock()
                .unwrap()
                .push((buffer.request_id(), status, buffer.identity()));
        }
    }

    /// Fills the output with a constant byte.
    struct FillProcessor(u8);

    impl FrameProcessor for FillProcessor {
        fn process(
            &mut self,
            _input: &FrameBuffer,
            output: &mut FrameBuffer,
            _settings: &ProcessSettings,
        ) -> Result<Disposition> {
            output.as_mut_slice().fill(self.0);
            Ok(Disposition::Done)
        }
    }

    struct FailProcessor;

    impl FrameProcessor for FailProcessor {
        fn process(
            &mut self,
            _input: &FrameBuffer,
            _output: &mut FrameBuffer,
            _settings: &ProcessSettings,
        ) -> Result<Disposition> {
            Err(Error::Processing {
                unit: "fail".into(),
                reason: "forced".into(),
            })
        }
    }

    fn desc() -> Arc<FrameDescriptor> {
        Arc::new(FrameDescriptor::new(16, 16, PixelFormat::Nv12).unwrap())
    }

    fn make_unit(policy: BufferPolicy, processor: Box<dyn FrameProcessor>) -> Arc<ProcessingUnit> {
        let unit = Arc::new(ProcessingUnit::new("test", policy, processor));
        unit.prepare(&desc(), &desc(), 2).unwrap();
        unit.set_synchronous(true);
        unit
    }

    fn send(unit: &Arc<ProcessingUnit>, request_id: u64) {
        let mut buf = make_test_buffer(16, 16);
        buf.set_request_id(request_id);
        unit.notify_frame(
            buf,
            Arc::new(ProcessSettings::for_request(request_id)),
            FrameStatus::Ok,
        );
    }

    #[test]
    fn test_internal_unit_processes_into_pool_buffer() {
        let unit = make_unit(BufferPolicy::Internal, Box::new(FillProcessor(0x5A)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        send(&unit, 1);

        let got = sink.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 1);
        assert_eq!(got[0].1, FrameStatus::Ok);
    }

    #[test]
    fn test_pool_exhaustion_relays_unprocessed() {
        let unit = make_unit(BufferPolicy::Internal, Box::new(FillProcessor(1)));
        let sink = RecordingListener::new();

        // Hold every pool buffer by keeping the outputs alive.
        struct Holder(StdMutex<Vec<FrameBuffer>>);
        impl FrameListener for Holder {
            fn notify_frame(
                &self,
                buffer: FrameBuffer,
                _settings: Arc<ProcessSettings>,
                _status: FrameStatus,
            ) {
                self.0.lock().unwrap().push(buffer);
            }
        }
        let holder = Arc::new(Holder(StdMutex::new(Vec::new())));
        unit.attach_listener(holder.clone());
        unit.attach_listener(sink.clone());

        send(&unit, 1);
        send(&unit, 2);
        send(&unit, 3); // pool of 2 exhausted

        let got = sink.received();
        assert_eq!(got[0].1, FrameStatus::Ok);
        assert_eq!(got[1].1, FrameStatus::Ok);
        assert_eq!(got[2].1, FrameStatus::Bypassed);
    }

    #[test]
    fn test_disabled_unit_forwards_untouched() {
        let unit = make_unit(BufferPolicy::Internal, Box::new(FillProcessor(1)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());
        unit.set_enabled(false);

        let mut buf = make_test_buffer(16, 16);
        buf.set_request_id(9);
        let identity = buf.identity();
        unit.notify_frame(
            buf,
            Arc::new(ProcessSettings::for_request(9)),
            FrameStatus::Ok,
        );

        let got = sink.received();
        assert_eq!(got, vec![(9, FrameStatus::Ok, identity)]);
    }

    #[test]
    fn test_borrowed_unit_reuses_input() {
        let unit = make_unit(BufferPolicy::Borrowed, Box::new(FillProcessor(0x77)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        let mut buf = make_test_buffer(16, 16);
        buf.set_request_id(4);
        let identity = buf.identity();
        unit.notify_frame(
            buf.clone(),
            Arc::new(ProcessSettings::for_request(4)),
            FrameStatus::Ok,
        );

        // Output aliases the input.
        assert_eq!(sink.received(), vec![(4, FrameStatus::Ok, identity)]);
        assert!(buf.as_slice().iter().all(|&b| b == 0x77));
    }

    #[test]
    fn test_external_matching_request() {
        let unit = make_unit(BufferPolicy::External, Box::new(FillProcessor(0xAA)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        let mut out = make_test_buffer(16, 16);
        out.set_request_id(5);
        let out_identity = out.identity();
        unit.add_output_buffer(out).unwrap();

        send(&unit, 5);

        assert_eq!(sink.received(), vec![(5, FrameStatus::Ok, out_identity)]);
    }

    #[test]
    fn test_external_stale_buffer_dropped_with_error() {
        let unit = make_unit(BufferPolicy::External, Box::new(FillProcessor(1)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        let mut stale = make_test_buffer(16, 16);
        stale.set_request_id(3);
        unit.add_output_buffer(stale).unwrap();

        // A newer request arrives before request 3's frame ever will.
        send(&unit, 7);

        let got = sink.received();
        assert_eq!(got.len(), 2);
        // The stale caller buffer comes back with error...
        assert_eq!(got[0].0, 3);
        assert_eq!(got[0].1, FrameStatus::Error);
        // ...and the input relays unprocessed.
        assert_eq!(got[1].0, 7);
        assert_eq!(got[1].1, FrameStatus::Bypassed);
    }

    #[test]
    fn test_external_future_buffer_relays_input() {
        let unit = make_unit(BufferPolicy::External, Box::new(FillProcessor(1)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        let mut future = make_test_buffer(16, 16);
        future.set_request_id(9);
        unit.add_output_buffer(future).unwrap();

        send(&unit, 5);

        let got = sink.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 5);
        assert_eq!(got[0].1, FrameStatus::Bypassed);
    }

    #[test]
    fn test_processor_error_reports_error_status() {
        let unit = make_unit(BufferPolicy::Internal, Box::new(FailProcessor));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        send(&unit, 2);

        let got = sink.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, FrameStatus::Error);
    }

    #[test]
    fn test_error_status_passes_through() {
        let unit = make_unit(BufferPolicy::Internal, Box::new(FillProcessor(1)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        let mut buf = make_test_buffer(16, 16);
        buf.set_request_id(1);
        unit.notify_frame(
            buf,
            Arc::new(ProcessSettings::for_request(1)),
            FrameStatus::Error,
        );

        assert_eq!(sink.received()[0].1, FrameStatus::Error);
    }

    #[test]
    fn test_error_frame_releases_matching_caller_buffer() {
        let unit = make_unit(BufferPolicy::External, Box::new(FillProcessor(1)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        let mut out = make_test_buffer(16, 16);
        out.set_request_id(4);
        let out_identity = out.identity();
        unit.add_output_buffer(out).unwrap();

        let mut buf = make_test_buffer(16, 16);
        buf.set_request_id(4);
        unit.notify_frame(
            buf,
            Arc::new(ProcessSettings::for_request(4)),
            FrameStatus::Error,
        );

        let got = sink.received();
        assert_eq!(got.len(), 2);
        // The caller's buffer comes back errored...
        assert_eq!(got[0], (4, FrameStatus::Error, out_identity));
        // ...and the failed input still relays downstream.
        assert_eq!(got[1].1, FrameStatus::Error);
    }

    #[test]
    fn test_midchain_failure_returns_caller_buffer() {
        let failing = make_unit(BufferPolicy::Internal, Box::new(FailProcessor));
        let terminal = make_unit(BufferPolicy::External, Box::new(FillProcessor(1)));
        failing.attach_listener(terminal.clone());
        let sink = RecordingListener::new();
        terminal.attach_listener(sink.clone());

        let mut out = make_test_buffer(16, 16);
        out.set_request_id(1);
        let out_identity = out.identity();
        terminal.add_output_buffer(out).unwrap();

        send(&failing, 1);

        // The upstream failure must not strand request 1's buffer at the
        // terminal: it reaches the listener errored, exactly once.
        let got = sink.received();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&(1, FrameStatus::Error, out_identity)));
        assert!(got.iter().all(|(_, status, _)| *status == FrameStatus::Error));
    }

    #[test]
    fn test_flush_returns_queued_caller_buffers() {
        let unit = make_unit(BufferPolicy::External, Box::new(FillProcessor(1)));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        let mut a = make_test_buffer(16, 16);
        a.set_request_id(1);
        let mut b = make_test_buffer(16, 16);
        b.set_request_id(2);
        unit.add_output_buffer(a).unwrap();
        unit.add_output_buffer(b).unwrap();

        unit.flush();

        let got = sink.received();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|(_, status, _)| *status == FrameStatus::Error));
        assert_eq!(got[0].0, 1);
        assert_eq!(got[1].0, 2);
    }

    #[test]
    fn test_require_output_drops_unmatched_frames() {
        let unit = Arc::new(
            ProcessingUnit::new("enc", BufferPolicy::External, Box::new(FillProcessor(1)))
                .with_required_output(),
        );
        unit.prepare(&desc(), &desc(), 2).unwrap();
        unit.set_synchronous(true);
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        send(&unit, 1); // no caller buffer queued: dropped entirely
        assert!(sink.received().is_empty());

        let mut out = make_test_buffer(16, 16);
        out.set_request_id(2);
        unit.add_output_buffer(out).unwrap();
        send(&unit, 2);
        assert_eq!(sink.received().len(), 1);
    }

    #[test]
    fn test_threaded_unit_processes_and_stops() {
        let unit = Arc::new(ProcessingUnit::new(
            "worker",
            BufferPolicy::Internal,
            Box::new(FillProcessor(0x11)),
        ));
        unit.prepare(&desc(), &desc(), 4).unwrap();
        unit.start().unwrap();

        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        for id in 1..=3 {
            send(&unit, id);
        }

        assert!(unit.drain());
        unit.stop();

        let got = sink.received();
        assert_eq!(got.len(), 3);
        assert_eq!(
            got.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_need_next_input_consumes_frame() {
        /// Emits only every second frame.
        struct PairProcessor {
            seen: usize,
        }
        impl FrameProcessor for PairProcessor {
            fn process(
                &mut self,
                _input: &FrameBuffer,
                _output: &mut FrameBuffer,
                _settings: &ProcessSettings,
            ) -> Result<Disposition> {
                self.seen += 1;
                if self.seen % 2 == 0 {
                    Ok(Disposition::Done)
                } else {
                    Ok(Disposition::NeedNextInput)
                }
            }
        }

        let unit = make_unit(BufferPolicy::Internal, Box::new(PairProcessor { seen: 0 }));
        let sink = RecordingListener::new();
        unit.attach_listener(sink.clone());

        send(&unit, 1);
        assert!(sink.received().is_empty()); // first frame absorbed

        send(&unit, 2);
        assert_eq!(sink.received().len(), 1); // pair complete
    }
}
