//! Pipeline dispatcher.
//!
//! [`PipelineDispatcher`] turns a planned [`crate::graph::PipelineGraph`] into live
//! units and drives frames through them. All frame routing happens on a
//! dedicated message thread fed by a bounded channel, so
//! [`PipelineDispatcher::process_frame`] only enqueues and returns.
//!
//! Lifecycle: `Unconfigured -> Configuring -> Ready <-> Dispatching`.
//! Reconfiguration drains and tears down the previous units first;
//! closing the message channel is what ends the dispatcher thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use kanal::{Sender, bounded};

use crate::buffer::{FrameBuffer, SinkId};
use crate::error::{Error, Result};
use crate::format::FrameDescriptor;
use crate::graph::{BuildOptions, SinkConfig, build_graph};
use crate::settings::ProcessSettings;
use crate::sync::SyncRegistry;
use crate::unit::kinds::PipelineCapabilities;
use crate::unit::{FrameListener, FrameStatus, ProcessingUnit};

/// Depth of the dispatcher's message channel.
const DISPATCH_QUEUE_DEPTH: usize = 32;

/// Receives finished frames and request failures.
///
/// Callbacks fire on pipeline worker threads; implementations must be
/// quick and must not call back into the dispatcher.
pub trait CompletionHandler: Send + Sync {
    /// One sink's buffer for `request_id` is done. Fires exactly once per
    /// caller buffer, also on failure (with [`FrameStatus::Error`]).
    fn on_buffer_ready(
        &self,
        request_id: u64,
        sink: SinkId,
        buffer: FrameBuffer,
        status: FrameStatus,
    );

    /// The whole request failed before its buffers entered the pipeline.
    fn on_request_error(&self, request_id: u64);
}

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No configuration applied.
    Unconfigured,
    /// Units are being built.
    Configuring,
    /// Configured and quiescent.
    Ready,
    /// Accepting frames.
    Dispatching,
}

impl PipelineState {
    fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Unconfigured => "unconfigured",
            PipelineState::Configuring => "configuring",
            PipelineState::Ready => "ready",
            PipelineState::Dispatching => "dispatching",
        }
    }
}

enum DispatchMessage {
    ProcessFrame {
        input: FrameBuffer,
        outputs: Vec<FrameBuffer>,
        settings: Arc<ProcessSettings>,
    },
    Flush {
        done: Sender<()>,
    },
}

/// Live units of the current configuration.
struct ActivePipeline {
    entries: Vec<Arc<ProcessingUnit>>,
    routes: HashMap<SinkId, Arc<ProcessingUnit>>,
    /// Units grouped upstream-first, for ordered drain/stop.
    levels: Vec<Vec<Arc<ProcessingUnit>>>,
    sync: Arc<SyncRegistry>,
    source: Arc<FrameDescriptor>,
}

/// Forwards released frames to the completion handler.
///
/// Frames without a sink tag are internal relays whose buffers return by
/// ref-count; the caller never sees them.
struct CompletionBridge {
    completion: Arc<dyn CompletionHandler>,
}

impl FrameListener for CompletionBridge {
    fn notify_frame(
        &self,
        buffer: FrameBuffer,
        _settings: Arc<ProcessSettings>,
        status: FrameStatus,
    ) {
        match buffer.sink_id() {
            Some(sink) => {
                self.completion
                    .on_buffer_ready(buffer.request_id(), sink, buffer, status);
            }
            None => {
                tracing::trace!(
                    request = buffer.request_id(),
                    "untargeted frame reached completion, recycling"
                );
            }
        }
    }
}

/// Owns the processing units and the dispatch thread.
pub struct PipelineDispatcher {
    caps: PipelineCapabilities,
    completion: Arc<dyn CompletionHandler>,
    state: Mutex<PipelineState>,
    active: Arc<Mutex<Option<ActivePipeline>>>,
    tx: Mutex<Option<Sender<DispatchMessage>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PipelineDispatcher {
    /// Create an unconfigured dispatcher.
    pub fn new(caps: PipelineCapabilities, completion: Arc<dyn CompletionHandler>) -> Self {
        Self {
            caps,
            completion,
            state: Mutex::new(PipelineState::Unconfigured),
            active: Arc::new(Mutex::new(None)),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    /// Build and start units for `source` feeding `sinks`.
    ///
    /// Callable from any state except `Configuring`; an existing
    /// configuration is drained and torn down first.
    pub fn configure(
        &self,
        source: &Arc<FrameDescriptor>,
        sinks: &[SinkConfig],
        options: &BuildOptions,
    ) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state == PipelineState::Configuring {
                return Err(Error::InvalidState {
                    expected: "not configuring",
                    actual: state.as_str(),
                });
            }
            *state = PipelineState::Configuring;
        }

        self.teardown_active();

        let result = self.build_active(source, sinks, options);
        let mut state = self.lock_state();
        match result {
            Ok(()) => {
                *state = PipelineState::Ready;
                Ok(())
            }
            Err(e) => {
                *state = PipelineState::Unconfigured;
                Err(e)
            }
        }
    }

    /// Begin accepting frames.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            PipelineState::Ready | PipelineState::Dispatching => {
                *state = PipelineState::Dispatching;
                Ok(())
            }
            other => Err(Error::InvalidState {
                expected: "ready",
                actual: other.as_str(),
            }),
        }
    }

    /// Enqueue one frame for processing. Non-blocking; routing and unit
    /// hand-off happen on the dispatcher thread.
    ///
    /// Every output must carry a sink tag matching the configuration.
    /// `settings.request_id` is stamped onto the input and all outputs.
    pub fn process_frame(
        &self,
        mut input: FrameBuffer,
        mut outputs: Vec<FrameBuffer>,
        settings: Arc<ProcessSettings>,
    ) -> Result<()> {
        {
            let state = self.lock_state();
            if *state != PipelineState::Dispatching {
                return Err(Error::InvalidState {
                    expected: "dispatching",
                    actual: state.as_str(),
                });
            }
        }
        {
            let active = self.lock_active();
            let active = active.as_ref().ok_or(Error::InvalidState {
                expected: "configured",
                actual: "unconfigured",
            })?;
            for out in &outputs {
                let sink = out.sink_id().ok_or_else(|| {
                    Error::Config("output buffer has no sink tag".into())
                })?;
                if !active.routes.contains_key(&sink) {
                    return Err(Error::Config(format!("{sink} is not configured")));
                }
            }
            if !input.descriptor().same_shape(&active.source) {
                return Err(Error::Config(format!(
                    "input shape {}x{} does not match configured source {}x{}",
                    input.descriptor().width,
                    input.descriptor().height,
                    active.source.width,
                    active.source.height
                )));
            }
        }

        input.set_request_id(settings.request_id);
        for out in &mut outputs {
            out.set_request_id(settings.request_id);
        }

        let tx = self.lock_tx().clone().ok_or_else(|| {
            Error::ChannelClosed("dispatcher thread not running".into())
        })?;
        tx.send(DispatchMessage::ProcessFrame {
            input,
            outputs,
            settings,
        })
        .map_err(|_| Error::ChannelClosed("dispatcher thread stopped".into()))
    }

    /// Discard all queued work.
    ///
    /// Runs on the dispatcher thread so it serializes with in-flight
    /// frames; queued caller buffers come back through the completion
    /// handler with error status. Blocks until done.
    pub fn flush(&self) -> Result<()> {
        let tx = self.lock_tx().clone().ok_or_else(|| {
            Error::ChannelClosed("dispatcher thread not running".into())
        })?;

        let (done_tx, done_rx) = bounded::<()>(1);
        tx.send(DispatchMessage::Flush { done: done_tx })
            .map_err(|_| Error::ChannelClosed("dispatcher thread stopped".into()))?;
        // Sender dropped either after the ack or with the thread.
        let _ = done_rx.recv();
        Ok(())
    }

    /// Stop accepting frames and quiesce every unit, upstream first.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            match *state {
                PipelineState::Dispatching | PipelineState::Ready => {
                    *state = PipelineState::Ready;
                }
                other => {
                    return Err(Error::InvalidState {
                        expected: "dispatching",
                        actual: other.as_str(),
                    });
                }
            }
        }

        let levels: Vec<Vec<Arc<ProcessingUnit>>> = {
            let active = self.lock_active();
            active.as_ref().map(|a| a.levels.clone()).unwrap_or_default()
        };
        for level in &levels {
            for unit in level {
                unit.drain();
            }
        }
        for level in &levels {
            for unit in level {
                unit.stop();
            }
        }
        Ok(())
    }

    fn build_active(
        &self,
        source: &Arc<FrameDescriptor>,
        sinks: &[SinkConfig],
        options: &BuildOptions,
    ) -> Result<()> {
        let graph = build_graph(source, sinks, options)?;
        let sync = Arc::new(SyncRegistry::new(Arc::new(CompletionBridge {
            completion: Arc::clone(&self.completion),
        })));

        // Instantiate the units.
        let mut units = HashMap::new();
        for id in graph.nodes() {
            let spec = graph.node(id);
            let processor = spec.kind.make_processor(&self.caps)?;
            let mut unit = ProcessingUnit::new(&spec.name, spec.policy, processor);
            if spec.kind.needs_output_to_enqueue() {
                unit = unit.with_required_output();
            }
            let unit = Arc::new(unit);
            unit.prepare(&spec.input, &spec.output, spec.buffer_count)?;
            units.insert(id, unit);
        }

        // Wire the chains, terminals into the sync layer.
        for id in graph.nodes() {
            let unit = &units[&id];
            for child in graph.children(id) {
                unit.attach_listener(Arc::clone(&units[&child]) as Arc<dyn FrameListener>);
            }
            if graph.node(id).terminal_for.is_some() {
                unit.attach_listener(Arc::clone(&sync) as Arc<dyn FrameListener>);
            }
        }

        for unit in units.values() {
            unit.start()?;
        }

        let entries = graph.entries().iter().map(|id| Arc::clone(&units[id])).collect();
        let routes = graph
            .routes()
            .iter()
            .map(|(sink, id)| (*sink, Arc::clone(&units[id])))
            .collect();
        let levels = graph
            .levels()
            .iter()
            .map(|level| level.iter().map(|id| Arc::clone(&units[id])).collect())
            .collect();

        tracing::info!(
            units = graph.node_count(),
            sinks = sinks.len(),
            passthrough = graph.passthrough(),
            "pipeline configured"
        );

        *self.lock_active() = Some(ActivePipeline {
            entries,
            routes,
            levels,
            sync,
            source: Arc::clone(source),
        });

        self.ensure_worker()
    }

    fn ensure_worker(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            return Ok(());
        }

        let (tx, rx) = bounded::<DispatchMessage>(DISPATCH_QUEUE_DEPTH);
        *self.lock_tx() = Some(tx);

        let active = Arc::clone(&self.active);
        let handle = thread::Builder::new()
            .name("pipeline-dispatch".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        DispatchMessage::ProcessFrame {
                            input,
                            outputs,
                            settings,
                        } => {
                            Self::route_frame(&active, input, outputs, settings);
                        }
                        DispatchMessage::Flush { done } => {
                            Self::handle_flush(&active);
                            let _ = done.send(());
                        }
                    }
                }
                tracing::debug!("dispatcher thread stopped");
            })
            .map_err(|e| Error::AllocationFailed(format!("spawn dispatcher: {e}")))?;

        *worker = Some(handle);
        Ok(())
    }

    /// Register the fan-out group, queue the caller buffers at their
    /// terminals, then feed every first-level unit.
    fn route_frame(
        active: &Arc<Mutex<Option<ActivePipeline>>>,
        input: FrameBuffer,
        outputs: Vec<FrameBuffer>,
        settings: Arc<ProcessSettings>,
    ) {
        let guard = active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(active) = guard.as_ref() else {
            tracing::warn!(
                request = settings.request_id,
                "frame arrived with no active pipeline, dropped"
            );
            return;
        };

        active.sync.register(&input, &outputs);

        for out in outputs {
            // Validated against the routes at submission.
            let sink = match out.sink_id() {
                Some(sink) => sink,
                None => continue,
            };
            if let Some(unit) = active.routes.get(&sink) {
                if let Err(e) = unit.add_output_buffer(out) {
                    tracing::error!(%sink, error = %e, "failed to queue caller buffer");
                }
            }
        }

        for entry in &active.entries {
            entry.notify_frame(input.clone(), Arc::clone(&settings), FrameStatus::Ok);
        }
    }

    fn handle_flush(active: &Arc<Mutex<Option<ActivePipeline>>>) {
        let guard = active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(active) = guard.as_ref() else {
            return;
        };

        for level in &active.levels {
            for unit in level {
                unit.flush();
            }
        }
        active.sync.clear();
    }

    /// Drain, stop and drop the current units.
    fn teardown_active(&self) {
        let active = self.lock_active().take();
        if let Some(active) = active {
            for level in &active.levels {
                for unit in level {
                    unit.drain();
                }
            }
            for level in &active.levels {
                for unit in level {
                    unit.stop();
                    unit.clear_listeners();
                }
            }
            active.sync.clear();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActivePipeline>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tx(&self) -> std::sync::MutexGuard<'_, Option<Sender<DispatchMessage>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<thread::JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PipelineDispatcher {
    fn drop(&mut self) {
        self.teardown_active();
        self.lock_tx().take();
        if let Some(handle) = self.lock_worker().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferOwnership, FrameBuffer};
    use crate::format::PixelFormat;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    pub(crate) struct RecordingCompletion {
        pub ready: StdMutex<Vec<(u64, SinkId, FrameStatus)>>,
        pub errors: StdMutex<Vec<u64>>,
    }

    impl RecordingCompletion {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                ready: StdMutex::new(Vec::new()),
                errors: StdMutex::new(Vec::new()),
            })
        }

        pub(crate) fn ready_count(&self) -> usize {
            self.ready.lock().unwrap().len()
        }
    }

    impl CompletionHandler for RecordingCompletion {
        fn on_buffer_ready(
            &self,
            request_id: u64,
            sink: SinkId,
            _buffer: FrameBuffer,
            status: FrameStatus,
        ) {
            self.ready.lock().unwrap().push((request_id, sink, status));
        }

        fn on_request_error(&self, request_id: u64) {
            self.errors.lock().unwrap().push(request_id);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn nv12(w: u32, h: u32) -> Arc<FrameDescriptor> {
        Arc::new(FrameDescriptor::new(w, h, PixelFormat::Nv12).unwrap())
    }

    fn output_for(desc: &Arc<FrameDescriptor>, sink: SinkId, request: u64) -> FrameBuffer {
        let mut buf = FrameBuffer::alloc(Arc::clone(desc), BufferOwnership::External);
        buf.set_sink_id(sink);
        buf.set_request_id(request);
        buf
    }

    #[test]
    fn test_process_before_configure_fails() {
        let completion = RecordingCompletion::new();
        let dispatcher =
            PipelineDispatcher::new(PipelineCapabilities::default(), completion.clone());

        let input = FrameBuffer::alloc(nv12(64, 64), BufferOwnership::Borrowed);
        let err = dispatcher
            .process_frame(input, vec![], Arc::new(ProcessSettings::for_request(1)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_single_sink_round_trip() {
        let completion = RecordingCompletion::new();
        let dispatcher =
            PipelineDispatcher::new(PipelineCapabilities::default(), completion.clone());

        let source = nv12(64, 64);
        let sinks = [SinkConfig {
            id: SinkId(0),
            descriptor: Arc::clone(&source),
        }];
        dispatcher
            .configure(&source, &sinks, &BuildOptions::default())
            .unwrap();
        assert_eq!(dispatcher.state(), PipelineState::Ready);
        dispatcher.start().unwrap();
        assert_eq!(dispatcher.state(), PipelineState::Dispatching);

        let mut input = FrameBuffer::alloc(Arc::clone(&source), BufferOwnership::Borrowed);
        input.as_mut_slice().fill(0x42);
        let output = output_for(&source, SinkId(0), 1);
        let out_handle = output.clone();

        dispatcher
            .process_frame(input, vec![output], Arc::new(ProcessSettings::for_request(1)))
            .unwrap();

        assert!(wait_until(|| completion.ready_count() == 1));
        let got = completion.ready.lock().unwrap().clone();
        assert_eq!(got, vec![(1, SinkId(0), FrameStatus::Ok)]);
        // Passthrough copied the frame into the caller's buffer.
        assert!(out_handle.as_slice().iter().all(|&b| b == 0x42));

        dispatcher.stop().unwrap();
        assert_eq!(dispatcher.state(), PipelineState::Ready);
    }

    #[test]
    fn test_two_sinks_complete_independently() {
        let completion = RecordingCompletion::new();
        let dispatcher =
            PipelineDispatcher::new(PipelineCapabilities::default(), completion.clone());

        let source = nv12(128, 96);
        let sinks = [
            SinkConfig {
                id: SinkId(0),
                descriptor: nv12(64, 48),
            },
            SinkConfig {
                id: SinkId(1),
                descriptor: nv12(32, 24),
            },
        ];
        dispatcher
            .configure(&source, &sinks, &BuildOptions::default())
            .unwrap();
        dispatcher.start().unwrap();

        for request in 1..=3u64 {
            let input = FrameBuffer::alloc(Arc::clone(&source), BufferOwnership::Borrowed);
            let outputs = vec![
                output_for(&sinks[0].descriptor, SinkId(0), request),
                output_for(&sinks[1].descriptor, SinkId(1), request),
            ];
            dispatcher
                .process_frame(
                    input,
                    outputs,
                    Arc::new(ProcessSettings::for_request(request)),
                )
                .unwrap();
        }

        assert!(wait_until(|| completion.ready_count() == 6));
        let got = completion.ready.lock().unwrap().clone();
        for request in 1..=3u64 {
            for sink in [SinkId(0), SinkId(1)] {
                assert_eq!(
                    got.iter()
                        .filter(|(r, s, _)| *r == request && *s == sink)
                        .count(),
                    1,
                    "request {request} {sink} must complete exactly once"
                );
            }
        }
    }

    #[test]
    fn test_unknown_sink_rejected() {
        let completion = RecordingCompletion::new();
        let dispatcher =
            PipelineDispatcher::new(PipelineCapabilities::default(), completion.clone());

        let source = nv12(64, 64);
        let sinks = [SinkConfig {
            id: SinkId(0),
            descriptor: Arc::clone(&source),
        }];
        dispatcher
            .configure(&source, &sinks, &BuildOptions::default())
            .unwrap();
        dispatcher.start().unwrap();

        let input = FrameBuffer::alloc(Arc::clone(&source), BufferOwnership::Borrowed);
        let output = output_for(&source, SinkId(9), 1);
        assert!(dispatcher
            .process_frame(input, vec![output], Arc::new(ProcessSettings::for_request(1)))
            .is_err());
    }

    #[test]
    fn test_reconfigure_replaces_units() {
        let completion = RecordingCompletion::new();
        let dispatcher =
            PipelineDispatcher::new(PipelineCapabilities::default(), completion.clone());

        let source = nv12(64, 64);
        let first = [SinkConfig {
            id: SinkId(0),
            descriptor: Arc::clone(&source),
        }];
        dispatcher
            .configure(&source, &first, &BuildOptions::default())
            .unwrap();
        dispatcher.start().unwrap();

        // Second configuration with a different sink set.
        let second = [SinkConfig {
            id: SinkId(5),
            descriptor: nv12(32, 32),
        }];
        dispatcher
            .configure(&source, &second, &BuildOptions::default())
            .unwrap();
        dispatcher.start().unwrap();

        let input = FrameBuffer::alloc(Arc::clone(&source), BufferOwnership::Borrowed);
        let output = output_for(&second[0].descriptor, SinkId(5), 1);
        dispatcher
            .process_frame(input, vec![output], Arc::new(ProcessSettings::for_request(1)))
            .unwrap();

        assert!(wait_until(|| completion.ready_count() == 1));
        assert_eq!(completion.ready.lock().unwrap()[0].1, SinkId(5));
    }

    #[test]
    fn test_flush_waits_and_clears() {
        let completion = RecordingCompletion::new();
        let dispatcher =
            PipelineDispatcher::new(PipelineCapabilities::default(), completion.clone());

        let source = nv12(64, 64);
        let sinks = [SinkConfig {
            id: SinkId(0),
            descriptor: Arc::clone(&source),
        }];
        dispatcher
            .configure(&source, &sinks, &BuildOptions::default())
            .unwrap();
        dispatcher.start().unwrap();

        dispatcher.flush().unwrap();
        // Nothing was queued; flush simply completes.
        assert_eq!(completion.ready_count(), 0);
        assert_eq!(dispatcher.state(), PipelineState::Dispatching);
    }
}
