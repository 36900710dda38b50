//! Capture request/poll coordination.
//!
//! The capture device completes frames in poll order, which under
//! pipelined ISPs can run ahead of older requests still in flight. The
//! [`CaptureCoordinator`] absorbs that: completions for future requests
//! park in a delay queue and replay once the gap closes, so frames enter
//! the pipeline strictly in submission order. A completion older than the
//! oldest pending request is a protocol violation and fails that request
//! alone; a device fault fails everything pending.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::buffer::FrameBuffer;
use crate::dispatcher::{CompletionHandler, PipelineDispatcher};
use crate::error::{Error, Result};
use crate::settings::ProcessSettings;

/// A streaming capture device.
///
/// Implementations deliver each captured frame by calling
/// [`CaptureCoordinator::on_capture_complete`] with the request id the
/// frame was captured for.
pub trait FrameSource: Send + Sync {
    /// Begin delivering frames.
    fn start_streaming(&self) -> Result<()>;
    /// Stop delivering frames. Pending hardware captures may still
    /// complete afterwards.
    fn stop_streaming(&self) -> Result<()>;
}

struct PendingRequest {
    request_id: u64,
    outputs: Vec<FrameBuffer>,
    settings: Arc<ProcessSettings>,
}

struct CoordinatorInner {
    /// Submitted requests awaiting their captured frame, oldest first.
    pending: VecDeque<PendingRequest>,
    /// Captured frames that arrived ahead of older requests.
    parked: BTreeMap<u64, FrameBuffer>,
    last_submitted: u64,
}

/// Matches submitted requests with captured frames and feeds the
/// dispatcher in submission order.
pub struct CaptureCoordinator {
    dispatcher: Arc<PipelineDispatcher>,
    completion: Arc<dyn CompletionHandler>,
    source: Option<Arc<dyn FrameSource>>,
    inner: Mutex<CoordinatorInner>,
}

impl CaptureCoordinator {
    /// `completion` must be the same handler the dispatcher reports to,
    /// so request failures and buffer completions reach one place.
    pub fn new(
        dispatcher: Arc<PipelineDispatcher>,
        completion: Arc<dyn CompletionHandler>,
    ) -> Self {
        Self {
            dispatcher,
            completion,
            source: None,
            inner: Mutex::new(CoordinatorInner {
                pending: VecDeque::new(),
                parked: BTreeMap::new(),
                last_submitted: 0,
            }),
        }
    }

    /// Attach the capture device driving this coordinator.
    pub fn with_source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Start the pipeline and the capture device.
    pub fn start(&self) -> Result<()> {
        self.dispatcher.start()?;
        if let Some(source) = &self.source {
            source.start_streaming()?;
        }
        Ok(())
    }

    /// Stop the capture device, fail whatever is still pending, quiesce
    /// the pipeline.
    pub fn stop(&self) -> Result<()> {
        if let Some(source) = &self.source {
            source.stop_streaming()?;
        }
        self.fail_all_pending("stopped");
        self.dispatcher.stop()
    }

    /// Register a capture request.
    ///
    /// Request ids must be strictly increasing; `outputs` are the caller
    /// buffers the request's frame will be processed into.
    pub fn submit(&self, outputs: Vec<FrameBuffer>, settings: Arc<ProcessSettings>) -> Result<()> {
        let mut inner = self.lock_inner();
        if settings.request_id <= inner.last_submitted && inner.last_submitted != 0 {
            return Err(Error::Protocol(format!(
                "request id {} not greater than last submitted {}",
                settings.request_id, inner.last_submitted
            )));
        }

        inner.last_submitted = settings.request_id;
        inner.pending.push_back(PendingRequest {
            request_id: settings.request_id,
            outputs,
            settings,
        });
        Ok(())
    }

    /// Number of requests awaiting their captured frame.
    pub fn pending(&self) -> usize {
        self.lock_inner().pending.len()
    }

    /// Deliver one captured frame.
    ///
    /// Out-of-order completions for newer requests are parked and
    /// replayed when the older frames arrive; a completion older than
    /// every pending request fails that request only.
    pub fn on_capture_complete(&self, request_id: u64, frame: FrameBuffer) {
        let mut dispatches = Vec::new();
        let mut violation = None;

        {
            let mut inner = self.lock_inner();

            let Some(front) = inner.pending.front().map(|p| p.request_id) else {
                tracing::warn!(request = request_id, "capture completed with nothing pending");
                return;
            };

            if request_id < front {
                violation = Some(request_id);
            } else if request_id > front {
                tracing::debug!(
                    request = request_id,
                    awaiting = front,
                    "capture ahead of submission order, parking"
                );
                inner.parked.insert(request_id, frame);
            } else {
                let mut frame = Some(frame);
                // Dispatch the matched frame, then every parked frame
                // the gap closure released.
                while let Some(pending) = inner.pending.pop_front() {
                    let ready = match frame.take() {
                        Some(f) => f,
                        None => match inner.parked.remove(&pending.request_id) {
                            Some(f) => f,
                            None => {
                                inner.pending.push_front(pending);
                                break;
                            }
                        },
                    };
                    dispatches.push((pending, ready));
                }
            }
        }

        if let Some(request) = violation {
            tracing::error!(
                request,
                "capture completed for a request older than any pending"
            );
            self.completion.on_request_error(request);
            return;
        }

        for (pending, frame) in dispatches {
            let request = pending.request_id;
            if let Err(e) =
                self.dispatcher
                    .process_frame(frame, pending.outputs, pending.settings)
            {
                tracing::error!(request, error = %e, "dispatch failed");
                self.completion.on_request_error(request);
            }
        }
    }

    /// The capture device hit an unrecoverable fault: every pending
    /// request fails, parked frames are dropped, and the pipeline stays
    /// reconfigurable.
    pub fn on_device_error(&self) {
        self.fail_all_pending("device fault");
    }

    fn fail_all_pending(&self, reason: &str) {
        let (failed, parked) = {
            let mut inner = self.lock_inner();
            let failed: Vec<u64> = inner.pending.drain(..).map(|p| p.request_id).collect();
            let parked = inner.parked.len();
            inner.parked.clear();
            (failed, parked)
        };

        if !failed.is_empty() || parked > 0 {
            tracing::error!(
                reason,
                failed = failed.len(),
                parked,
                "failing all pending capture requests"
            );
        }
        for request in failed {
            self.completion.on_request_error(request);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CoordinatorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
