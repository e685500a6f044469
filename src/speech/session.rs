//! Streaming sessions.
//!
//! A session buffers partial text from one client, cuts it into units
//! with the [`Segmenter`] and sends completed units downstream. Two
//! downstreams exist:
//!
//! - **Queue**: each unit becomes a [`SynthesisJob`] on the shared
//!   synthesis queue. The session counts its unsettled jobs.
//! - **Live**: units go to a push-based backend stream; a pump task
//!   forwards its PCM chunks into the sink's live channel for the
//!   session.
//!
//! ```text
//! Open ──finish──▶ Finishing ──flush──▶ Finished
//!   │                  │
//!   └──────abort───────┴──────────────▶ Aborted
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::playback::stream::LiveStreamWriter;
use super::provider::{BackendStream, StreamInput};
use super::segmenter::Segmenter;
use super::synth_queue::{JobOutcome, SynthesisJob, SynthesisQueue};

/// Lifecycle of a [`StreamSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Finishing,
    Finished,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Finishing => "finishing",
            SessionState::Finished => "finished",
            SessionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SessionInner {
    state: SessionState,
    /// Raw text not yet emitted as units.
    buffer: String,
}

/// State shared between a live session and its pump task.
#[derive(Default)]
struct LiveStatus {
    done: AtomicBool,
    error: Mutex<Option<String>>,
}

impl LiveStatus {
    fn record_error(&self, error: String) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert(error);
    }
}

enum Downstream {
    Queue {
        synth: Arc<SynthesisQueue>,
        outstanding: AtomicUsize,
        error: Mutex<Option<String>>,
    },
    Live {
        input: mpsc::Sender<StreamInput>,
        cancel: CancellationToken,
        status: Arc<LiveStatus>,
        /// Generation of the sink channel the pump writes to.
        channel: u64,
    },
}

/// One client's incremental text stream.
pub struct StreamSession {
    id: String,
    /// Distinguishes this instance from later sessions reusing `id`.
    token: Uuid,
    voice: Option<String>,
    segmenter: Segmenter,
    inner: Mutex<SessionInner>,
    /// Held from segmentation until the units are handed off, so units
    /// of concurrent pushes leave in buffer order.
    emit: tokio::sync::Mutex<()>,
    downstream: Downstream,
}

impl StreamSession {
    /// Session whose units go through the synthesis queue.
    pub fn queued(
        id: impl Into<String>,
        voice: Option<String>,
        segmenter: Segmenter,
        synth: Arc<SynthesisQueue>,
    ) -> Self {
        Self::with_downstream(
            id.into(),
            voice,
            segmenter,
            Downstream::Queue {
                synth,
                outstanding: AtomicUsize::new(0),
                error: Mutex::new(None),
            },
        )
    }

    /// Session whose units go to a push-based backend stream. PCM from
    /// the backend is forwarded into `writer`; `on_drained` runs once the
    /// backend output has ended and everything was forwarded.
    pub fn live(
        id: impl Into<String>,
        voice: Option<String>,
        segmenter: Segmenter,
        stream: BackendStream,
        writer: LiveStreamWriter,
        on_drained: impl FnOnce() + Send + 'static,
    ) -> Self {
        let id = id.into();
        let cancel = CancellationToken::new();
        let status = Arc::new(LiveStatus::default());
        let channel = writer.generation();
        tokio::spawn(run_pump(
            id.clone(),
            stream.output,
            writer,
            cancel.clone(),
            status.clone(),
            on_drained,
        ));
        Self::with_downstream(
            id,
            voice,
            segmenter,
            Downstream::Live {
                input: stream.input,
                cancel,
                status,
                channel,
            },
        )
    }

    fn with_downstream(
        id: String,
        voice: Option<String>,
        segmenter: Segmenter,
        downstream: Downstream,
    ) -> Self {
        Self {
            id,
            token: Uuid::new_v4(),
            voice,
            segmenter,
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                buffer: String::new(),
            }),
            emit: tokio::sync::Mutex::new(()),
            downstream,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn is_live(&self) -> bool {
        matches!(self.downstream, Downstream::Live { .. })
    }

    /// Generation of the sink's live channel, for live sessions.
    pub fn live_channel(&self) -> Option<u64> {
        match &self.downstream {
            Downstream::Live { channel, .. } => Some(*channel),
            Downstream::Queue { .. } => None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// First downstream error reported for this session.
    pub fn error(&self) -> Option<String> {
        match &self.downstream {
            Downstream::Queue { error, .. } => {
                error.lock().unwrap_or_else(|e| e.into_inner()).clone()
            }
            Downstream::Live { status, .. } => {
                status.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
            }
        }
    }

    /// Units sent downstream whose outcome is still unknown (queue
    /// sessions only).
    pub fn outstanding(&self) -> usize {
        match &self.downstream {
            Downstream::Queue { outstanding, .. } => outstanding.load(Ordering::SeqCst),
            Downstream::Live { .. } => 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append text and send every unit that is now complete. Returns
    /// how many units were handed off. A no-op once finishing or aborted.
    pub async fn push(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let _emit = self.emit.lock().await;
        let units = {
            let mut inner = self.lock();
            if inner.state != SessionState::Open {
                debug!(stream = %self.id, state = %inner.state, "Push after close ignored");
                return 0;
            }
            inner.buffer.push_str(text);
            let (units, rest) = self.segmenter.split_complete(&inner.buffer);
            inner.buffer = rest;
            units
        };
        self.emit_units(units).await
    }

    /// Flush the whole buffer and signal end of input. Idempotent.
    pub async fn finish(&self) {
        let _emit = self.emit.lock().await;
        let units = {
            let mut inner = self.lock();
            if inner.state != SessionState::Open {
                return;
            }
            inner.state = SessionState::Finishing;
            let buffer = std::mem::take(&mut inner.buffer);
            self.segmenter.segment(&buffer)
        };
        let emitted = self.emit_units(units).await;

        if let Downstream::Live { input, .. } = &self.downstream {
            if input.send(StreamInput::Finish).await.is_err() {
                debug!(stream = %self.id, "Backend stream already closed at finish");
            }
        }

        let mut inner = self.lock();
        if inner.state == SessionState::Finishing {
            inner.state = SessionState::Finished;
        }
        info!(stream = %self.id, flushed = emitted, "Stream finished");
    }

    /// Drop buffered text and stop the downstream at once. Idempotent.
    /// Units already handed to the synthesis queue are not recalled.
    pub fn abort(&self) {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = SessionState::Aborted;
            inner.buffer.clear();
        }
        if let Downstream::Live { input, cancel, .. } = &self.downstream {
            let _ = input.try_send(StreamInput::Abort);
            cancel.cancel();
        }
        info!(stream = %self.id, "Stream aborted");
    }

    /// True once the session is terminal and nothing it sent downstream
    /// is still pending.
    pub fn is_done(&self) -> bool {
        if !self.state().is_terminal() {
            return false;
        }
        match &self.downstream {
            Downstream::Queue { outstanding, .. } => outstanding.load(Ordering::SeqCst) == 0,
            Downstream::Live { status, .. } => status.done.load(Ordering::SeqCst),
        }
    }

    /// Account for one of this session's jobs leaving the synthesis queue.
    pub fn job_settled(&self, outcome: &JobOutcome) {
        if let Downstream::Queue {
            outstanding, error, ..
        } = &self.downstream
        {
            if let JobOutcome::Failed(e) = outcome {
                error
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get_or_insert_with(|| e.clone());
            }
            let _ = outstanding.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            });
        }
    }

    async fn emit_units(&self, units: Vec<String>) -> usize {
        let mut emitted = 0;
        for unit in units {
            match &self.downstream {
                Downstream::Queue {
                    synth, outstanding, ..
                } => {
                    outstanding.fetch_add(1, Ordering::SeqCst);
                    let job = SynthesisJob::new(unit, Some(self.id.clone()), self.voice.clone())
                        .owned_by(self.token);
                    if !synth.submit(job) {
                        outstanding.fetch_sub(1, Ordering::SeqCst);
                        warn!(stream = %self.id, "Synthesis queue full, unit dropped");
                        continue;
                    }
                }
                Downstream::Live { input, .. } => {
                    if input.send(StreamInput::Text(unit)).await.is_err() {
                        warn!(stream = %self.id, "Backend stream closed, unit dropped");
                        continue;
                    }
                }
            }
            emitted += 1;
        }
        emitted
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Downstream::Live { cancel, .. } = &self.downstream {
            cancel.cancel();
        }
    }
}

// ── Live pump ────────────────────────────────────────────────────

async fn run_pump(
    id: String,
    mut output: mpsc::Receiver<anyhow::Result<Vec<f32>>>,
    writer: LiveStreamWriter,
    cancel: CancellationToken,
    status: Arc<LiveStatus>,
    on_drained: impl FnOnce(),
) {
    let mut chunks = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                writer.abort();
                debug!(stream = %id, chunks, "Live pump cancelled");
                break;
            }
            next = output.recv() => match next {
                Some(Ok(samples)) => {
                    chunks += 1;
                    if !writer.send(samples).await {
                        debug!(stream = %id, chunks, "Live channel closed by sink");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(stream = %id, error = %e, "Backend stream error");
                    status.record_error(format!("{e:#}"));
                    writer.finish().await;
                    break;
                }
                None => {
                    debug!(stream = %id, chunks, "Backend stream drained");
                    writer.finish().await;
                    break;
                }
            },
        }
    }
    status.done.store(true, Ordering::SeqCst);
    on_drained();
}
