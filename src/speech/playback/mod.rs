//! Serialized playback sink.
//!
//! All audio goes through one bounded FIFO of [`PlayItem`]s and one
//! worker task, so clips never overlap and play in enqueue order. An
//! override enqueue stops the current item, drops everything pending,
//! and queues the new item as a single step.

pub mod output;
pub mod stream;

#[cfg(feature = "device")]
pub mod device;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::output::{AudioOutput, ClipSource, PlaybackOutcome, PlaybackRequest, StopSignal, StopToken};
use self::stream::{LiveChannel, LiveStreamWriter, PcmEvent, StreamSource, live_channel};
use super::audio::{PcmFormat, read_wav};
use super::error::{AudioError, SpeechError};
use super::queue::BoundedQueue;

pub use self::output::ClockedOutput;

/// Something the sink can play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayItem {
    /// A WAV file on disk.
    File {
        path: PathBuf,
        delete_after_play: bool,
        /// Text the clip was synthesized from, for logs.
        caption: Option<String>,
    },
    /// The live PCM channel registered for a session. `generation`
    /// picks out one channel when the id is reused.
    Stream { session_id: String, generation: u64 },
}

impl PlayItem {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        PlayItem::File {
            path: path.into(),
            delete_after_play: false,
            caption: None,
        }
    }

    fn label(&self) -> String {
        match self {
            PlayItem::File {
                path,
                caption: Some(caption),
                ..
            } => format!("{} ({caption})", path.display()),
            PlayItem::File { path, .. } => path.display().to_string(),
            PlayItem::Stream { session_id, .. } => format!("stream {session_id}"),
        }
    }
}

/// Tunables for [`PlaybackSink`].
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub queue_capacity: usize,
    /// Pause after each item; cut short by `stop_now`.
    pub gap: Duration,
    /// Chunks collected before a live stream starts playing.
    pub prebuffer_chunks: usize,
    /// Capacity of each live channel, in chunks.
    pub live_channel_capacity: usize,
    /// How long a live stream may take to fill its prebuffer.
    pub stream_start_timeout: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            gap: Duration::from_millis(800),
            prebuffer_chunks: 3,
            live_channel_capacity: 64,
            stream_start_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    playing: bool,
    current: Option<String>,
}

struct Shared {
    queue: BoundedQueue<PlayItem>,
    /// Serializes override and clear against other enqueues.
    enqueue_lock: tokio::sync::Mutex<()>,
    stop: StopSignal,
    state: Mutex<SinkState>,
    live: DashMap<String, LiveChannel>,
    live_generation: AtomicU64,
    output: Arc<dyn AudioOutput>,
    options: SinkOptions,
    underruns: Arc<AtomicUsize>,
}

/// Handle to the playback sink. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackSink {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PlaybackSink {
    /// Create the sink and spawn its worker on the current runtime.
    pub fn start(output: Arc<dyn AudioOutput>, options: SinkOptions) -> Self {
        info!(output = output.name(), capacity = options.queue_capacity, "Playback sink starting");
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(options.queue_capacity),
            enqueue_lock: tokio::sync::Mutex::new(()),
            stop: StopSignal::new(),
            state: Mutex::new(SinkState::default()),
            live: DashMap::new(),
            live_generation: AtomicU64::new(0),
            output,
            options,
            underruns: Arc::new(AtomicUsize::new(0)),
        });
        let worker = tokio::spawn(run_worker(shared.clone()));
        Self {
            shared,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Queue an item.
    ///
    /// Without `override_current` this waits while the queue is full.
    /// With it, the current item is stopped, pending items are dropped
    /// and `item` is queued alone, atomically with respect to every
    /// other enqueue and clear.
    pub async fn enqueue(&self, item: PlayItem, override_current: bool) -> Result<(), SpeechError> {
        if override_current {
            let _guard = self.shared.enqueue_lock.lock().await;
            let stop = &self.shared.stop;
            let dropped = self
                .shared
                .queue
                .replace(item, || stop.raise())
                .map_err(|_| SpeechError::ShutDown)?;
            debug!(dropped = dropped.len(), "Playback override");
            self.shared.discard(dropped);
            return Ok(());
        }

        self.enqueue_unless(item, || false).await.map(|_| ())
    }

    /// Queue `item` after waiting for a slot, unless `cancelled` returns
    /// true once the enqueue lock is held. A cancelled item is discarded
    /// and `Ok(false)` returned.
    ///
    /// A producer that bumps an epoch before calling
    /// [`clear_pending`](Self::clear_pending) can use this to make sure
    /// none of its stale items survive the clear.
    pub async fn enqueue_unless(
        &self,
        item: PlayItem,
        cancelled: impl FnOnce() -> bool,
    ) -> Result<bool, SpeechError> {
        let Some(slot) = self.shared.queue.reserve().await else {
            self.shared.discard(vec![item]);
            return Err(SpeechError::ShutDown);
        };
        let _guard = self.shared.enqueue_lock.lock().await;
        if cancelled() {
            self.shared.discard(vec![item]);
            return Ok(false);
        }
        match slot.push(item) {
            Ok(()) => Ok(true),
            Err(item) => {
                self.shared.discard(vec![item]);
                Err(SpeechError::ShutDown)
            }
        }
    }

    /// Stop the current item at the next buffer boundary. The queue is
    /// left alone.
    pub fn stop_now(&self) {
        self.shared.stop.raise();
    }

    /// Drop every item that has not started yet. Returns how many.
    pub async fn clear_pending(&self) -> usize {
        let _guard = self.shared.enqueue_lock.lock().await;
        let dropped = self.shared.queue.drain();
        let n = dropped.len();
        self.shared.discard(dropped);
        n
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// True while an item is being rendered or more are waiting.
    pub fn is_playing(&self) -> bool {
        let playing = self.shared.lock_state().playing;
        playing || !self.shared.queue.is_empty()
    }

    /// Label of the item currently being rendered.
    pub fn current(&self) -> Option<String> {
        self.shared.lock_state().current.clone()
    }

    pub fn output_name(&self) -> &str {
        self.shared.output.name()
    }

    /// Total buffers that found a live stream empty.
    pub fn underruns(&self) -> usize {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Register a live PCM channel for `session_id`. Enqueue the
    /// writer's [`LiveStreamWriter::play_item`] to have it played.
    pub fn open_live(
        &self,
        session_id: &str,
        format: PcmFormat,
    ) -> Result<LiveStreamWriter, SpeechError> {
        if self.shared.queue.is_closed() {
            return Err(SpeechError::ShutDown);
        }
        match self.shared.live.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SpeechError::DuplicateStream(session_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let generation = self.shared.live_generation.fetch_add(1, Ordering::Relaxed) + 1;
                let (writer, channel) = live_channel(
                    session_id,
                    generation,
                    format,
                    self.shared.options.live_channel_capacity,
                );
                v.insert(channel);
                Ok(writer)
            }
        }
    }

    /// Forget a live channel. Its writer starts failing and, if it is
    /// playing, playback ends at the next buffer.
    pub fn close_live(&self, session_id: &str, generation: u64) {
        self.shared.evict_live(session_id, generation);
    }

    /// Stop the worker. Pending items are discarded.
    pub async fn shutdown(&self) {
        let dropped = self.shared.queue.close();
        self.shared.stop.raise();
        self.shared.discard(dropped);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Playback sink stopped");
    }
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_current(&self, current: Option<String>) {
        let mut state = self.lock_state();
        state.playing = current.is_some();
        state.current = current;
    }

    /// Remove the channel for `session_id` only if it is still the
    /// `generation` instance.
    fn evict_live(&self, session_id: &str, generation: u64) {
        if let Some((_, channel)) = self
            .live
            .remove_if(session_id, |_, c| c.generation == generation)
        {
            channel.aborted.store(true, Ordering::SeqCst);
        }
    }

    /// Release whatever a dropped item owns.
    fn discard(&self, items: Vec<PlayItem>) {
        for item in items {
            match item {
                PlayItem::File {
                    path,
                    delete_after_play: true,
                    ..
                } => remove_artifact(&path),
                PlayItem::File { .. } => {}
                PlayItem::Stream {
                    session_id,
                    generation,
                } => self.evict_live(&session_id, generation),
            }
        }
    }
}

fn remove_artifact(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Could not remove audio artifact");
    }
}

// ── Worker ───────────────────────────────────────────────────────

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = shared
            .queue
            .pop_with(|item| {
                shared.set_current(Some(item.label()));
                (item, shared.stop.token())
            })
            .await;
        let Some((item, token)) = next else { break };

        let label = item.label();
        let result = match item {
            PlayItem::File {
                path,
                delete_after_play,
                ..
            } => play_file(&shared, path, delete_after_play, label.clone(), token.clone()).await,
            PlayItem::Stream {
                session_id,
                generation,
            } => {
                let result =
                    play_stream(&shared, &session_id, generation, label.clone(), token.clone())
                        .await;
                shared.evict_live(&session_id, generation);
                result
            }
        };

        match result {
            Ok(PlaybackOutcome::Finished) => debug!(item = %label, "Playback finished"),
            Ok(PlaybackOutcome::Interrupted) => info!(item = %label, "Playback interrupted"),
            Err(e) => warn!(item = %label, error = %e, "Playback failed, skipping"),
        }
        shared.set_current(None);

        let gap = shared.options.gap;
        if !gap.is_zero() && !token.is_stopped() {
            tokio::select! {
                _ = tokio::time::sleep(gap) => {}
                _ = token.stopped() => {}
            }
        }
    }
    debug!("Playback worker exiting");
}

async fn render(
    shared: &Arc<Shared>,
    request: PlaybackRequest,
) -> anyhow::Result<PlaybackOutcome> {
    let output = shared.output.clone();
    let outcome = tokio::task::spawn_blocking(move || output.play(request))
        .await
        .map_err(|e| AudioError::Task(e.to_string()))??;
    Ok(outcome)
}

async fn play_file(
    shared: &Arc<Shared>,
    path: PathBuf,
    delete_after_play: bool,
    label: String,
    stop: StopToken,
) -> anyhow::Result<PlaybackOutcome> {
    if stop.is_stopped() {
        if delete_after_play {
            remove_artifact(&path);
        }
        return Ok(PlaybackOutcome::Interrupted);
    }

    let decoded = tokio::task::spawn_blocking(move || {
        let clip = read_wav(&path);
        if delete_after_play {
            remove_artifact(&path);
        }
        clip
    })
    .await
    .map_err(|e| AudioError::Task(e.to_string()))??;

    debug!(
        item = %label,
        sample_rate = decoded.format.sample_rate,
        channels = decoded.format.channels,
        duration_ms = decoded.format.duration_ms(decoded.samples.len()),
        "Playing clip"
    );

    render(
        shared,
        PlaybackRequest {
            label,
            source: Box::new(ClipSource::new(decoded.samples, decoded.format)),
            stop,
        },
    )
    .await
}

async fn play_stream(
    shared: &Arc<Shared>,
    session_id: &str,
    generation: u64,
    label: String,
    stop: StopToken,
) -> anyhow::Result<PlaybackOutcome> {
    let (format, rx, aborted) = {
        let channel = shared
            .live
            .get_mut(session_id)
            .filter(|c| c.generation == generation);
        let Some(mut channel) = channel else {
            // Closed before the worker got here, e.g. by an abort.
            debug!(stream = session_id, generation, "Live channel already closed");
            return Ok(PlaybackOutcome::Interrupted);
        };
        let Some(rx) = channel.rx.take() else {
            anyhow::bail!("live channel for stream {session_id} already consumed");
        };
        (channel.format, rx, channel.aborted.clone())
    };
    let mut rx = rx;

    // Prebuffer, bounded by the start timeout and cut short by stop.
    let mut prebuffered = VecDeque::new();
    let mut ended = false;
    let deadline = tokio::time::Instant::now() + shared.options.stream_start_timeout;
    while prebuffered.len() < shared.options.prebuffer_chunks.max(1) {
        tokio::select! {
            _ = stop.stopped() => return Ok(PlaybackOutcome::Interrupted),
            _ = tokio::time::sleep_until(deadline) => {
                debug!(stream = session_id, chunks = prebuffered.len(), "Prebuffer timed out");
                break;
            }
            event = rx.recv() => match event {
                Some(PcmEvent::Chunk(chunk)) => prebuffered.push_back(chunk),
                Some(PcmEvent::End) | None => {
                    ended = true;
                    break;
                }
            },
        }
        if aborted.load(Ordering::SeqCst) {
            return Ok(PlaybackOutcome::Interrupted);
        }
    }

    if ended && prebuffered.is_empty() {
        debug!(stream = session_id, "Live stream ended without audio");
        return Ok(PlaybackOutcome::Finished);
    }

    debug!(
        stream = session_id,
        chunks = prebuffered.len(),
        sample_rate = format.sample_rate,
        "Live stream starting"
    );

    render(
        shared,
        PlaybackRequest {
            label,
            source: Box::new(StreamSource::new(
                format,
                prebuffered,
                ended,
                rx,
                aborted,
                shared.underruns.clone(),
            )),
            stop,
        },
    )
    .await
}
