//! Synthesis queue.
//!
//! A bounded FIFO of [`SynthesisJob`]s drained by one worker. The worker
//! calls the backend under a lock, writes each result to its own WAV
//! artifact and hands the file to the [`PlaybackSink`]. Submitting never
//! waits: a full queue rejects the job.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::audio::write_wav;
use super::playback::{PlayItem, PlaybackSink};
use super::provider::SynthesisBackend;
use super::queue::{BoundedQueue, PushError};

/// One unit of text waiting for synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisJob {
    pub job_id: Uuid,
    /// Stream session the unit came from; `None` for `speak`.
    pub session_id: Option<String>,
    /// Instance of that session. Ids can be reused after an abort; the
    /// token tells the instances apart.
    pub session_token: Option<Uuid>,
    pub text: String,
    /// Voice selected when the job was accepted.
    pub voice: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SynthesisJob {
    pub fn new(text: impl Into<String>, session_id: Option<String>, voice: Option<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            session_id,
            session_token: None,
            text: text.into(),
            voice,
            created_at: Utc::now(),
        }
    }

    /// Tag the job with the session instance that submitted it.
    pub fn owned_by(mut self, token: Uuid) -> Self {
        self.session_token = Some(token);
        self
    }
}

/// How a job left the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Audio was handed to the playback sink.
    Queued,
    /// Synthesis or artifact writing failed.
    Failed(String),
    /// Cleared before it produced audio.
    Dropped,
}

/// Told about every accepted job exactly once, when it settles.
#[cfg_attr(test, mockall::automock)]
pub trait JobObserver: Send + Sync {
    fn job_settled(&self, job: &SynthesisJob, outcome: JobOutcome);
}

struct Shared {
    queue: BoundedQueue<(u64, SynthesisJob)>,
    backend: Arc<dyn SynthesisBackend>,
    backend_lock: Arc<tokio::sync::Mutex<()>>,
    sink: PlaybackSink,
    out_dir: PathBuf,
    seq: AtomicU64,
    /// Bumped by `clear_pending`; jobs popped under an older epoch are stale.
    epoch: AtomicU64,
    in_flight: AtomicUsize,
    observer: Mutex<Option<Weak<dyn JobObserver>>>,
}

/// Handle to the synthesis stage.
pub struct SynthesisQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SynthesisQueue {
    /// Create the queue and spawn its worker. Artifacts go to `out_dir`,
    /// which is created if missing.
    pub fn start(
        backend: Arc<dyn SynthesisBackend>,
        backend_lock: Arc<tokio::sync::Mutex<()>>,
        sink: PlaybackSink,
        out_dir: impl Into<PathBuf>,
        capacity: usize,
    ) -> anyhow::Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("cannot create output dir {}", out_dir.display()))?;
        info!(
            backend = backend.name(),
            capacity,
            out_dir = %out_dir.display(),
            "Synthesis queue starting"
        );

        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(capacity),
            backend,
            backend_lock,
            sink,
            out_dir,
            seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            observer: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(shared.clone()));
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register the observer told about settled jobs. Held weakly.
    pub fn set_observer(&self, observer: Weak<dyn JobObserver>) {
        *self
            .shared
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    /// Try to queue `job`. Returns false at once if the queue is full or
    /// shut down.
    pub fn submit(&self, job: SynthesisJob) -> bool {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        match self.shared.queue.try_push((seq, job)) {
            Ok(()) => true,
            Err(PushError::Full((_, job))) => {
                debug!(job = %job.job_id, "Synthesis queue full, job rejected");
                false
            }
            Err(PushError::Closed(_)) => false,
        }
    }

    /// Jobs accepted but not yet picked up by the worker.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// Pending jobs plus the one being synthesized, if any.
    pub fn backlog(&self) -> usize {
        self.pending_count() + self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Drop every job not yet started, and mark the one in flight stale
    /// so its audio is discarded. Returns how many pending jobs were
    /// dropped.
    pub fn clear_pending(&self) -> usize {
        let epoch = &self.shared.epoch;
        let dropped = self.shared.queue.drain_with(|| {
            epoch.fetch_add(1, Ordering::SeqCst);
        });
        let n = dropped.len();
        for (_, job) in dropped {
            self.shared.settle(&job, JobOutcome::Dropped);
        }
        if n > 0 {
            info!(dropped = n, "Synthesis queue cleared");
        }
        n
    }

    /// Stop the worker. Pending jobs are dropped.
    pub async fn shutdown(&self) {
        let dropped = self.shared.queue.close();
        for (_, job) in dropped {
            self.shared.settle(&job, JobOutcome::Dropped);
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Synthesis queue stopped");
    }
}

impl Shared {
    fn settle(&self, job: &SynthesisJob, outcome: JobOutcome) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.job_settled(job, outcome);
        }
    }

    fn artifact_path(&self, seq: u64, job: &SynthesisJob) -> PathBuf {
        self.out_dir
            .join(format!("job_{seq:06}_{}.wav", job.job_id.simple()))
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }
}

// ── Worker ───────────────────────────────────────────────────────

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = shared
            .queue
            .pop_with(|entry| {
                shared.in_flight.fetch_add(1, Ordering::SeqCst);
                (entry, shared.epoch.load(Ordering::SeqCst))
            })
            .await;
        let Some(((seq, job), epoch)) = next else { break };

        let outcome = process(&shared, seq, &job, epoch).await;
        match &outcome {
            JobOutcome::Queued => {}
            JobOutcome::Failed(error) => {
                warn!(job = %job.job_id, text = %job.text, error = %error, "Synthesis failed, skipping")
            }
            JobOutcome::Dropped => debug!(job = %job.job_id, "Stale job dropped"),
        }
        shared.settle(&job, outcome);
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Synthesis worker exiting");
}

async fn process(shared: &Arc<Shared>, seq: u64, job: &SynthesisJob, epoch: u64) -> JobOutcome {
    if shared.is_stale(epoch) {
        return JobOutcome::Dropped;
    }

    debug!(job = %job.job_id, seq, chars = job.text.chars().count(), "Synthesis started");
    let audio = {
        let _guard = shared.backend_lock.lock().await;
        shared.backend.synthesize(&job.text, job.voice.as_deref()).await
    };
    let audio = match audio {
        Ok(audio) => audio,
        Err(e) => return JobOutcome::Failed(format!("{e:#}")),
    };
    if audio.samples.is_empty() {
        return JobOutcome::Failed("backend returned no audio".to_string());
    }
    if shared.is_stale(epoch) {
        return JobOutcome::Dropped;
    }

    let path = shared.artifact_path(seq, job);
    let written = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || write_wav(&path, &audio.samples, audio.format)).await
    };
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return JobOutcome::Failed(format!("{e:#}")),
        Err(e) => return JobOutcome::Failed(e.to_string()),
    }
    debug!(job = %job.job_id, path = %path.display(), "Synthesis completed");

    let item = PlayItem::File {
        path: path.clone(),
        delete_after_play: true,
        caption: Some(job.text.clone()),
    };
    match shared.sink.enqueue_unless(item, || shared.is_stale(epoch)).await {
        Ok(true) => JobOutcome::Queued,
        Ok(false) => JobOutcome::Dropped,
        Err(e) => {
            remove_if_exists(&path);
            JobOutcome::Failed(e.to_string())
        }
    }
}

fn remove_if_exists(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}
