//! Session registry.
//!
//! Concurrent map from stream id to [`StreamSession`]. Lookups clone the
//! session handle out of the map, so no map shard lock is held while a
//! session does its own locking or I/O. Sessions leave the map when
//! aborted, or once they are done: a queue session when its last job
//! settles, a live session when its pump drains.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::SpeechError;
use super::playback::PlaybackSink;
use super::provider::SynthesisBackend;
use super::segmenter::Segmenter;
use super::session::{SessionState, StreamSession};
use super::synth_queue::{JobObserver, JobOutcome, SynthesisJob, SynthesisQueue};

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// True iff the id is no longer registered. Audio may still be
    /// playing.
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<StreamSession>>,
    backend: Arc<dyn SynthesisBackend>,
    backend_lock: Arc<tokio::sync::Mutex<()>>,
    synth: Arc<SynthesisQueue>,
    sink: PlaybackSink,
    segmenter: Segmenter,
    me: Weak<SessionRegistry>,
}

impl SessionRegistry {
    /// Create the registry and register it as the synthesis queue's
    /// job observer.
    pub fn new(
        backend: Arc<dyn SynthesisBackend>,
        backend_lock: Arc<tokio::sync::Mutex<()>>,
        synth: Arc<SynthesisQueue>,
        sink: PlaybackSink,
        segmenter: Segmenter,
    ) -> Arc<Self> {
        let registry = Arc::new_cyclic(|me| Self {
            sessions: DashMap::new(),
            backend,
            backend_lock,
            synth: synth.clone(),
            sink,
            segmenter,
            me: me.clone(),
        });
        let observer: Weak<dyn JobObserver> = registry.me.clone();
        synth.set_observer(observer);
        registry
    }

    /// Open a session under `id`, or a fresh id when `None`.
    ///
    /// Backends with a push stream get a live session whose PCM plays as
    /// one [`PlayItem::Stream`](super::playback::PlayItem::Stream),
    /// queued now; the rest get a queue session.
    pub async fn open(
        &self,
        id: Option<String>,
        voice: Option<String>,
    ) -> Result<String, SpeechError> {
        let id = id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if self.sessions.contains_key(&id) {
            return Err(SpeechError::DuplicateStream(id));
        }

        let stream = {
            let _guard = self.backend_lock.lock().await;
            self.backend.open_stream(voice.as_deref()).await?
        };

        let Some(stream) = stream else {
            let session = StreamSession::queued(
                id.clone(),
                voice,
                self.segmenter,
                self.synth.clone(),
            );
            self.insert(session)?;
            info!(stream = %id, "Stream opened");
            return Ok(id);
        };

        let writer = self.sink.open_live(&id, stream.format)?;
        let item = writer.play_item();
        let generation = writer.generation();
        let me = self.me.clone();
        let drained_id = id.clone();
        let session = StreamSession::live(
            id.clone(),
            voice,
            self.segmenter,
            stream,
            writer,
            move || {
                if let Some(registry) = me.upgrade() {
                    registry.evict_if_done(&drained_id);
                }
            },
        );
        if let Err(e) = self.insert(session) {
            self.sink.close_live(&id, generation);
            return Err(e);
        }

        if let Err(e) = self.sink.enqueue(item, false).await {
            self.abort(&id);
            return Err(e);
        }
        info!(stream = %id, "Live stream opened");
        Ok(id)
    }

    fn insert(&self, session: StreamSession) -> Result<(), SpeechError> {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(entry) => {
                session.abort();
                Err(SpeechError::DuplicateStream(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(session));
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    fn require(&self, id: &str) -> Result<Arc<StreamSession>, SpeechError> {
        self.get(id)
            .ok_or_else(|| SpeechError::UnknownStream(id.to_string()))
    }

    /// Push text into a session. Returns how many units left the
    /// session.
    pub async fn push(&self, id: &str, text: &str) -> Result<usize, SpeechError> {
        let session = self.require(id)?;
        Ok(session.push(text).await)
    }

    pub async fn finish(&self, id: &str) -> Result<(), SpeechError> {
        let session = self.require(id)?;
        session.finish().await;
        self.evict_if_done(id);
        Ok(())
    }

    /// Abort a session and forget it at once. A live session's sink
    /// channel is released too, so the id can be opened again.
    pub fn abort(&self, id: &str) -> Option<Arc<StreamSession>> {
        let (_, session) = self.sessions.remove(id)?;
        session.abort();
        if let Some(generation) = session.live_channel() {
            self.sink.close_live(id, generation);
        }
        Some(session)
    }

    pub fn status(&self, id: &str) -> StreamStatus {
        match self.get(id) {
            Some(session) => StreamStatus {
                done: false,
                state: Some(session.state()),
                error: session.error(),
            },
            None => StreamStatus {
                done: true,
                state: None,
                error: None,
            },
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove `id` if its session is done.
    pub fn evict_if_done(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if !session.is_done() {
            return false;
        }
        let removed = self
            .sessions
            .remove_if(id, |_, s| Arc::ptr_eq(s, &session))
            .is_some();
        if removed {
            debug!(stream = %id, state = %session.state(), "Stream evicted");
        }
        removed
    }

    /// Abort and forget every session. Returns how many there were.
    pub fn abort_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut n = 0;
        for id in ids {
            if self.abort(&id).is_some() {
                n += 1;
            }
        }
        if n > 0 {
            info!(aborted = n, "All streams aborted");
        }
        n
    }
}

impl JobObserver for SessionRegistry {
    fn job_settled(&self, job: &SynthesisJob, outcome: JobOutcome) {
        let Some(id) = job.session_id.as_deref() else {
            return;
        };
        let Some(session) = self.get(id) else {
            return;
        };
        // Leftovers from an aborted session must not count against a
        // newer session under the same id.
        if job.session_token != Some(session.token()) {
            debug!(stream = %id, job = %job.job_id, "Job from an earlier session settled");
            return;
        }
        session.job_settled(&outcome);
        self.evict_if_done(id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::speech::playback::SinkOptions;
    use crate::speech::playback::output::PlaybackOutcome;
    use crate::speech::playback::output::testing::RecordingOutput;
    use crate::speech::provider::mock::{MockBackend, MockConfig};

    struct Rig {
        _dir: tempfile::TempDir,
        out: Arc<RecordingOutput>,
        registry: Arc<SessionRegistry>,
    }

    fn rig(backend: MockBackend) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let out = Arc::new(RecordingOutput::new(100.0));
        let sink = PlaybackSink::start(
            out.clone(),
            SinkOptions {
                gap: Duration::ZERO,
                prebuffer_chunks: 1,
                ..Default::default()
            },
        );
        let backend: Arc<dyn SynthesisBackend> = Arc::new(backend);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let synth = Arc::new(
            SynthesisQueue::start(backend.clone(), lock.clone(), sink.clone(), dir.path(), 64)
                .unwrap(),
        );
        let registry = SessionRegistry::new(backend, lock, synth, sink, Segmenter::default());
        Rig {
            _dir: dir,
            out,
            registry,
        }
    }

    fn mock() -> MockBackend {
        MockBackend::new(MockConfig {
            sample_rate: 8000,
            ms_per_char: 2.0,
            min_duration_ms: 10.0,
            ..Default::default()
        })
    }

    async fn wait_gone(registry: &SessionRegistry, id: &str) {
        for _ in 0..400 {
            if registry.status(id).done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream {id} never finished");
    }

    #[tokio::test]
    async fn open_generates_or_keeps_ids() {
        let rig = rig(mock());
        let a = rig.registry.open(None, None).await.unwrap();
        let b = rig.registry.open(None, None).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);

        let named = rig.registry.open(Some(" chat-1 ".into()), None).await.unwrap();
        assert_eq!(named, "chat-1");
        assert_eq!(rig.registry.active_count(), 3);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let rig = rig(mock());
        rig.registry.open(Some("x".into()), None).await.unwrap();
        let err = rig.registry.open(Some("x".into()), None).await.unwrap_err();
        assert_eq!(err.to_string(), "stream id already exists: x");
    }

    #[tokio::test]
    async fn status_tracks_lifecycle() {
        let rig = rig(mock());
        let id = rig.registry.open(None, None).await.unwrap();

        let status = rig.registry.status(&id);
        assert!(!status.done);
        assert_eq!(status.state, Some(SessionState::Open));

        rig.registry.push(&id, "Hello there. And more").await.unwrap();
        rig.registry.finish(&id).await.unwrap();
        wait_gone(&rig.registry, &id).await;

        assert!(rig.registry.status("never-existed").done);
        assert_eq!(rig.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn finishing_empty_stream_evicts_at_once() {
        let rig = rig(mock());
        let id = rig.registry.open(None, None).await.unwrap();
        rig.registry.finish(&id).await.unwrap();
        assert!(rig.registry.status(&id).done);
    }

    #[tokio::test]
    async fn unknown_ids_are_errors() {
        let rig = rig(mock());
        let err = rig.registry.push("nope", "hi").await.unwrap_err();
        assert_eq!(err.to_string(), "unknown stream id: nope");
        assert!(rig.registry.finish("nope").await.is_err());
        assert!(rig.registry.abort("nope").is_none());
    }

    #[tokio::test]
    async fn abort_removes_immediately() {
        let rig = rig(mock());
        let id = rig.registry.open(None, None).await.unwrap();
        rig.registry.push(&id, "Some words").await.unwrap();
        let session = rig.registry.abort(&id).unwrap();
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(rig.registry.status(&id).done);
    }

    #[tokio::test]
    async fn failed_job_error_is_visible_while_registered() {
        let rig = rig(mock().with_latency(30).failing_on("bad"));
        let id = rig.registry.open(None, None).await.unwrap();
        rig.registry.push(&id, "This is bad. ").await.unwrap();

        for _ in 0..100 {
            if rig.registry.status(&id).error.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = rig.registry.status(&id);
        assert!(!status.done);
        assert!(status.error.unwrap().contains("mock synthesis failure"));
    }

    #[tokio::test]
    async fn reused_id_ignores_jobs_of_aborted_session() {
        let rig = rig(mock().with_latency(80));
        rig.registry.open(Some("x".into()), None).await.unwrap();
        rig.registry.push("x", "Old one. Old two. ").await.unwrap();
        rig.registry.abort("x").unwrap();

        rig.registry.open(Some("x".into()), None).await.unwrap();
        rig.registry.push("x", "New one. New two. New three.").await.unwrap();
        rig.registry.finish("x").await.unwrap();
        let session = rig.registry.get("x").unwrap();
        assert_eq!(session.outstanding(), 3);

        // Both old jobs settle before any of the new ones.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!rig.registry.status("x").done);
        assert!(session.outstanding() >= 2, "outstanding {}", session.outstanding());

        wait_gone(&rig.registry, "x").await;
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn abort_all_clears_registry() {
        let rig = rig(mock());
        for _ in 0..3 {
            rig.registry.open(None, None).await.unwrap();
        }
        assert_eq!(rig.registry.abort_all(), 3);
        assert_eq!(rig.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn live_stream_is_evicted_when_drained() {
        let backend = MockBackend::new(MockConfig {
            sample_rate: 1000,
            ms_per_char: 5.0,
            min_duration_ms: 0.0,
            ..Default::default()
        })
        .streaming();
        let rig = rig(backend);
        let id = rig.registry.open(Some("live".into()), None).await.unwrap();
        assert!(rig.registry.get(&id).unwrap().is_live());

        rig.registry.push(&id, "Streaming text. ").await.unwrap();
        rig.registry.finish(&id).await.unwrap();
        wait_gone(&rig.registry, &id).await;

        for _ in 0..200 {
            if !rig.out.played().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rig.out.labels(), vec!["stream live"]);
    }

    fn streaming_mock() -> MockBackend {
        MockBackend::new(MockConfig {
            sample_rate: 1000,
            ms_per_char: 5.0,
            min_duration_ms: 0.0,
            ..Default::default()
        })
        .streaming()
    }

    #[tokio::test]
    async fn aborted_live_id_can_be_reopened() {
        let rig = rig(streaming_mock());
        rig.registry.open(Some("x".into()), None).await.unwrap();
        rig.registry.push("x", "Never heard. ").await.unwrap();
        assert!(rig.registry.abort("x").is_some());

        rig.registry.open(Some("x".into()), None).await.unwrap();
        rig.registry
            .push("x", "Heard this time, in a much longer sentence. ")
            .await
            .unwrap();
        rig.registry.finish("x").await.unwrap();
        wait_gone(&rig.registry, "x").await;

        // The reopened stream plays in full; the aborted one is far shorter.
        let heard = |out: &RecordingOutput| {
            out.played().iter().any(|p| {
                p.label == "stream x" && p.outcome == PlaybackOutcome::Finished && p.samples >= 200
            })
        };
        for _ in 0..200 {
            if heard(&rig.out) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(heard(&rig.out));
    }

    #[tokio::test]
    async fn abort_all_releases_live_channels() {
        let rig = rig(streaming_mock());
        for id in ["a", "b"] {
            rig.registry.open(Some(id.into()), None).await.unwrap();
        }
        assert_eq!(rig.registry.abort_all(), 2);
        for id in ["a", "b"] {
            rig.registry.open(Some(id.into()), None).await.unwrap();
        }
        assert_eq!(rig.registry.active_count(), 2);
        rig.registry.abort_all();
    }
}
