//! Speech pipeline.
//!
//! Text flows through three stages:
//!
//! ```text
//! speak ──────────────┐
//!                     ▼
//! stream_push ─▶ StreamSession ─▶ SynthesisQueue ─▶ PlaybackSink ─▶ output
//!                     │                                  ▲
//!                     └──── live backend stream ─────────┘
//! ```
//!
//! [`SpeechService`] owns one of each stage and is what the server
//! dispatches into.

pub mod audio;
pub mod error;
pub mod playback;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod segmenter;
pub mod session;
pub mod synth_queue;


use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

pub use error::{AudioError, SpeechError};
pub use playback::{PlayItem, PlaybackSink, SinkOptions};
pub use registry::{SessionRegistry, StreamStatus};
pub use segmenter::{HoldBack, Segmenter};
pub use session::{SessionState, StreamSession};
pub use synth_queue::{SynthesisJob, SynthesisQueue};

use crate::config::{Config, OutputKind, PlaybackConfig};
use playback::output::{AudioOutput, ClockedOutput};
use provider::SynthesisBackend;

/// Everything [`SpeechService::start`] needs besides the backend and
/// the audio output.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub segmenter: Segmenter,
    pub synth_capacity: usize,
    /// Directory for synthesized WAV artifacts.
    pub out_dir: PathBuf,
    pub sink: SinkOptions,
    /// Voice selected at startup; `None` uses the backend's default.
    pub voice: Option<String>,
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            segmenter: Segmenter::new(config.synthesis.max_chars, config.synthesis.hold_back),
            synth_capacity: config.synthesis.queue_capacity,
            out_dir: config.synthesis.output_dir(),
            sink: SinkOptions {
                queue_capacity: config.playback.queue_capacity,
                gap: config.playback.gap()?,
                prebuffer_chunks: config.playback.prebuffer_chunks,
                live_channel_capacity: config.playback.live_channel_capacity,
                stream_start_timeout: config.playback.stream_start_timeout()?,
            },
            voice: config.backend.default_voice.clone(),
        })
    }
}

/// Build the audio output selected in `[playback]`.
pub fn build_output(config: &PlaybackConfig) -> Result<Arc<dyn AudioOutput>> {
    match config.output {
        OutputKind::Clocked => Ok(Arc::new(ClockedOutput::realtime())),
        #[cfg(feature = "device")]
        OutputKind::Device => Ok(Arc::new(playback::device::CpalOutput::new(
            config.device.clone(),
        ))),
        #[cfg(not(feature = "device"))]
        OutputKind::Device => {
            anyhow::bail!("playback.output = \"device\" needs a build with the `device` feature")
        }
    }
}

/// Snapshot returned by `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceState {
    pub is_playing: bool,
    pub pending_audio: usize,
    pub pending_synth: usize,
    pub active_streams: usize,
    pub voice: Option<String>,
    pub backend: String,
    pub model: Option<String>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    pub underruns: usize,
}

/// The running pipeline.
pub struct SpeechService {
    backend: Arc<dyn SynthesisBackend>,
    synth: Arc<SynthesisQueue>,
    sink: PlaybackSink,
    registry: Arc<SessionRegistry>,
    segmenter: Segmenter,
    voice: RwLock<Option<String>>,
}

impl SpeechService {
    /// Start every stage. Must run inside a tokio runtime.
    pub fn start(
        backend: Arc<dyn SynthesisBackend>,
        output: Arc<dyn AudioOutput>,
        options: ServiceOptions,
    ) -> Result<Self> {
        let voice = match options.voice {
            Some(v) => {
                backend.validate_voice(&v)?;
                Some(v)
            }
            None => backend.default_voice(),
        };

        let backend_lock = Arc::new(tokio::sync::Mutex::new(()));
        let sink = PlaybackSink::start(output, options.sink);
        let synth = Arc::new(SynthesisQueue::start(
            backend.clone(),
            backend_lock.clone(),
            sink.clone(),
            &options.out_dir,
            options.synth_capacity,
        )?);
        let registry = SessionRegistry::new(
            backend.clone(),
            backend_lock,
            synth.clone(),
            sink.clone(),
            options.segmenter,
        );

        info!(
            backend = backend.name(),
            output = sink.output_name(),
            voice = voice.as_deref().unwrap_or("-"),
            "Speech service started"
        );
        Ok(Self {
            backend,
            synth,
            sink,
            registry,
            segmenter: options.segmenter,
            voice: RwLock::new(voice),
        })
    }

    /// Start from configuration, building the backend and output it names.
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend = provider::build_backend(&config.backend)?;
        let output = build_output(&config.playback)?;
        Self::start(backend, output, ServiceOptions::from_config(config)?)
    }

    pub fn voice(&self) -> Option<String> {
        self.voice.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Select the voice for jobs and streams accepted from now on.
    pub fn set_voice(&self, voice: &str) -> Result<(), SpeechError> {
        let voice = voice.trim();
        self.backend
            .validate_voice(voice)
            .map_err(|e| SpeechError::InvalidVoice(format!("{e:#}")))?;
        *self.voice.write().unwrap_or_else(|e| e.into_inner()) = Some(voice.to_string());
        info!(voice, "Voice changed");
        Ok(())
    }

    /// Segment `text` and queue its units for synthesis. Stops at the
    /// first rejected unit; fails with `busy` when none was accepted.
    pub fn speak(&self, text: &str) -> Result<usize, SpeechError> {
        let units = self.segmenter.segment(text);
        let total = units.len();
        let voice = self.voice();
        let mut accepted = 0;
        for unit in units {
            if !self.synth.submit(SynthesisJob::new(unit, None, voice.clone())) {
                break;
            }
            accepted += 1;
        }
        if accepted < total {
            warn!(accepted, total, "Synthesis queue full");
        }
        if accepted == 0 && total > 0 {
            return Err(SpeechError::QueueFull);
        }
        Ok(accepted)
    }

    /// Queue an existing WAV file for playback. With `override_current`
    /// the current item is stopped and pending items are dropped.
    pub async fn play_file(
        &self,
        path: &Path,
        delete_after_play: bool,
        override_current: bool,
    ) -> Result<(), SpeechError> {
        if !path.is_file() {
            return Err(SpeechError::Backend(anyhow::anyhow!(
                "file not found: {}",
                path.display()
            )));
        }
        let item = PlayItem::File {
            path: path.to_path_buf(),
            delete_after_play,
            caption: None,
        };
        self.sink.enqueue(item, override_current).await
    }

    pub async fn begin_stream(&self, id: Option<String>) -> Result<String, SpeechError> {
        self.registry.open(id, self.voice()).await
    }

    pub async fn stream_push(&self, id: &str, text: &str) -> Result<usize, SpeechError> {
        self.registry.push(id, text).await
    }

    pub async fn stream_finish(&self, id: &str) -> Result<(), SpeechError> {
        self.registry.finish(id).await
    }

    pub fn stream_abort(&self, id: &str) -> Result<(), SpeechError> {
        self.registry
            .abort(id)
            .map(|_| ())
            .ok_or_else(|| SpeechError::UnknownStream(id.to_string()))
    }

    pub fn stream_status(&self, id: &str) -> StreamStatus {
        self.registry.status(id)
    }

    /// Stop the current item. Queued audio keeps playing afterwards.
    pub fn stop_all(&self) {
        self.sink.stop_now();
        info!("Playback stopped");
    }

    /// Hard reset: abort every stream, drop queued and in-flight
    /// synthesis, drop queued audio and stop the current item.
    pub async fn stop_and_clear(&self) {
        let streams = self.registry.abort_all();
        let jobs = self.synth.clear_pending();
        let items = self.sink.clear_pending().await;
        self.sink.stop_now();
        info!(streams, jobs, items, "Stopped and cleared");
    }

    pub fn state(&self) -> ServiceState {
        ServiceState {
            is_playing: self.sink.is_playing(),
            pending_audio: self.sink.pending_count(),
            pending_synth: self.synth.pending_count(),
            active_streams: self.registry.active_count(),
            voice: self.voice(),
            backend: self.backend.name().to_string(),
            model: self.backend.model(),
            output: self.sink.output_name().to_string(),
            current: self.sink.current(),
            underruns: self.sink.underruns(),
        }
    }

    /// Stop every worker and release the backend.
    pub async fn shutdown(&self) {
        self.registry.abort_all();
        self.synth.shutdown().await;
        self.sink.shutdown().await;
        if let Err(e) = self.backend.shutdown().await {
            warn!(error = %e, "Backend shutdown failed");
        }
        info!("Speech service stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::speech::playback::output::testing::RecordingOutput;
    use crate::speech::provider::mock::{MockBackend, MockConfig};

    fn options(dir: &Path, synth_capacity: usize) -> ServiceOptions {
        ServiceOptions {
            segmenter: Segmenter::default(),
            synth_capacity,
            out_dir: dir.to_path_buf(),
            sink: SinkOptions {
                gap: Duration::ZERO,
                ..Default::default()
            },
            voice: None,
        }
    }

    fn service(backend: MockBackend, dir: &Path, synth_capacity: usize) -> SpeechService {
        SpeechService::start(
            Arc::new(backend),
            Arc::new(RecordingOutput::new(100.0)),
            options(dir, synth_capacity),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn speak_counts_units() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(MockBackend::silent(), dir.path(), 16);
        assert_eq!(svc.speak("One. Two!\nThree").unwrap(), 3);
        assert_eq!(svc.speak("   ").unwrap(), 0);
    }

    #[tokio::test]
    async fn speak_is_busy_when_nothing_fits() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(MockBackend::silent().with_latency(500), dir.path(), 2);
        assert_eq!(svc.speak("A. B. C. D.").unwrap(), 2);
        assert!(matches!(svc.speak("E."), Err(SpeechError::QueueFull)));
    }

    #[tokio::test]
    async fn voice_defaults_to_backend_and_can_change() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(MockBackend::silent(), dir.path(), 4);
        assert_eq!(svc.voice().as_deref(), Some("default"));

        svc.set_voice(" narrator ").unwrap();
        assert_eq!(svc.voice().as_deref(), Some("narrator"));
        assert!(matches!(svc.set_voice(""), Err(SpeechError::InvalidVoice(_))));
        assert_eq!(svc.state().voice.as_deref(), Some("narrator"));
    }

    #[tokio::test]
    async fn configured_voice_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), 4);
        opts.voice = Some("  ".into());
        let err = SpeechService::start(
            Arc::new(MockBackend::silent()),
            Arc::new(RecordingOutput::new(100.0)),
            opts,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("empty voice"));
    }

    #[tokio::test]
    async fn state_reports_backend_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(MockBackend::silent(), dir.path(), 4);
        let state = svc.state();
        assert_eq!(state.backend, "mock");
        assert_eq!(state.output, "recording");
        assert!(!state.is_playing);
        assert_eq!(state.active_streams, 0);
    }

    #[tokio::test]
    async fn play_file_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(MockBackend::silent(), dir.path(), 4);
        let err = svc
            .play_file(&dir.path().join("nope.wav"), false, false)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("file not found"));
    }

    #[tokio::test]
    async fn stop_and_clear_quiesces_everything() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::new(MockConfig {
            latency_ms: 30,
            ..Default::default()
        });
        let svc = service(backend, dir.path(), 64);

        svc.speak("One. Two. Three. Four. Five.").unwrap();
        let id = svc.begin_stream(None).await.unwrap();
        svc.stream_push(&id, "Streaming along. ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        svc.stop_and_clear().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = svc.state();
        assert_eq!(state.pending_audio, 0);
        assert_eq!(state.pending_synth, 0);
        assert_eq!(state.active_streams, 0);
        assert!(!state.is_playing);
        assert!(svc.stream_status(&id).done);
    }

    #[test]
    fn device_output_needs_feature() {
        let config = PlaybackConfig {
            output: OutputKind::Device,
            ..Default::default()
        };
        let built = build_output(&config);
        if cfg!(feature = "device") {
            assert!(built.is_ok());
        } else {
            assert!(built.is_err());
        }
    }
}
