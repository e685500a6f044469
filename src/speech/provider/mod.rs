//! Synthesis backend trait and implementations.

pub mod elevenlabs;
pub mod mock;
pub mod voicevox;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::BackendConfig;
use crate::speech::audio::PcmFormat;

/// Result of a batch synthesis call.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
    pub format: PcmFormat,
}

impl SynthesizedAudio {
    pub fn duration_ms(&self) -> f64 {
        self.format.duration_ms(self.samples.len())
    }
}

/// Input to a push-based backend stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamInput {
    /// One complete utterance unit.
    Text(String),
    /// No more text; flush and close once all audio is out.
    Finish,
    /// Drop everything and close now.
    Abort,
}

/// An open push-based synthesis stream.
///
/// Units go in through `input` in order; PCM chunks in `format` come out
/// of `output` in order. `output` closes after the last chunk, or after
/// the first error.
pub struct BackendStream {
    pub format: PcmFormat,
    pub input: mpsc::Sender<StreamInput>,
    pub output: mpsc::Receiver<Result<Vec<f32>>>,
}

/// Text-to-speech backend.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Synthesize one unit into audio.
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SynthesizedAudio>;

    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Model identifier reported by `get_state`, if the backend has one.
    fn model(&self) -> Option<String> {
        None
    }

    /// Voice used when none has been selected.
    fn default_voice(&self) -> Option<String> {
        None
    }

    /// Reject voice identifiers this backend cannot use.
    fn validate_voice(&self, voice: &str) -> Result<()> {
        if voice.trim().is_empty() {
            anyhow::bail!("empty voice id");
        }
        Ok(())
    }

    /// Open a push-based stream. Backends without one return `None` and
    /// stream sessions fall back to per-unit synthesis.
    async fn open_stream(&self, _voice: Option<&str>) -> Result<Option<BackendStream>> {
        Ok(None)
    }

    /// Release resources.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the backend named in `config.provider`.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn SynthesisBackend>> {
    let backend: Arc<dyn SynthesisBackend> = match config.provider.as_str() {
        "mock" => Arc::new(mock::MockBackend::from_config(&config.mock)),
        "voicevox" | "aivis-speech" => {
            Arc::new(voicevox::VoicevoxBackend::new(config.voicevox.clone()))
        }
        "elevenlabs" => Arc::new(elevenlabs::ElevenLabsBackend::new(config.elevenlabs.clone())?),
        other => anyhow::bail!("unknown synthesis backend: {other}"),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_known_backends() {
        let mut config = BackendConfig::default();
        assert_eq!(build_backend(&config).unwrap().name(), "mock");

        config.provider = "voicevox".into();
        assert_eq!(build_backend(&config).unwrap().name(), "voicevox");
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let config = BackendConfig {
            provider: "espeak".into(),
            ..Default::default()
        };
        let err = build_backend(&config).err().unwrap();
        assert!(err.to_string().contains("espeak"));
    }

    #[test]
    fn synthesized_audio_duration() {
        let audio = SynthesizedAudio {
            samples: vec![0.0; 24000],
            format: PcmFormat::mono(24000),
        };
        assert!((audio.duration_ms() - 1000.0).abs() < f64::EPSILON);
    }
}
