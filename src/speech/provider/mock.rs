//! Mock synthesis backend.
//!
//! Generates silence or sine-wave audio with deterministic duration
//! based on input text length. Useful for running the service and its
//! tests without an external TTS server. Optionally serves stream
//! sessions as live PCM.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use super::{BackendStream, StreamInput, SynthesisBackend, SynthesizedAudio};
use crate::config::MockBackendConfig;
use crate::speech::audio::PcmFormat;

// ── Configuration ────────────────────────────────────────────────

/// Waveform type for mock audio generation.
#[derive(Debug, Clone)]
pub enum MockWaveform {
    Silence,
    Sine { frequency_hz: f32, amplitude: f32 },
}

/// Configuration for [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub sample_rate: u32,
    pub ms_per_char: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub waveform: MockWaveform,
    pub latency_ms: u64,
    pub streaming: bool,
    pub chunk_ms: u64,
    /// Synthesis fails for any text containing this marker.
    pub fail_marker: Option<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            ms_per_char: 60.0,
            min_duration_ms: 200.0,
            max_duration_ms: 30000.0,
            waveform: MockWaveform::Silence,
            latency_ms: 0,
            streaming: false,
            chunk_ms: 100,
            fail_marker: None,
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────

/// Mock backend that generates deterministic audio.
pub struct MockBackend {
    config: MockConfig,
}

impl MockBackend {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &MockBackendConfig) -> Self {
        Self::new(MockConfig {
            sample_rate: config.sample_rate,
            ms_per_char: config.ms_per_char,
            min_duration_ms: config.min_duration_ms,
            max_duration_ms: config.max_duration_ms,
            waveform: match config.tone_hz {
                Some(frequency_hz) => MockWaveform::Sine {
                    frequency_hz,
                    amplitude: 0.3,
                },
                None => MockWaveform::Silence,
            },
            latency_ms: config.latency_ms,
            streaming: config.streaming,
            chunk_ms: config.chunk_ms,
            fail_marker: None,
        })
    }

    /// Create a silent mock backend with default settings.
    pub fn silent() -> Self {
        Self::new(MockConfig::default())
    }

    /// Create a sine-wave mock backend at the given frequency.
    pub fn sine(frequency_hz: f32) -> Self {
        Self::new(MockConfig {
            waveform: MockWaveform::Sine {
                frequency_hz,
                amplitude: 0.8,
            },
            ..Default::default()
        })
    }

    /// Set simulated synthesis latency.
    pub fn with_latency(mut self, ms: u64) -> Self {
        self.config.latency_ms = ms;
        self
    }

    /// Serve stream sessions as live PCM.
    pub fn streaming(mut self) -> Self {
        self.config.streaming = true;
        self
    }

    /// Fail synthesis of any text containing `marker`.
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.config.fail_marker = Some(marker.to_string());
        self
    }

    fn render(config: &MockConfig, text: &str) -> Result<Vec<f32>> {
        if let Some(marker) = &config.fail_marker {
            if text.contains(marker.as_str()) {
                anyhow::bail!("mock synthesis failure for {text:?}");
            }
        }

        let char_count = text.chars().count() as f64;
        let duration_ms = (char_count * config.ms_per_char)
            .clamp(config.min_duration_ms, config.max_duration_ms);
        let sample_count = (config.sample_rate as f64 * duration_ms / 1000.0) as usize;

        let audio = match &config.waveform {
            MockWaveform::Silence => vec![0.0f32; sample_count],
            MockWaveform::Sine {
                frequency_hz,
                amplitude,
            } => (0..sample_count)
                .map(|i| {
                    let t = i as f32 / config.sample_rate as f32;
                    amplitude * (2.0 * std::f32::consts::PI * frequency_hz * t).sin()
                })
                .collect(),
        };
        Ok(audio)
    }
}

#[async_trait]
impl SynthesisBackend for MockBackend {
    async fn synthesize(&self, text: &str, _voice: Option<&str>) -> Result<SynthesizedAudio> {
        if self.config.latency_ms > 0 {
            sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        let samples = Self::render(&self.config, text)?;
        Ok(SynthesizedAudio {
            samples,
            format: PcmFormat::mono(self.config.sample_rate),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> Option<String> {
        Some("mock".to_string())
    }

    fn default_voice(&self) -> Option<String> {
        Some("default".to_string())
    }

    async fn open_stream(&self, _voice: Option<&str>) -> Result<Option<BackendStream>> {
        if !self.config.streaming {
            return Ok(None);
        }

        let (input_tx, mut input_rx) = mpsc::channel::<StreamInput>(64);
        let (output_tx, output_rx) = mpsc::channel::<Result<Vec<f32>>>(16);
        let config = self.config.clone();
        let chunk_len =
            ((config.sample_rate as u64 * config.chunk_ms.max(1)) / 1000).max(1) as usize;

        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let text = match input {
                    StreamInput::Text(text) => text,
                    StreamInput::Finish | StreamInput::Abort => break,
                };
                if config.latency_ms > 0 {
                    sleep(Duration::from_millis(config.latency_ms)).await;
                }
                match Self::render(&config, &text) {
                    Ok(audio) => {
                        debug!(chars = text.chars().count(), samples = audio.len(), "Mock stream unit");
                        for chunk in audio.chunks(chunk_len) {
                            if output_tx.send(Ok(chunk.to_vec())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = output_tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        Ok(Some(BackendStream {
            format: PcmFormat::mono(self.config.sample_rate),
            input: input_tx,
            output: output_rx,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duration_calculation() {
        let backend = MockBackend::silent();
        let result = backend.synthesize("hello", None).await.unwrap();
        // 5 chars * 60 ms/char = 300 ms
        assert!((result.duration_ms() - 300.0).abs() < 1e-6);
        // 24000 Hz * 0.3 s = 7200 samples
        assert_eq!(result.samples.len(), 7200);
    }

    #[tokio::test]
    async fn min_duration() {
        let backend = MockBackend::silent();
        let result = backend.synthesize("a", None).await.unwrap();
        // 1 char * 60 ms = 60 ms, clamped to min 200 ms
        assert!((result.duration_ms() - 200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sine_wave() {
        let backend = MockBackend::sine(440.0);
        let result = backend.synthesize("hello", None).await.unwrap();
        let max_amp = result.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        assert!(max_amp > 0.4, "max amplitude was {}", max_amp);
    }

    #[tokio::test]
    async fn fail_marker_errors() {
        let backend = MockBackend::silent().failing_on("boom");
        assert!(backend.synthesize("it goes boom", None).await.is_err());
        assert!(backend.synthesize("fine", None).await.is_ok());
    }

    #[tokio::test]
    async fn batch_mode_has_no_stream() {
        let backend = MockBackend::silent();
        assert!(backend.open_stream(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_emits_chunks_in_order_then_closes() {
        let backend = MockBackend::new(MockConfig {
            sample_rate: 1000,
            ms_per_char: 100.0,
            min_duration_ms: 0.0,
            chunk_ms: 100,
            ..Default::default()
        })
        .streaming();
        let mut stream = backend.open_stream(None).await.unwrap().unwrap();
        assert_eq!(stream.format, PcmFormat::mono(1000));

        stream.input.send(StreamInput::Text("abc".into())).await.unwrap();
        stream.input.send(StreamInput::Finish).await.unwrap();

        let mut total = 0;
        while let Some(chunk) = stream.output.recv().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= 100);
            total += chunk.len();
        }
        // 3 chars * 100 ms at 1 kHz
        assert_eq!(total, 300);
    }

    #[tokio::test]
    async fn stream_error_closes_output() {
        let backend = MockBackend::silent().streaming().failing_on("bad");
        let mut stream = backend.open_stream(None).await.unwrap().unwrap();
        stream.input.send(StreamInput::Text("bad unit".into())).await.unwrap();
        assert!(stream.output.recv().await.unwrap().is_err());
        assert!(stream.output.recv().await.is_none());
    }
}
