//! Configuration loading.
//!
//! `config.toml` is optional; every field has a default. Command-line
//! flags are applied on top by the binary.

pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::speech::segmenter::{DEFAULT_MAX_CHARS, HoldBack};

pub use schema::{parse_duration, parse_port};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Server ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections silent for this long are closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            idle_timeout: default_idle_timeout(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Result<Duration> {
        duration_field("server.idle_timeout", &self.idle_timeout)
    }
}

// ── Synthesis ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Where WAV artifacts are written. Defaults to a directory under the
    /// system temp dir.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub hold_back: HoldBack,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_chars: default_max_chars(),
            output_dir: None,
            hold_back: HoldBack::default(),
        }
    }
}

impl SynthesisConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("speakd"))
    }
}

// ── Playback ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Headless, real-time paced output.
    #[default]
    Clocked,
    /// Sound card (requires the `device` feature).
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub output: OutputKind,
    /// Output device name; the system default when unset.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_gap")]
    pub gap: String,
    #[serde(default = "default_prebuffer_chunks")]
    pub prebuffer_chunks: usize,
    #[serde(default = "default_live_channel_capacity")]
    pub live_channel_capacity: usize,
    #[serde(default = "default_stream_start_timeout")]
    pub stream_start_timeout: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output: OutputKind::default(),
            device: None,
            queue_capacity: default_queue_capacity(),
            gap: default_gap(),
            prebuffer_chunks: default_prebuffer_chunks(),
            live_channel_capacity: default_live_channel_capacity(),
            stream_start_timeout: default_stream_start_timeout(),
        }
    }
}

impl PlaybackConfig {
    pub fn gap(&self) -> Result<Duration> {
        duration_field("playback.gap", &self.gap)
    }

    pub fn stream_start_timeout(&self) -> Result<Duration> {
        duration_field("playback.stream_start_timeout", &self.stream_start_timeout)
    }
}

// ── Backends ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `mock`, `voicevox`, or `elevenlabs`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Voice used until a client calls `set_voice`.
    #[serde(default)]
    pub default_voice: Option<String>,
    #[serde(default)]
    pub mock: MockBackendConfig,
    #[serde(default)]
    pub voicevox: VoicevoxConfig,
    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            default_voice: None,
            mock: MockBackendConfig::default(),
            voicevox: VoicevoxConfig::default(),
            elevenlabs: ElevenLabsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockBackendConfig {
    #[serde(default = "default_mock_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_ms_per_char")]
    pub ms_per_char: f64,
    #[serde(default = "default_min_duration_ms")]
    pub min_duration_ms: f64,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: f64,
    /// Sine tone frequency; silence when unset.
    #[serde(default)]
    pub tone_hz: Option<f32>,
    #[serde(default)]
    pub latency_ms: u64,
    /// Serve stream sessions as live PCM instead of per-unit clips.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_mock_sample_rate(),
            ms_per_char: default_ms_per_char(),
            min_duration_ms: default_min_duration_ms(),
            max_duration_ms: default_max_duration_ms(),
            tone_hz: None,
            latency_ms: 0,
            streaming: false,
            chunk_ms: default_chunk_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicevoxConfig {
    #[serde(default = "default_voicevox_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_style_id")]
    pub style_id: u32,
    #[serde(default = "default_scale")]
    pub speed_scale: f64,
    #[serde(default)]
    pub pitch_scale: f64,
    #[serde(default = "default_scale")]
    pub intonation_scale: f64,
    #[serde(default = "default_scale")]
    pub volume_scale: f64,
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            endpoint: default_voicevox_endpoint(),
            style_id: default_style_id(),
            speed_scale: default_scale(),
            pitch_scale: 0.0,
            intonation_scale: default_scale(),
            volume_scale: default_scale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevenLabsConfig {
    /// Falls back to the `ELEVENLABS_API_KEY` environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_elevenlabs_http")]
    pub http_url: String,
    #[serde(default = "default_elevenlabs_ws")]
    pub ws_url: String,
    #[serde(default = "default_elevenlabs_voice")]
    pub voice_id: String,
    #[serde(default = "default_elevenlabs_model")]
    pub model_id: String,
    /// Must be a raw PCM format such as `pcm_22050`.
    #[serde(default = "default_elevenlabs_format")]
    pub output_format: String,
    #[serde(default = "default_stability")]
    pub stability: f64,
    #[serde(default = "default_stability")]
    pub similarity_boost: f64,
    #[serde(default = "default_style")]
    pub style: f64,
    #[serde(default)]
    pub use_speaker_boost: bool,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_chunk_schedule")]
    pub chunk_length_schedule: Vec<u32>,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            http_url: default_elevenlabs_http(),
            ws_url: default_elevenlabs_ws(),
            voice_id: default_elevenlabs_voice(),
            model_id: default_elevenlabs_model(),
            output_format: default_elevenlabs_format(),
            stability: default_stability(),
            similarity_boost: default_stability(),
            style: default_style(),
            use_speaker_boost: false,
            speed: default_speed(),
            chunk_length_schedule: default_chunk_schedule(),
        }
    }
}

impl ElevenLabsConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("ELEVENLABS_API_KEY").ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

// ── Logging ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    17777
}
fn default_idle_timeout() -> String {
    "60s".to_string()
}
fn default_max_line_bytes() -> usize {
    1024 * 1024
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}
fn default_gap() -> String {
    "800ms".to_string()
}
fn default_prebuffer_chunks() -> usize {
    3
}
fn default_live_channel_capacity() -> usize {
    64
}
fn default_stream_start_timeout() -> String {
    "10s".to_string()
}
fn default_provider() -> String {
    "mock".to_string()
}
fn default_mock_sample_rate() -> u32 {
    24000
}
fn default_ms_per_char() -> f64 {
    60.0
}
fn default_min_duration_ms() -> f64 {
    200.0
}
fn default_max_duration_ms() -> f64 {
    30000.0
}
fn default_chunk_ms() -> u64 {
    100
}
fn default_voicevox_endpoint() -> String {
    "http://127.0.0.1:50021".to_string()
}
fn default_style_id() -> u32 {
    1
}
fn default_scale() -> f64 {
    1.0
}
fn default_elevenlabs_http() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_elevenlabs_ws() -> String {
    "wss://api.elevenlabs.io".to_string()
}
fn default_elevenlabs_voice() -> String {
    "Y8CIE2UXHetTCsBPUIBa".to_string()
}
fn default_elevenlabs_model() -> String {
    "eleven_turbo_v2_5".to_string()
}
fn default_elevenlabs_format() -> String {
    "pcm_22050".to_string()
}
fn default_stability() -> f64 {
    0.6
}
fn default_style() -> f64 {
    0.1
}
fn default_speed() -> f64 {
    1.1
}
fn default_chunk_schedule() -> Vec<u32> {
    vec![120, 160, 250, 290]
}
fn default_log_level() -> String {
    "info".to_string()
}

fn duration_field(name: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| anyhow::anyhow!("{name}: {e}"))
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Default config file location (`<config dir>/speakd/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "speakd").map(|d| d.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location if it exists.
    /// A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => {
                    debug!("No config file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.server.idle_timeout()?;
        self.playback.gap()?;
        self.playback.stream_start_timeout()?;
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.synthesis.max_chars == 0 {
            anyhow::bail!("synthesis.max_chars must be positive");
        }
        if !self.backend.elevenlabs.output_format.starts_with("pcm_") {
            anyhow::bail!(
                "backend.elevenlabs.output_format must be a pcm_<rate> format, got {}",
                self.backend.elevenlabs.output_format
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_defaults() {
        let c = Config::default();
        assert_eq!(c.server.addr(), "127.0.0.1:17777");
        assert_eq!(c.server.idle_timeout().unwrap(), Duration::from_secs(60));
        assert_eq!(c.synthesis.queue_capacity, 256);
        assert_eq!(c.synthesis.max_chars, 320);
        assert_eq!(c.synthesis.hold_back, HoldBack::Sealed);
        assert_eq!(c.playback.queue_capacity, 256);
        assert_eq!(c.playback.gap().unwrap(), Duration::from_millis(800));
        assert_eq!(c.playback.prebuffer_chunks, 3);
        assert_eq!(c.backend.provider, "mock");
        assert_eq!(c.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn empty_toml_is_default() {
        let c = Config::from_toml("").unwrap();
        assert_eq!(c.server.port, 17777);
        assert_eq!(c.backend.elevenlabs.chunk_length_schedule, vec![120, 160, 250, 290]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let c = Config::from_toml(
            r#"
            [server]
            port = 18000

            [synthesis]
            hold_back = "trailing"

            [playback]
            gap = "0ms"
            output = "device"

            [backend]
            provider = "voicevox"

            [backend.voicevox]
            style_id = 3

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(c.server.port, 18000);
        assert_eq!(c.server.host, "127.0.0.1");
        assert_eq!(c.synthesis.hold_back, HoldBack::Trailing);
        assert_eq!(c.playback.gap().unwrap(), Duration::ZERO);
        assert_eq!(c.playback.output, OutputKind::Device);
        assert_eq!(c.backend.voicevox.style_id, 3);
        assert_eq!(c.backend.voicevox.endpoint, "http://127.0.0.1:50021");
        assert_eq!(c.logging.format, LogFormat::Json);
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = Config::from_toml("[playback]\ngap = \"soon\"").unwrap_err();
        assert!(format!("{err:#}").contains("playback.gap"));
    }

    #[test]
    fn non_pcm_output_format_is_rejected() {
        assert!(Config::from_toml("[backend.elevenlabs]\noutput_format = \"mp3_44100\"").is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\n").unwrap();
        let c = Config::load(Some(&path)).unwrap();
        assert_eq!(c.server.host, "0.0.0.0");
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        assert!(Config::load(Some(Path::new("/nonexistent/speakd.toml"))).is_err());
    }
}
