//! ElevenLabs synthesis backend.
//!
//! Batch units go through the REST endpoint
//! `POST /v1/text-to-speech/{voice_id}`; stream sessions use the
//! `stream-input` WebSocket:
//!
//! 1. send an init message (`text: " "`, API key, voice settings,
//!    chunk length schedule)
//! 2. send each unit as `{"text": .., "try_trigger_generation": true}`
//! 3. send `{"text": ""}` to flush and end
//! 4. receive `{"audio": <base64 s16le>, "isFinal": bool}` messages
//!
//! Audio is requested as raw little-endian PCM (`pcm_<rate>`), mono.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};
use url::Url;

use super::{BackendStream, StreamInput, SynthesisBackend, SynthesizedAudio};
use crate::config::ElevenLabsConfig;
use crate::speech::audio::{PcmFormat, s16le_bytes_to_f32};

/// Used when `output_format` carries no rate.
const DEFAULT_SAMPLE_RATE: u32 = 22050;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sample rate encoded in a `pcm_<rate>` output format.
pub fn parse_pcm_sample_rate(output_format: &str) -> u32 {
    output_format
        .trim()
        .strip_prefix("pcm_")
        .and_then(|rate| rate.parse().ok())
        .unwrap_or(DEFAULT_SAMPLE_RATE)
}

// ── Wire messages ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct VoiceSettings {
    stability: f64,
    similarity_boost: f64,
    style: f64,
    use_speaker_boost: bool,
    speed: f64,
}

#[derive(Debug, Serialize)]
struct GenerationConfig<'a> {
    chunk_length_schedule: &'a [u32],
}

#[derive(Debug, Serialize)]
struct InitMessage<'a> {
    text: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    xi_api_key: Option<&'a str>,
    voice_settings: VoiceSettings,
    generation_config: GenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    try_trigger_generation: bool,
}

#[derive(Debug, Deserialize)]
struct AudioMessage {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConvertRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

// ── Backend ──────────────────────────────────────────────────────

pub struct ElevenLabsBackend {
    config: ElevenLabsConfig,
    client: reqwest::Client,
    format: PcmFormat,
}

impl ElevenLabsBackend {
    pub fn new(config: ElevenLabsConfig) -> Result<Self> {
        Url::parse(&config.http_url).context("invalid elevenlabs http_url")?;
        Url::parse(&config.ws_url).context("invalid elevenlabs ws_url")?;
        let format = PcmFormat::mono(parse_pcm_sample_rate(&config.output_format));
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            format,
        })
    }

    fn voice_settings(&self) -> VoiceSettings {
        VoiceSettings {
            stability: self.config.stability,
            similarity_boost: self.config.similarity_boost,
            style: self.config.style,
            use_speaker_boost: self.config.use_speaker_boost,
            speed: self.config.speed,
        }
    }

    fn voice_id<'a>(&'a self, voice: Option<&'a str>) -> &'a str {
        voice
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.config.voice_id)
    }

    fn convert_url(&self, voice_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.http_url)?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("http_url cannot be a base"))?
            .pop_if_empty()
            .extend(["v1", "text-to-speech", voice_id]);
        url.query_pairs_mut()
            .append_pair("output_format", &self.config.output_format);
        Ok(url)
    }

    fn stream_url(&self, voice_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.ws_url)?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("ws_url cannot be a base"))?
            .pop_if_empty()
            .extend(["v1", "text-to-speech", voice_id, "stream-input"]);
        url.query_pairs_mut()
            .append_pair("model_id", &self.config.model_id)
            .append_pair("output_format", &self.config.output_format);
        Ok(url)
    }

    fn init_message(&self, api_key: Option<&str>) -> Result<String> {
        let init = InitMessage {
            text: " ",
            xi_api_key: api_key,
            voice_settings: self.voice_settings(),
            generation_config: GenerationConfig {
                chunk_length_schedule: &self.config.chunk_length_schedule,
            },
        };
        Ok(serde_json::to_string(&init)?)
    }
}

#[async_trait]
impl SynthesisBackend for ElevenLabsBackend {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SynthesizedAudio> {
        let voice_id = self.voice_id(voice);
        let url = self.convert_url(voice_id)?;
        let mut request = self.client.post(url).json(&ConvertRequest {
            text,
            model_id: &self.config.model_id,
            voice_settings: self.voice_settings(),
        });
        if let Some(key) = self.config.api_key() {
            request = request.header("xi-api-key", key);
        }

        let pcm = request
            .send()
            .await
            .context("text-to-speech request failed")?
            .error_for_status()
            .context("text-to-speech returned error status")?
            .bytes()
            .await
            .context("failed to read text-to-speech response body")?;

        let samples = s16le_bytes_to_f32(&pcm);
        debug!(voice = voice_id, samples = samples.len(), "ElevenLabs synthesis complete");
        Ok(SynthesizedAudio {
            samples,
            format: self.format,
        })
    }

    fn name(&self) -> &str {
        "elevenlabs"
    }

    fn model(&self) -> Option<String> {
        Some(format!("{} ({})", self.config.model_id, self.config.output_format))
    }

    fn default_voice(&self) -> Option<String> {
        Some(self.config.voice_id.clone())
    }

    /// Voices are ElevenLabs voice ids, never local prompt files.
    fn validate_voice(&self, voice: &str) -> Result<()> {
        let voice = voice.trim();
        if voice.is_empty() {
            anyhow::bail!("empty voice id");
        }
        if Path::new(voice).exists() {
            anyhow::bail!(
                "expected an ElevenLabs voice_id, not a local file path: {voice}"
            );
        }
        Ok(())
    }

    async fn open_stream(&self, voice: Option<&str>) -> Result<Option<BackendStream>> {
        let voice_id = self.voice_id(voice).to_string();
        let url = self.stream_url(&voice_id)?;
        let api_key = self.config.api_key();
        let init = self.init_message(api_key.as_deref())?;

        let (input_tx, input_rx) = mpsc::channel::<StreamInput>(256);
        let (output_tx, output_rx) = mpsc::channel::<Result<Vec<f32>>>(64);

        tokio::spawn(async move {
            let errors = output_tx.clone();
            if let Err(e) = run_stream(url, api_key, init, input_rx, output_tx).await {
                warn!(voice = %voice_id, error = %e, "ElevenLabs stream failed");
                let _ = errors.send(Err(e)).await;
            }
        });

        Ok(Some(BackendStream {
            format: self.format,
            input: input_tx,
            output: output_rx,
        }))
    }
}

async fn run_stream(
    url: Url,
    api_key: Option<String>,
    init: String,
    mut input: mpsc::Receiver<StreamInput>,
    output: mpsc::Sender<Result<Vec<f32>>>,
) -> Result<()> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(key) = &api_key {
        request
            .headers_mut()
            .insert("xi-api-key", HeaderValue::from_str(key)?);
    }

    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .context("stream-input connect timed out")?
        .context("stream-input connect failed")?;
    info!(url = %url.path(), "ElevenLabs stream connected");

    let (mut sink, mut stream) = ws.split();
    sink.send(WsMessage::Text(init)).await?;

    let mut input_open = true;
    loop {
        tokio::select! {
            next = input.recv(), if input_open => match next {
                Some(StreamInput::Text(text)) => {
                    let text = format!("{} ", text.trim());
                    let msg = serde_json::to_string(&TextMessage {
                        text: &text,
                        try_trigger_generation: true,
                    })?;
                    sink.send(WsMessage::Text(msg)).await?;
                }
                Some(StreamInput::Finish) => {
                    let msg = serde_json::to_string(&TextMessage { text: "", try_trigger_generation: false })?;
                    sink.send(WsMessage::Text(msg)).await?;
                    input_open = false;
                }
                Some(StreamInput::Abort) | None => {
                    let msg = serde_json::to_string(&TextMessage { text: "", try_trigger_generation: false })?;
                    let _ = sink.send(WsMessage::Text(msg)).await;
                    let _ = sink.close().await;
                    debug!("ElevenLabs stream aborted");
                    return Ok(());
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(msg) = serde_json::from_str::<AudioMessage>(&text) else {
                        continue;
                    };
                    if let Some(error) = msg.error {
                        anyhow::bail!("server error: {error}");
                    }
                    if let Some(audio) = msg.audio.filter(|a| !a.is_empty()) {
                        let bytes = BASE64.decode(audio).context("invalid base64 audio")?;
                        let samples = s16le_bytes_to_f32(&bytes);
                        if !samples.is_empty() && output.send(Ok(samples)).await.is_err() {
                            return Ok(());
                        }
                    }
                    if msg.is_final.unwrap_or(false) {
                        debug!("ElevenLabs stream final");
                        return Ok(());
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("stream-input receive failed"),
            },
        }
    }
}
