//! VOICEVOX-compatible synthesis backend (VOICEVOX, AivisSpeech).
//!
//! Communicates via REST API: `/audio_query` → `/synthesis`.
//!
//! Flow:
//! 1. POST `/audio_query?text=X&speaker=ID` → JSON query parameters
//! 2. Apply speed/pitch/intonation/volume scales from config
//! 3. POST `/synthesis?speaker=ID` with JSON body → WAV audio
//! 4. Decode WAV at its native rate; the sink adapts it on playback
//!
//! Voices are numeric style ids.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{SynthesisBackend, SynthesizedAudio};
use crate::config::VoicevoxConfig;
use crate::speech::audio::decode_wav_bytes;

/// Overrides merged into every `/audio_query` result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Scales {
    speed_scale: f64,
    pitch_scale: f64,
    intonation_scale: f64,
    volume_scale: f64,
}

/// VOICEVOX-compatible backend.
pub struct VoicevoxBackend {
    config: VoicevoxConfig,
    client: reqwest::Client,
}

impl VoicevoxBackend {
    pub fn new(config: VoicevoxConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.endpoint.trim_end_matches('/'))
    }

    fn scales(&self) -> Scales {
        Scales {
            speed_scale: self.config.speed_scale,
            pitch_scale: self.config.pitch_scale,
            intonation_scale: self.config.intonation_scale,
            volume_scale: self.config.volume_scale,
        }
    }

    /// Style id for `voice`, falling back to the configured one.
    fn style_id(&self, voice: Option<&str>) -> Result<u32> {
        match voice {
            Some(v) => parse_style_id(v),
            None => Ok(self.config.style_id),
        }
    }
}

fn parse_style_id(voice: &str) -> Result<u32> {
    voice
        .trim()
        .parse::<u32>()
        .with_context(|| format!("voice must be a numeric style id, got {voice:?}"))
}

/// Overwrite the scale fields of an `/audio_query` result.
fn apply_scales(query: &mut Value, scales: &Scales) -> Result<()> {
    let Value::Object(fields) = serde_json::to_value(scales)? else {
        return Ok(());
    };
    let query = query
        .as_object_mut()
        .context("audio_query response is not an object")?;
    query.extend(fields);
    Ok(())
}

#[async_trait]
impl SynthesisBackend for VoicevoxBackend {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SynthesizedAudio> {
        let speaker = self.style_id(voice)?.to_string();

        let mut query: Value = self
            .client
            .post(self.url("audio_query"))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await
            .context("audio_query request failed")?
            .error_for_status()
            .context("audio_query returned error status")?
            .json()
            .await
            .context("invalid audio_query response")?;
        apply_scales(&mut query, &self.scales())?;

        let wav = self
            .client
            .post(self.url("synthesis"))
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .send()
            .await
            .context("synthesis request failed")?
            .error_for_status()
            .context("synthesis returned error status")?
            .bytes()
            .await
            .context("failed to read synthesis response body")?;

        let clip = decode_wav_bytes(&wav)?;
        debug!(
            speaker = %speaker,
            chars = text.chars().count(),
            samples = clip.samples.len(),
            sample_rate = clip.format.sample_rate,
            "VOICEVOX synthesis complete"
        );
        Ok(SynthesizedAudio {
            samples: clip.samples,
            format: clip.format,
        })
    }

    fn name(&self) -> &str {
        "voicevox"
    }

    fn model(&self) -> Option<String> {
        Some(format!("style {}", self.config.style_id))
    }

    fn default_voice(&self) -> Option<String> {
        Some(self.config.style_id.to_string())
    }

    fn validate_voice(&self, voice: &str) -> Result<()> {
        parse_style_id(voice).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_backend() -> VoicevoxBackend {
        VoicevoxBackend::new(VoicevoxConfig::default())
    }

    fn wav_bytes(sample_rate: u32, samples: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = hound::WavWriter::new(cursor, spec).unwrap();
            for i in 0..samples {
                let t = i as f32 / samples as f32;
                let sample = (t * std::f32::consts::TAU).sin();
                writer.write_sample((sample * 16000.0) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        buf
    }

    #[test]
    fn backend_name() {
        assert_eq!(default_backend().name(), "voicevox");
    }

    #[test]
    fn scales_overwrite_query_fields() {
        let backend = VoicevoxBackend::new(VoicevoxConfig {
            speed_scale: 1.5,
            pitch_scale: 0.1,
            intonation_scale: 1.2,
            volume_scale: 0.8,
            ..Default::default()
        });
        let mut query = serde_json::json!({
            "accent_phrases": [],
            "speedScale": 1.0,
            "pitchScale": 0.0,
            "intonationScale": 1.0,
            "volumeScale": 1.0,
        });
        apply_scales(&mut query, &backend.scales()).unwrap();
        assert_eq!(query["speedScale"], 1.5);
        assert_eq!(query["pitchScale"], 0.1);
        assert_eq!(query["intonationScale"], 1.2);
        assert_eq!(query["volumeScale"], 0.8);
        assert_eq!(query["accent_phrases"], serde_json::json!([]));
    }

    #[test]
    fn scales_are_added_when_missing() {
        let mut query = serde_json::json!({"accent_phrases": []});
        apply_scales(&mut query, &default_backend().scales()).unwrap();
        assert_eq!(query["speedScale"], 1.0);
        assert_eq!(query["pitchScale"], 0.0);
    }

    #[test]
    fn non_object_query_is_rejected() {
        let mut query = serde_json::json!("not an object");
        assert!(apply_scales(&mut query, &default_backend().scales()).is_err());
    }

    #[test]
    fn url_joins_endpoint_and_path() {
        let backend = VoicevoxBackend::new(VoicevoxConfig {
            endpoint: "http://host:50021/".to_string(),
            ..Default::default()
        });
        assert_eq!(backend.url("synthesis"), "http://host:50021/synthesis");
    }

    #[test]
    fn voices_are_style_ids() {
        let backend = default_backend();
        assert!(backend.validate_voice("3").is_ok());
        assert!(backend.validate_voice(" 42 ").is_ok());
        assert!(backend.validate_voice("C:/voices/me.wav").is_err());
        assert_eq!(backend.style_id(None).unwrap(), 1);
        assert_eq!(backend.style_id(Some("7")).unwrap(), 7);
    }

    #[test]
    fn response_wav_keeps_native_rate() {
        let clip = decode_wav_bytes(&wav_bytes(24000, 240)).unwrap();
        assert_eq!(clip.format.sample_rate, 24000);
        assert_eq!(clip.samples.len(), 240);
        assert!(clip.samples.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails() {
        let backend = VoicevoxBackend::new(VoicevoxConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        });
        let err = backend.synthesize("hello", None).await.unwrap_err();
        assert!(format!("{err:#}").contains("audio_query"));
    }
}
