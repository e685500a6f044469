//! Sound-card output through `cpal`.
//!
//! Each item opens an output stream whose callback pulls straight from
//! the item's [`FrameSource`]. When the device cannot run at the clip's
//! rate or channel count, samples are remixed and resampled with
//! `rubato` on the way through.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use rubato::{FftFixedIn, Resampler as _};
use tracing::{debug, error, info};

use super::output::{AudioOutput, Fill, FrameSource, PlaybackOutcome, PlaybackRequest};
use crate::speech::audio::PcmFormat;
use crate::speech::error::AudioError;

/// Frames per resampler call.
const RESAMPLE_CHUNK: usize = 1024;

/// Output to a `cpal` device, the default one unless a name is given.
pub struct CpalOutput {
    device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn device(&self) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host.default_output_device().ok_or(AudioError::NoDevice),
            Some(wanted) => host
                .output_devices()
                .map_err(|e| AudioError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == *wanted).unwrap_or(false))
                .ok_or(AudioError::NoDevice),
        }
    }

    /// Pick a stream config, preferring one that matches `format` exactly.
    fn config_for(
        device: &cpal::Device,
        format: PcmFormat,
    ) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let rate = cpal::SampleRate(format.sample_rate);
        let exact = device
            .supported_output_configs()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
            .find(|c| {
                c.channels() == format.channels
                    && c.min_sample_rate() <= rate
                    && rate <= c.max_sample_rate()
            });
        if let Some(range) = exact {
            let sample_format = range.sample_format();
            return Ok((range.with_sample_rate(rate).into(), sample_format));
        }

        let fallback = device
            .default_output_config()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        let sample_format = fallback.sample_format();
        Ok((fallback.into(), sample_format))
    }
}

impl AudioOutput for CpalOutput {
    fn play(&self, request: PlaybackRequest) -> Result<PlaybackOutcome, AudioError> {
        let device = self.device()?;
        let format = request.source.format();
        let (config, sample_format) = Self::config_for(&device, format)?;
        let device_format = PcmFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };

        let mut source: Box<dyn FrameSource> = if device_format == format {
            request.source
        } else {
            debug!(
                from_rate = format.sample_rate,
                from_channels = format.channels,
                to_rate = device_format.sample_rate,
                to_channels = device_format.channels,
                "Adapting clip to device format"
            );
            Box::new(Adapter::new(request.source, device_format)?)
        };

        let (done_tx, done_rx) = mpsc::sync_channel::<PlaybackOutcome>(1);
        let stop = request.stop.clone();
        let mut finished = false;
        let mut render = move |data: &mut [f32]| {
            if finished {
                data.fill(0.0);
                return;
            }
            if stop.is_stopped() {
                data.fill(0.0);
                finished = true;
                let _ = done_tx.try_send(PlaybackOutcome::Interrupted);
                return;
            }
            if let Fill::Done(_) = source.fill(data) {
                finished = true;
                let _ = done_tx.try_send(PlaybackOutcome::Finished);
            }
        };

        let err_fn = |err: cpal::StreamError| {
            error!(%err, "Audio output stream error");
        };

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data),
                err_fn,
                None,
            ),
            SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0f32);
                        render(&mut scratch);
                        for (out, s) in data.iter_mut().zip(&scratch) {
                            *out = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(AudioError::Device(format!(
                    "unsupported device sample format: {other:?}"
                )));
            }
        }
        .map_err(|e| AudioError::Device(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        info!(item = %request.label, rate = device_format.sample_rate, "Device playback started");

        let outcome = loop {
            match done_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(outcome) => break outcome,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if request.stop.is_stopped() {
                        break PlaybackOutcome::Interrupted;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::Device("output stream closed".into()));
                }
            }
        };

        // Let the last buffer reach the speaker.
        if outcome == PlaybackOutcome::Finished {
            std::thread::sleep(Duration::from_millis(50));
        }
        drop(stream);
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

// ── Format adaptation ────────────────────────────────────────────

/// Remix and resample a source into another PCM format.
struct Adapter {
    inner: Box<dyn FrameSource>,
    from: PcmFormat,
    to: PcmFormat,
    resampler: Option<FftFixedIn<f32>>,
    ready: VecDeque<f32>,
    inner_done: bool,
}

impl Adapter {
    fn new(inner: Box<dyn FrameSource>, to: PcmFormat) -> Result<Self, AudioError> {
        let from = inner.format();
        let resampler = if from.sample_rate == to.sample_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    from.sample_rate as usize,
                    to.sample_rate as usize,
                    RESAMPLE_CHUNK,
                    2,
                    to.channels.max(1) as usize,
                )
                .map_err(|e| AudioError::Device(format!("resampler: {e}")))?,
            )
        };
        Ok(Self {
            inner,
            from,
            to,
            resampler,
            ready: VecDeque::new(),
            inner_done: false,
        })
    }

    /// Pull one chunk from the inner source into `ready`.
    fn pump(&mut self) {
        let in_ch = self.from.channels.max(1) as usize;
        let out_ch = self.to.channels.max(1) as usize;
        let mut raw = vec![0.0f32; RESAMPLE_CHUNK * in_ch];
        let written = match self.inner.fill(&mut raw) {
            Fill::More(n) => n,
            Fill::Done(n) => {
                self.inner_done = true;
                n
            }
        };
        let frames = written / in_ch;

        // Planar, remixed to the output channel count.
        let mut planar = vec![vec![0.0f32; RESAMPLE_CHUNK]; out_ch];
        for (f, frame) in raw.chunks_exact(in_ch).enumerate() {
            for (c, plane) in planar.iter_mut().enumerate() {
                plane[f] = remix(frame, c, out_ch);
            }
        }

        let (planes, produced) = match self.resampler.as_mut() {
            Some(resampler) => match resampler.process(&planar, None) {
                Ok(out) => {
                    let ratio = self.to.sample_rate as f64 / self.from.sample_rate as f64;
                    let take = if self.inner_done {
                        ((frames as f64) * ratio).ceil() as usize
                    } else {
                        usize::MAX
                    };
                    let n = out.first().map(|p| p.len()).unwrap_or(0).min(take);
                    (out, n)
                }
                Err(e) => {
                    error!(error = %e, "Resampling failed, ending item");
                    self.inner_done = true;
                    return;
                }
            },
            None => (planar, frames),
        };

        for f in 0..produced {
            for plane in &planes {
                self.ready.push_back(plane[f]);
            }
        }
    }
}

/// Output channel `c` of `out_ch` for one interleaved input frame.
fn remix(frame: &[f32], c: usize, out_ch: usize) -> f32 {
    match (frame.len(), out_ch) {
        (1, _) => frame[0],
        (_, 1) => frame.iter().sum::<f32>() / frame.len() as f32,
        (n, _) => frame.get(c).copied().unwrap_or(frame[n - 1]),
    }
}

impl FrameSource for Adapter {
    fn format(&self) -> PcmFormat {
        self.to
    }

    fn fill(&mut self, out: &mut [f32]) -> Fill {
        while self.ready.len() < out.len() && !self.inner_done {
            self.pump();
        }
        let n = self.ready.len().min(out.len());
        for (slot, s) in out.iter_mut().zip(self.ready.drain(..n)) {
            *slot = s;
        }
        out[n..].fill(0.0);
        if self.inner_done && self.ready.is_empty() {
            Fill::Done(n)
        } else {
            Fill::More(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::output::ClipSource;
    use super::*;

    fn drain(src: &mut dyn FrameSource) -> Vec<f32> {
        let mut all = Vec::new();
        let mut buf = vec![0.0f32; 256];
        loop {
            match src.fill(&mut buf) {
                Fill::More(n) => all.extend_from_slice(&buf[..n]),
                Fill::Done(n) => {
                    all.extend_from_slice(&buf[..n]);
                    return all;
                }
            }
        }
    }

    #[test]
    fn remix_mono_to_stereo_duplicates() {
        assert_eq!(remix(&[0.5], 0, 2), 0.5);
        assert_eq!(remix(&[0.5], 1, 2), 0.5);
        assert_eq!(remix(&[0.2, 0.4], 0, 1), 0.3);
    }

    #[test]
    fn adapter_remixes_without_resampling() {
        let clip = ClipSource::new(vec![0.25; 1000], PcmFormat::mono(48000));
        let mut a = Adapter::new(Box::new(clip), PcmFormat { sample_rate: 48000, channels: 2 }).unwrap();
        let out = drain(&mut a);
        assert_eq!(out.len(), 2000);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn adapter_resamples_length_proportionally() {
        let clip = ClipSource::new(vec![0.0; 24000], PcmFormat::mono(24000));
        let mut a = Adapter::new(Box::new(clip), PcmFormat::mono(48000)).unwrap();
        let out = drain(&mut a);
        assert!(out.len() > 40000 && out.len() <= 50000, "got {}", out.len());
    }
}
