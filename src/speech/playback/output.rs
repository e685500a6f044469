//! Audio output abstraction.
//!
//! An [`AudioOutput`] renders one item at a time by repeatedly asking a
//! [`FrameSource`] to fill a buffer, the same way a device callback
//! would. Stopping is cooperative: the output checks the item's
//! [`StopToken`] once per buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::speech::audio::PcmFormat;
use crate::speech::error::AudioError;

/// Result of one fill call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// `n` real samples were written; more will follow.
    More(usize),
    /// `n` real samples were written and the source is exhausted.
    Done(usize),
}

/// Pull-based sample source. Implementations zero-pad whatever part of
/// `out` they could not fill.
pub trait FrameSource: Send {
    fn format(&self) -> PcmFormat;

    fn fill(&mut self, out: &mut [f32]) -> Fill;
}

/// In-memory clip source.
pub struct ClipSource {
    samples: Vec<f32>,
    format: PcmFormat,
    pos: usize,
}

impl ClipSource {
    pub fn new(samples: Vec<f32>, format: PcmFormat) -> Self {
        Self {
            samples,
            format,
            pos: 0,
        }
    }
}

impl FrameSource for ClipSource {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn fill(&mut self, out: &mut [f32]) -> Fill {
        let remaining = &self.samples[self.pos..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        out[n..].fill(0.0);
        self.pos += n;
        if self.pos >= self.samples.len() {
            Fill::Done(n)
        } else {
            Fill::More(n)
        }
    }
}

// ── Stop signalling ──────────────────────────────────────────────

struct StopInner {
    epoch: AtomicU64,
    notify: Notify,
}

/// Sink-wide stop request. Raising it stops every item whose token was
/// taken before the raise; items started afterwards are unaffected.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self {
            inner: Arc::new(StopInner {
                epoch: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            inner: self.inner.clone(),
            start: self.inner.epoch.load(Ordering::SeqCst),
        }
    }
}

/// Per-item view of a [`StopSignal`].
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<StopInner>,
    start: u64,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) != self.start
    }

    /// Resolve once a stop has been raised after this token was taken.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

// ── Output ───────────────────────────────────────────────────────

/// One item handed to an output.
pub struct PlaybackRequest {
    /// Short description for logs.
    pub label: String,
    pub source: Box<dyn FrameSource>,
    pub stop: StopToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Interrupted,
}

/// Blocking audio renderer. Called from the blocking pool, one item at a
/// time.
pub trait AudioOutput: Send + Sync {
    fn play(&self, request: PlaybackRequest) -> Result<PlaybackOutcome, AudioError>;

    /// Human-readable output name.
    fn name(&self) -> &str;
}

/// Headless output that consumes samples at a fixed pace.
///
/// With `speed = 1.0` it takes as long as the audio lasts, which keeps
/// the sink's timing realistic without a sound card.
pub struct ClockedOutput {
    block: Duration,
    speed: f64,
}

impl ClockedOutput {
    pub fn new(block: Duration, speed: f64) -> Self {
        Self {
            block: block.max(Duration::from_millis(1)),
            speed: if speed > 0.0 { speed } else { 1.0 },
        }
    }

    pub fn realtime() -> Self {
        Self::new(Duration::from_millis(20), 1.0)
    }

    /// Play `speed` times faster than real time.
    pub fn accelerated(speed: f64) -> Self {
        Self::new(Duration::from_millis(20), speed)
    }
}

impl AudioOutput for ClockedOutput {
    fn play(&self, mut request: PlaybackRequest) -> Result<PlaybackOutcome, AudioError> {
        let format = request.source.format();
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::UnsupportedFormat {
                sample_rate: format.sample_rate,
                channels: format.channels,
            });
        }

        let frames = (format.sample_rate as f64 * self.block.as_secs_f64()).ceil() as usize;
        let mut buf = vec![0.0f32; frames.max(1) * format.channels as usize];
        let pause = self.block.div_f64(self.speed);

        loop {
            if request.stop.is_stopped() {
                return Ok(PlaybackOutcome::Interrupted);
            }
            let fill = request.source.fill(&mut buf);
            std::thread::sleep(pause);
            if let Fill::Done(_) = fill {
                return Ok(PlaybackOutcome::Finished);
            }
        }
    }

    fn name(&self) -> &str {
        "clocked"
    }
}

#[cfg(test)]
pub mod testing {
    //! Output that records what it rendered.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Played {
        pub label: String,
        pub outcome: PlaybackOutcome,
        pub samples: usize,
    }

    pub struct RecordingOutput {
        clock: ClockedOutput,
        played: Mutex<Vec<Played>>,
    }

    impl RecordingOutput {
        pub fn new(speed: f64) -> Self {
            Self {
                clock: ClockedOutput::new(Duration::from_millis(10), speed),
                played: Mutex::new(Vec::new()),
            }
        }

        pub fn played(&self) -> Vec<Played> {
            self.played.lock().unwrap().clone()
        }

        pub fn labels(&self) -> Vec<String> {
            self.played().into_iter().map(|p| p.label).collect()
        }
    }

    /// Counts real samples passing through to the wrapped source.
    struct Counting {
        inner: Box<dyn FrameSource>,
        samples: Arc<AtomicU64>,
    }

    impl FrameSource for Counting {
        fn format(&self) -> PcmFormat {
            self.inner.format()
        }

        fn fill(&mut self, out: &mut [f32]) -> Fill {
            let fill = self.inner.fill(out);
            let (Fill::More(n) | Fill::Done(n)) = fill;
            self.samples.fetch_add(n as u64, Ordering::SeqCst);
            fill
        }
    }

    impl AudioOutput for RecordingOutput {
        fn play(&self, request: PlaybackRequest) -> Result<PlaybackOutcome, AudioError> {
            let label = request.label.clone();
            let samples = Arc::new(AtomicU64::new(0));
            let request = PlaybackRequest {
                label: request.label,
                source: Box::new(Counting {
                    inner: request.source,
                    samples: samples.clone(),
                }),
                stop: request.stop,
            };
            let outcome = self.clock.play(request)?;
            self.played.lock().unwrap().push(Played {
                label,
                outcome,
                samples: samples.load(Ordering::SeqCst) as usize,
            });
            Ok(outcome)
        }

        fn name(&self) -> &str {
            "recording"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(samples: usize, stop: &StopSignal) -> PlaybackRequest {
        PlaybackRequest {
            label: "clip".into(),
            source: Box::new(ClipSource::new(vec![0.1; samples], PcmFormat::mono(1000))),
            stop: stop.token(),
        }
    }

    #[test]
    fn clip_source_zero_pads_last_buffer() {
        let mut src = ClipSource::new(vec![1.0; 5], PcmFormat::mono(8000));
        let mut buf = [9.0f32; 4];
        assert_eq!(src.fill(&mut buf), Fill::More(4));
        assert_eq!(buf, [1.0; 4]);
        assert_eq!(src.fill(&mut buf), Fill::Done(1));
        assert_eq!(buf, [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn clocked_output_finishes() {
        let stop = StopSignal::new();
        let out = ClockedOutput::accelerated(100.0);
        assert_eq!(out.play(request(100, &stop)).unwrap(), PlaybackOutcome::Finished);
    }

    #[test]
    fn raised_stop_interrupts_token_taken_before() {
        let stop = StopSignal::new();
        let req = request(10_000, &stop);
        stop.raise();
        let out = ClockedOutput::accelerated(100.0);
        assert_eq!(out.play(req).unwrap(), PlaybackOutcome::Interrupted);
        // A token taken after the raise plays normally.
        assert_eq!(out.play(request(10, &stop)).unwrap(), PlaybackOutcome::Finished);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let stop = StopSignal::new();
        let req = PlaybackRequest {
            label: "bad".into(),
            source: Box::new(ClipSource::new(vec![0.0; 4], PcmFormat::mono(0))),
            stop: stop.token(),
        };
        assert!(ClockedOutput::realtime().play(req).is_err());
    }

    #[tokio::test]
    async fn stopped_resolves_after_raise() {
        let stop = StopSignal::new();
        let token = stop.token();
        let waiter = tokio::spawn(async move { token.stopped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.raise();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
