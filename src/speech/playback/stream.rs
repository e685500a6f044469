//! Live PCM streams.
//!
//! A push-based backend feeds chunks through a [`LiveStreamWriter`]
//! while the sink worker plays them with a small prebuffer. When the
//! writer falls behind the output plays silence instead of stalling;
//! chunks are never reordered or dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::PlayItem;
use super::output::{Fill, FrameSource};
use crate::speech::audio::PcmFormat;

/// One message on a live channel.
#[derive(Debug)]
pub enum PcmEvent {
    /// Interleaved f32 samples in the channel's format.
    Chunk(Vec<f32>),
    /// No more chunks will follow.
    End,
}

/// Producer half of a live channel.
pub struct LiveStreamWriter {
    tx: mpsc::Sender<PcmEvent>,
    aborted: Arc<AtomicBool>,
    format: PcmFormat,
    session_id: String,
    generation: u64,
}

impl LiveStreamWriter {
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Sink-wide number of this channel. A reopened session id gets a
    /// new one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The queue item that plays this channel.
    pub fn play_item(&self) -> PlayItem {
        PlayItem::Stream {
            session_id: self.session_id.clone(),
            generation: self.generation,
        }
    }

    /// Send a chunk, waiting while the channel is full. Returns `false`
    /// once the sink has forgotten this stream.
    pub async fn send(&self, samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return !self.is_closed();
        }
        self.tx.send(PcmEvent::Chunk(samples)).await.is_ok()
    }

    /// Mark end-of-stream.
    pub async fn finish(self) {
        let _ = self.tx.send(PcmEvent::End).await;
    }

    /// Stop playback of this stream at the next buffer boundary.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, parked in the sink until the worker reaches the item.
pub(crate) struct LiveChannel {
    pub format: PcmFormat,
    pub rx: Option<mpsc::Receiver<PcmEvent>>,
    pub aborted: Arc<AtomicBool>,
    pub generation: u64,
}

pub(crate) fn live_channel(
    session_id: &str,
    generation: u64,
    format: PcmFormat,
    capacity: usize,
) -> (LiveStreamWriter, LiveChannel) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let aborted = Arc::new(AtomicBool::new(false));
    (
        LiveStreamWriter {
            tx,
            aborted: aborted.clone(),
            format,
            session_id: session_id.to_string(),
            generation,
        },
        LiveChannel {
            format,
            rx: Some(rx),
            aborted,
            generation,
        },
    )
}

/// Frame source that drains a live channel from the output callback.
pub(crate) struct StreamSource {
    format: PcmFormat,
    pending: VecDeque<Vec<f32>>,
    current: Vec<f32>,
    pos: usize,
    rx: mpsc::Receiver<PcmEvent>,
    ended: bool,
    aborted: Arc<AtomicBool>,
    underruns: Arc<AtomicUsize>,
}

impl StreamSource {
    pub fn new(
        format: PcmFormat,
        prebuffered: VecDeque<Vec<f32>>,
        ended: bool,
        rx: mpsc::Receiver<PcmEvent>,
        aborted: Arc<AtomicBool>,
        underruns: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            format,
            pending: prebuffered,
            current: Vec::new(),
            pos: 0,
            rx,
            ended,
            aborted,
            underruns,
        }
    }

    /// Make `current` hold unread samples. Returns false if none are
    /// available right now.
    fn advance(&mut self) -> bool {
        while self.pos >= self.current.len() {
            if let Some(chunk) = self.pending.pop_front() {
                self.current = chunk;
                self.pos = 0;
                continue;
            }
            if self.ended {
                return false;
            }
            match self.rx.try_recv() {
                Ok(PcmEvent::Chunk(chunk)) => self.pending.push_back(chunk),
                Ok(PcmEvent::End) | Err(TryRecvError::Disconnected) => self.ended = true,
                Err(TryRecvError::Empty) => return false,
            }
        }
        true
    }
}

impl FrameSource for StreamSource {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn fill(&mut self, out: &mut [f32]) -> Fill {
        if self.aborted.load(Ordering::SeqCst) {
            out.fill(0.0);
            return Fill::Done(0);
        }

        let mut written = 0;
        while written < out.len() && self.advance() {
            let n = (self.current.len() - self.pos).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.current[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        out[written..].fill(0.0);

        if written < out.len() {
            if self.ended {
                return Fill::Done(written);
            }
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        Fill::More(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(
        prebuffered: Vec<Vec<f32>>,
        ended: bool,
    ) -> (StreamSource, mpsc::Sender<PcmEvent>, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::channel(8);
        let aborted = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicUsize::new(0));
        let src = StreamSource::new(
            PcmFormat::mono(8000),
            prebuffered.into_iter().collect(),
            ended,
            rx,
            aborted.clone(),
            underruns.clone(),
        );
        (src, tx, aborted, underruns)
    }

    #[test]
    fn plays_chunks_in_order_across_buffers() {
        let (mut src, tx, _, _) = source(vec![vec![1.0, 2.0, 3.0]], false);
        tx.try_send(PcmEvent::Chunk(vec![4.0, 5.0])).unwrap();
        tx.try_send(PcmEvent::End).unwrap();

        let mut buf = [0.0f32; 4];
        assert_eq!(src.fill(&mut buf), Fill::More(4));
        assert_eq!(buf, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(src.fill(&mut buf), Fill::Done(1));
        assert_eq!(buf, [5.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn underrun_emits_silence_and_keeps_going() {
        let (mut src, tx, _, underruns) = source(vec![vec![1.0]], false);
        let mut buf = [7.0f32; 3];
        assert_eq!(src.fill(&mut buf), Fill::More(1));
        assert_eq!(buf, [1.0, 0.0, 0.0]);
        assert_eq!(underruns.load(Ordering::SeqCst), 1);

        tx.try_send(PcmEvent::Chunk(vec![2.0, 3.0, 4.0])).unwrap();
        assert_eq!(src.fill(&mut buf), Fill::More(3));
        assert_eq!(buf, [2.0, 3.0, 4.0]);
    }

    #[test]
    fn dropped_writer_ends_stream() {
        let (mut src, tx, _, _) = source(vec![], false);
        drop(tx);
        let mut buf = [0.0f32; 2];
        assert_eq!(src.fill(&mut buf), Fill::Done(0));
    }

    #[test]
    fn abort_flag_ends_at_next_fill() {
        let (mut src, _tx, aborted, _) = source(vec![vec![1.0; 100]], false);
        let mut buf = [0.0f32; 10];
        assert_eq!(src.fill(&mut buf), Fill::More(10));
        aborted.store(true, Ordering::SeqCst);
        assert_eq!(src.fill(&mut buf), Fill::Done(0));
        assert_eq!(buf, [0.0; 10]);
    }

    #[tokio::test]
    async fn writer_reports_forgotten_stream() {
        let (writer, channel) = live_channel("w", 1, PcmFormat::mono(16000), 2);
        assert!(writer.send(vec![0.5]).await);
        drop(channel);
        assert!(!writer.send(vec![0.5]).await);
        assert!(writer.is_closed());
    }

    #[test]
    fn play_item_names_the_channel_instance() {
        let (writer, channel) = live_channel("w", 7, PcmFormat::mono(16000), 2);
        assert_eq!(channel.generation, 7);
        assert_eq!(
            writer.play_item(),
            PlayItem::Stream {
                session_id: "w".into(),
                generation: 7
            }
        );
    }
}
