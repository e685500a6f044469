//! Error types for the speech pipeline.

use thiserror::Error;

/// Errors surfaced by the synthesis queue, sessions, and the playback sink.
#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("busy")]
    QueueFull,

    #[error("shutting down")]
    ShutDown,

    #[error("unknown stream id: {0}")]
    UnknownStream(String),

    #[error("stream id already exists: {0}")]
    DuplicateStream(String),

    #[error("invalid voice: {0}")]
    InvalidVoice(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors raised by an audio output while rendering one item.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no output device available")]
    NoDevice,

    #[error("output device error: {0}")]
    Device(String),

    #[error("unsupported format: {sample_rate} Hz, {channels} channel(s)")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },

    #[error("playback task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_visible_messages() {
        assert_eq!(SpeechError::QueueFull.to_string(), "busy");
        assert_eq!(
            SpeechError::UnknownStream("abc".into()).to_string(),
            "unknown stream id: abc"
        );
        assert_eq!(
            AudioError::UnsupportedFormat {
                sample_rate: 22050,
                channels: 1
            }
            .to_string(),
            "unsupported format: 22050 Hz, 1 channel(s)"
        );
    }

    #[test]
    fn backend_error_is_transparent() {
        let err: SpeechError = anyhow::anyhow!("connection refused").into();
        assert_eq!(err.to_string(), "connection refused");
    }
}
