//! speakd - a local speech daemon
//!
//! Text arrives over an NDJSON/TCP protocol, either all at once (`speak`)
//! or incrementally through stream sessions. It is cut into speakable
//! units, synthesized in submission order by a pluggable backend, and
//! played one item at a time through an interruptible playback sink.
//!
//! - [`speech`]: segmenter, synthesis queue, stream sessions, playback
//! - [`server`]: TCP listener and wire protocol
//! - [`client`]: client for a running server
//! - [`config`]: TOML configuration

pub mod client;
pub mod config;
pub mod server;
pub mod speech;

pub use config::Config;
