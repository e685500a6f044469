//! Client for the speech server.
//!
//! [`Client`] makes request/response calls, one connection per call.
//! [`ClientStream`] feeds a stream session without ever waiting on the
//! server: pushes go into a local channel and a single sender task
//! writes them, in order, over one connection with replies turned off.
//! Delivery is at most once; send failures are logged, never returned.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::SinkExt;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

/// Connect deadline for fire-and-forget sends.
const SEND_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Interval between `stream_status` polls in [`ClientStream::wait`].
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    timeout: Duration,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and read one response line.
    pub async fn request(&self, body: &Value) -> Result<Value> {
        let exchange = async {
            let stream = TcpStream::connect(&self.addr)
                .await
                .with_context(|| format!("cannot connect to {}", self.addr))?;
            let mut framed = Framed::new(stream, LinesCodec::new());
            framed.send(body.to_string()).await?;
            let line = framed
                .next()
                .await
                .context("connection closed before response")??;
            let response: Value = serde_json::from_str(&line).context("invalid response")?;
            anyhow::Ok(response)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .context("request timed out")?
    }

    /// Run `cmd` with extra `fields` and fail unless the reply is ok.
    pub async fn call(&self, cmd: &str, fields: Value) -> Result<Value> {
        let mut body = json!({ "cmd": cmd });
        if let (Some(body), Value::Object(fields)) = (body.as_object_mut(), fields) {
            body.extend(fields);
        }
        let response = self.request(&body).await?;
        if response.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(response)
        } else {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            anyhow::bail!("{cmd}: {error}")
        }
    }

    /// Write one request without waiting for a reply. Errors are
    /// logged and swallowed.
    pub async fn send_nowait(&self, body: &Value) {
        let mut body = body.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert("reply".into(), Value::Bool(false));
        }
        match tokio::time::timeout(SEND_CONNECT_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                let mut framed = Framed::new(stream, LinesCodec::new());
                if let Err(e) = framed.send(body.to_string()).await {
                    debug!(error = %e, "Fire-and-forget send failed");
                }
            }
            Ok(Err(e)) => debug!(error = %e, "Fire-and-forget connect failed"),
            Err(_) => debug!("Fire-and-forget connect timed out"),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.call("ping", json!({})).await.map(|_| ())
    }

    pub async fn state(&self) -> Result<Value> {
        self.call("get_state", json!({})).await
    }

    /// Queue text for synthesis. Returns the number of accepted units.
    pub async fn speak(&self, text: &str) -> Result<u64> {
        let response = self.call("speak", json!({ "text": text })).await?;
        Ok(response.get("accepted").and_then(Value::as_u64).unwrap_or(0))
    }

    pub async fn set_voice(&self, voice: &str) -> Result<()> {
        self.call("set_voice", json!({ "voice": voice })).await.map(|_| ())
    }

    pub async fn play(&self, path: &str, override_current: bool) -> Result<()> {
        self.call("play", json!({ "path": path, "override": override_current }))
            .await
            .map(|_| ())
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.call("stop_all", json!({})).await.map(|_| ())
    }

    pub async fn stop_and_clear(&self) -> Result<()> {
        self.call("stop_and_clear", json!({})).await.map(|_| ())
    }

    /// True once the server no longer knows the stream.
    pub async fn stream_done(&self, id: &str) -> Result<bool> {
        let response = self.call("stream_status", json!({ "stream_id": id })).await?;
        Ok(response.get("done").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Open a stream session, optionally under a chosen id.
    pub async fn begin_stream(&self, id: Option<&str>) -> Result<ClientStream> {
        let fields = match id {
            Some(id) => json!({ "stream_id": id }),
            None => json!({}),
        };
        let response = self.call("begin_stream", fields).await?;
        let id = response
            .get("stream_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .context("begin_stream: missing stream_id")?
            .to_string();
        Ok(ClientStream::start(self.clone(), id))
    }
}

/// Client side of a stream session.
pub struct ClientStream {
    id: String,
    client: Client,
    tx: Option<mpsc::UnboundedSender<Value>>,
    sender: Option<JoinHandle<()>>,
}

impl ClientStream {
    fn start(client: Client, id: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = tokio::spawn(run_sender(client.clone(), id.clone(), rx));
        Self {
            id,
            client,
            tx: Some(tx),
            sender: Some(sender),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue text for the server. Never waits. Ignored after `finish`.
    pub fn push(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(json!({
                "cmd": "stream_push",
                "stream_id": self.id,
                "text": text,
                "reply": false,
            }));
        }
    }

    /// Flush queued pushes, then send `stream_finish` on the same
    /// connection. Waits at most `flush_timeout` for the sender.
    pub async fn finish(&mut self, flush_timeout: Duration) {
        let Some(tx) = self.tx.take() else { return };
        let _ = tx.send(json!({
            "cmd": "stream_finish",
            "stream_id": self.id,
            "reply": false,
        }));
        drop(tx);
        if let Some(sender) = self.sender.take() {
            if tokio::time::timeout(flush_timeout, sender).await.is_err() {
                warn!(stream = %self.id, "Stream sender did not flush in time");
            }
        }
    }

    /// Abort the session on the server. Pending pushes are dropped.
    pub async fn abort(&mut self) -> Result<()> {
        self.tx.take();
        if let Some(sender) = self.sender.take() {
            sender.abort();
        }
        self.client
            .call("stream_abort", json!({ "stream_id": self.id }))
            .await
            .map(|_| ())
    }

    /// Poll until the server reports the stream done. Returns false on
    /// timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let started = tokio::time::Instant::now();
        loop {
            if self.client.stream_done(&self.id).await? {
                return Ok(true);
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Writes every queued message over one connection, reconnecting with
/// a short deadline when it drops.
async fn run_sender(client: Client, id: String, mut rx: mpsc::UnboundedReceiver<Value>) {
    let mut conn: Option<Framed<TcpStream, LinesCodec>> = None;
    while let Some(message) = rx.recv().await {
        if conn.is_none() {
            match tokio::time::timeout(SEND_CONNECT_TIMEOUT, TcpStream::connect(client.addr())).await
            {
                Ok(Ok(stream)) => conn = Some(Framed::new(stream, LinesCodec::new())),
                Ok(Err(e)) => {
                    debug!(stream = %id, error = %e, "Stream sender connect failed, message dropped");
                    continue;
                }
                Err(_) => {
                    debug!(stream = %id, "Stream sender connect timed out, message dropped");
                    continue;
                }
            }
        }
        if let Some(framed) = conn.as_mut() {
            if let Err(e) = framed.send(message.to_string()).await {
                debug!(stream = %id, error = %e, "Stream send failed, message dropped");
                conn = None;
            }
        }
    }
    // Let the server read everything before the socket closes.
    if let Some(mut framed) = conn {
        if let Err(e) = SinkExt::<String>::flush(&mut framed).await {
            debug!(stream = %id, error = %e, "Stream sender flush failed");
        }
        if let Err(e) = SinkExt::<String>::close(&mut framed).await {
            debug!(stream = %id, error = %e, "Stream sender close failed");
        }
    }
}
