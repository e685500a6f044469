//! NDJSON-over-TCP server.
//!
//! One task per connection. Requests on a connection are handled in
//! order, so a client that pushes stream text over one socket keeps its
//! order end to end.

pub mod dispatch;
pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::speech::SpeechService;
use protocol::{ProtocolError, Response};

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Close a connection that sends nothing for this long.
    pub idle_timeout: Duration,
    /// Longest accepted request line, in bytes.
    pub max_line_bytes: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            idle_timeout: config.idle_timeout()?,
            max_line_bytes: config.max_line_bytes,
        })
    }
}

pub struct Server {
    listener: TcpListener,
    service: Arc<SpeechService>,
    options: ConnectionOptions,
}

impl Server {
    pub async fn bind(
        addr: &str,
        service: Arc<SpeechService>,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            listener,
            service,
            options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled. Open
    /// connections are told to close and are not awaited.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "Listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = self.service.clone();
                        let options = self.options;
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, service, options, shutdown).await {
                                debug!(%peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
        info!("Listener stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<SpeechService>,
    options: ConnectionOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    debug!(%peer, "Connection opened");
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(
        stream,
        LinesCodec::new_with_max_length(options.max_line_bytes),
    );

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(options.idle_timeout, framed.next()) => next,
        };
        let line = match next {
            Err(_) => {
                debug!(%peer, "Connection idle, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let response: Response = ProtocolError::LineTooLong.into();
                framed.send(response.to_line()).await?;
                // A decode error leaves `Framed` terminated; rebuild it
                // around the same codec so the rest of the line is skipped
                // and reading resumes.
                framed = Framed::from_parts(framed.into_parts());
                continue;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => return Err(e.into()),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (response, reply) = dispatch::handle_line(&service, line).await;
        if !response.ok {
            debug!(%peer, error = response.error.as_deref().unwrap_or_default(), "Request failed");
        }
        if reply {
            framed.send(response.to_line()).await?;
        }
    }

    debug!(%peer, "Connection closed");
    Ok(())
}
