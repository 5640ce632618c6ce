//! Line-delimited JSON server.
//!
//! Each line a client sends is one JSON request (`method`, `path`,
//! `headers`, `body`). Each line written back is one JSON response
//! (`status`, `body`). The peer address of the connection is attached to
//! every request before it enters the pipeline. Lines longer than
//! [`MAX_LINE_LENGTH`] are answered with a 400 and skipped.

use std::future::Future;
use std::net::SocketAddr;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::error::{Result, TurnstileError, STATUS_BAD_REQUEST};
use crate::pipeline::{error_response, BoxHandler, Request, Response};

/// Longest request line accepted, in bytes, not counting the newline.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A TCP server feeding requests into a pipeline.
pub struct Server {
    listener: TcpListener,
    handler: BoxHandler,
}

impl Server {
    /// Bind to `addr`. Use port 0 to pick any free port.
    pub async fn bind(addr: SocketAddr, handler: BoxHandler) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to bind server");
            TurnstileError::Io(e)
        })?;
        Ok(Self { listener, handler })
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `signal` resolves.
    ///
    /// Connections already accepted keep running to completion.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(addr = %self.local_addr()?, "Serving line-delimited JSON requests");

        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Server stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    debug!(peer = %peer, "Connection accepted");
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, handler).await {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, handler: BoxHandler) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = lines.next().await {
        let response = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => dispatch(&handler, &line, peer).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(peer = %peer, max_length = MAX_LINE_LENGTH, "Request line too long");
                error_response(&TurnstileError::status_error(
                    STATUS_BAD_REQUEST,
                    "request line too long",
                ))
            }
            Err(LinesCodecError::Io(e)) => return Err(TurnstileError::Io(e)),
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }

    Ok(())
}

async fn dispatch(handler: &BoxHandler, line: &str, peer: SocketAddr) -> Response {
    let result = match serde_json::from_str::<Request>(line) {
        Ok(request) => handler.call(request.with_peer_addr(peer)).await,
        Err(e) => Err(TurnstileError::from(e)),
    };

    result.unwrap_or_else(|e| error_response(&e))
}
