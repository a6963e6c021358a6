//! TCP transport for bridge requests
//!
//! Workers connect to `127.0.0.1:<bridge port>` and write one JSON request per
//! line. Each routable request gets one JSON response line; lines longer than
//! the payload ceiling are answered with an error so the worker can chunk.

use std::net::{Ipv4Addr, SocketAddr};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::dispatcher::BridgeDispatcher;
use super::messages::BridgeResponse;
use crate::error::{Result, WatchdogError};

/// Accepts worker connections and feeds them to a [`BridgeDispatcher`]
#[derive(Debug, Clone)]
pub struct BridgeServer {
    dispatcher: BridgeDispatcher,
    max_payload: usize,
}

impl BridgeServer {
    /// Create a server with the given per-line payload ceiling
    pub fn new(dispatcher: BridgeDispatcher, max_payload: usize) -> Self {
        Self {
            dispatcher,
            max_payload,
        }
    }

    /// Bind the loopback listener; port 0 picks a free port
    ///
    /// # Errors
    /// Returns error if the port cannot be bound
    pub async fn bind(port: u16) -> Result<TcpListener> {
        TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .map_err(|e| WatchdogError::bridge(format!("Failed to bind bridge port {port}: {e}")))
    }

    /// Accept connections until `cancel` fires
    ///
    /// # Errors
    /// Returns error if accepting fails
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Bridge listening on {}", addr);
        }

        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            log::trace!("Bridge connection from {}", peer);

            let dispatcher = self.dispatcher.clone();
            let cancel = cancel.child_token();
            let max_payload = self.max_payload;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(dispatcher, stream, max_payload, cancel).await {
                    log::debug!("Bridge connection {} closed: {}", peer, e);
                }
            });
        }

        log::info!("Bridge server stopped");
        Ok(())
    }
}

async fn handle_connection(
    dispatcher: BridgeDispatcher,
    stream: TcpStream,
    max_payload: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(max_payload));
    let mut after_error = false;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = framed.next() => next,
        };

        let response = match next {
            // Framed yields one `None` after a decode error; the socket is still open
            None if after_error => {
                after_error = false;
                continue;
            }
            None => return Ok(()),
            Some(Ok(line)) => {
                after_error = false;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match dispatcher.process_raw(line, &cancel).await {
                    Some(response) => response,
                    // Unroutable: close without revealing why
                    None => return Ok(()),
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                after_error = true;
                log::debug!("Bridge request over {} bytes rejected", max_payload);
                BridgeResponse::error(format!(
                    "Request exceeds {max_payload} bytes; send it as chunks"
                ))
            }
            Some(Err(LinesCodecError::Io(e))) => return Err(WatchdogError::Io(e)),
        };

        let json = serde_json::to_string(&response)?;
        framed
            .send(json)
            .await
            .map_err(|e| WatchdogError::bridge(format!("Failed to write bridge response: {e}")))?;
    }
}
