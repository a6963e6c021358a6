//! Supervisor to worker requests
//!
//! The reverse direction of the bridge: the watchdog connects to the worker's
//! listening port, writes one JSON line and reads one JSON line back.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::{Result, WatchdogError};
use crate::types::identifiers::AccessKey;

const MAX_REPLY_LENGTH: usize = 64 * 1024;

/// Command sent to a running worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "commandType")]
pub enum WorkerCommand {
    /// Liveness probe
    Ping,
    /// Ask the worker to shut down cleanly
    GracefulShutdown,
    /// Show a notice to players
    ChatNotice {
        /// Notice text
        text: String,
    },
    /// Move to another port
    SetPort {
        /// New port
        port: u16,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerEnvelope<'a> {
    access_identifier: &'a AccessKey,
    #[serde(flatten)]
    command: &'a WorkerCommand,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerReply {
    #[serde(default)]
    error_message: Option<String>,
}

/// Sends [`WorkerCommand`]s to a worker
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Send one command and wait for the worker's acknowledgement
    async fn send(&self, port: u16, key: &AccessKey, command: WorkerCommand, timeout: Duration) -> Result<()>;

    /// Probe whether the worker answers on `port` with `key`
    async fn ping(&self, port: u16, key: &AccessKey, timeout: Duration) -> Result<()> {
        self.send(port, key, WorkerCommand::Ping, timeout).await
    }

    /// Ask the worker to shut down
    async fn graceful_shutdown(&self, port: u16, key: &AccessKey, timeout: Duration) -> Result<()> {
        self.send(port, key, WorkerCommand::GracefulShutdown, timeout).await
    }

    /// Show `text` to players
    async fn chat_notice(&self, port: u16, key: &AccessKey, text: String, timeout: Duration) -> Result<()> {
        self.send(port, key, WorkerCommand::ChatNotice { text }, timeout).await
    }

    /// Move the worker to `new_port`
    async fn set_port(&self, port: u16, key: &AccessKey, new_port: u16, timeout: Duration) -> Result<()> {
        self.send(port, key, WorkerCommand::SetPort { port: new_port }, timeout)
            .await
    }
}

/// [`WorkerClient`] over loopback TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpWorkerClient;

impl TcpWorkerClient {
    async fn exchange(port: u16, line: String) -> Result<WorkerReply> {
        let stream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REPLY_LENGTH));

        framed
            .send(line)
            .await
            .map_err(|e| WatchdogError::bridge(format!("Failed to write to worker: {e}")))?;

        match framed.next().await {
            Some(Ok(reply)) => Ok(serde_json::from_str(&reply)?),
            Some(Err(e)) => Err(WatchdogError::bridge(format!("Failed to read worker reply: {e}"))),
            None => Err(WatchdogError::bridge("Worker closed the connection without replying")),
        }
    }
}

#[async_trait]
impl WorkerClient for TcpWorkerClient {
    async fn send(&self, port: u16, key: &AccessKey, command: WorkerCommand, timeout: Duration) -> Result<()> {
        let line = serde_json::to_string(&WorkerEnvelope {
            access_identifier: key,
            command: &command,
        })?;

        let reply = tokio::time::timeout(timeout, Self::exchange(port, line))
            .await
            .map_err(|_| {
                WatchdogError::timeout(format!("Worker on port {port} did not answer within {timeout:?}"))
            })??;

        match reply.error_message {
            Some(message) => Err(WatchdogError::bridge(format!("Worker rejected command: {message}"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_commands_are_tagged() {
        let json = serde_json::to_value(WorkerEnvelope {
            access_identifier: &AccessKey::new("k"),
            command: &WorkerCommand::SetPort { port: 4000 },
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"accessIdentifier": "k", "commandType": "SetPort", "port": 4000})
        );
    }

    #[tokio::test]
    async fn test_ping_round_trips_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let worker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            write.write_all(b"{}\n").await.unwrap();
            line
        });

        TcpWorkerClient
            .ping(port, &AccessKey::new("k"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(worker.await.unwrap().contains("\"Ping\""));
    }

    #[tokio::test]
    async fn test_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(
            TcpWorkerClient
                .ping(port, &AccessKey::new("k"), Duration::from_millis(500))
                .await
                .is_err()
        );
    }
}
