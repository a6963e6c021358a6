//! Event and chat collaborators
//!
//! The watchdog reports lifecycle events to an [`EventConsumer`] and relays
//! worker chat traffic through a [`ChatRelay`]. Both are fire-and-forget from
//! the supervision loop's point of view: [`EventSink`] bounds every delivery
//! with a timeout and only logs failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::runtime::{ChatChannel, ChatMessage};

/// Lifecycle events reported by the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A new worker process was started
    WorkerLaunch,
    /// Supervision resumed on a process that survived a supervisor restart
    WorkerReattach,
    /// The worker reported startup
    WorkerStartup,
    /// The worker exited without being asked to
    WorkerCrash,
    /// The worker re-initialised inside the same process
    WorkerReboot,
    /// The worker process is being replaced
    WorkerHardReboot,
    /// The worker asked to be killed
    WorkerKill,
    /// The worker moved to another port
    PortChange,
    /// The watchdog gave up after exhausting retries
    WatchdogFatal,
    /// The watchdog stopped the worker on request
    WatchdogShutdown,
}

/// Receives lifecycle events
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Handle one event; `parameters` are event-specific strings
    async fn handle_event(&self, event_type: EventType, parameters: Vec<String>) -> Result<()>;
}

/// Relays chat traffic between the worker and chat networks
#[async_trait]
pub trait ChatRelay: Send + Sync {
    /// Send a worker message to the given channels (all channels when empty)
    async fn send_message(&self, message: ChatMessage) -> Result<()>;

    /// Channels the worker may address
    async fn channels(&self) -> Vec<ChatChannel>;
}

/// Event consumer and chat relay that drop everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollaborator;

#[async_trait]
impl EventConsumer for NullCollaborator {
    async fn handle_event(&self, event_type: EventType, parameters: Vec<String>) -> Result<()> {
        log::trace!("Event {:?} {:?} dropped", event_type, parameters);
        Ok(())
    }
}

#[async_trait]
impl ChatRelay for NullCollaborator {
    async fn send_message(&self, message: ChatMessage) -> Result<()> {
        log::trace!("Chat message to {:?} dropped", message.channel_ids);
        Ok(())
    }

    async fn channels(&self) -> Vec<ChatChannel> {
        Vec::new()
    }
}

/// Delivers events and chat notices without letting failures escape
#[derive(Clone)]
pub struct EventSink {
    consumer: Arc<dyn EventConsumer>,
    chat: Arc<dyn ChatRelay>,
    timeout: Duration,
}

impl EventSink {
    /// Create a sink over the two collaborators
    pub fn new(consumer: Arc<dyn EventConsumer>, chat: Arc<dyn ChatRelay>, timeout: Duration) -> Self {
        Self {
            consumer,
            chat,
            timeout,
        }
    }

    /// Chat relay behind this sink
    #[must_use]
    pub fn chat(&self) -> &Arc<dyn ChatRelay> {
        &self.chat
    }

    /// Report an event; errors and timeouts are logged
    pub async fn emit(&self, event_type: EventType, parameters: Vec<String>) {
        match tokio::time::timeout(self.timeout, self.consumer.handle_event(event_type, parameters))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Event consumer failed on {:?}: {}", event_type, e),
            Err(_) => log::warn!(
                "Event consumer did not handle {:?} within {:?}",
                event_type,
                self.timeout
            ),
        }
    }

    /// Report an event from a background task
    pub fn emit_detached(&self, event_type: EventType, parameters: Vec<String>) {
        let sink = self.clone();
        tokio::spawn(async move { sink.emit(event_type, parameters).await });
    }

    /// Post a notice to every chat channel; errors are logged
    pub async fn notify_chat(&self, text: impl Into<String>) {
        let message = ChatMessage {
            text: text.into(),
            channel_ids: Vec::new(),
        };
        match tokio::time::timeout(self.timeout, self.chat.send_message(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Chat relay failed: {}", e),
            Err(_) => log::warn!("Chat relay timed out after {:?}", self.timeout),
        }
    }

    /// Relay a worker chat message on a background task
    pub fn relay(&self, message: ChatMessage) {
        let chat = Arc::clone(&self.chat);
        tokio::spawn(async move {
            if let Err(e) = chat.send_message(message).await {
                log::warn!("Failed to relay worker chat message: {}", e);
            }
        });
    }
}
