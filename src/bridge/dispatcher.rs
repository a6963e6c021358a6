//! Routing of bridge requests to the session that owns the caller's key
//!
//! The dispatcher is an explicit registrar owned by the hosting process. Each
//! session registers its access key with a weak handler reference and keeps the
//! returned [`BridgeRegistration`]; dropping it removes the route, so calls
//! carrying a stale key become undispatchable instead of reaching a newer
//! session.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::chunking::{ChunkOutcome, ChunkReassembler};
use super::messages::{BridgeCommandType, BridgeRequest, BridgeResponse};
use crate::types::identifiers::AccessKey;

/// Executes logical (non-chunk) bridge requests
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    /// Handle one request; chunking has already been resolved.
    ///
    /// Returning `None` declines the request as undispatchable.
    async fn handle_bridge_request(
        &self,
        request: BridgeRequest,
        cancel: &CancellationToken,
    ) -> Option<BridgeResponse>;
}

struct Route {
    handler: Weak<dyn BridgeHandler>,
    chunks: Arc<ChunkReassembler>,
}

type RouteTable = Arc<RwLock<HashMap<AccessKey, Route>>>;

/// Access-key to handler lookup table
#[derive(Clone, Default)]
pub struct BridgeDispatcher {
    routes: RouteTable,
}

/// Keeps a route registered; dropping it unregisters the key
#[must_use = "dropping the registration unregisters the handler"]
pub struct BridgeRegistration {
    key: AccessKey,
    routes: RouteTable,
}

impl BridgeRegistration {
    /// Key this registration routes
    #[must_use]
    pub fn key(&self) -> &AccessKey {
        &self.key
    }
}

impl Drop for BridgeRegistration {
    fn drop(&mut self) {
        if self.routes.write().remove(&self.key).is_some() {
            log::debug!("Bridge route {} removed", self.key.fingerprint());
        }
    }
}

impl std::fmt::Debug for BridgeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistration")
            .field("key", &self.key.fingerprint())
            .finish()
    }
}

impl BridgeDispatcher {
    /// Create an empty dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests carrying `key` to `handler`
    ///
    /// Registering a key twice replaces the earlier route and its pending
    /// chunks.
    pub fn register(&self, key: AccessKey, handler: Weak<dyn BridgeHandler>) -> BridgeRegistration {
        let previous = self.routes.write().insert(
            key.clone(),
            Route {
                handler,
                chunks: Arc::new(ChunkReassembler::new()),
            },
        );
        if previous.is_some() {
            log::warn!("Bridge route {} re-registered", key.fingerprint());
        } else {
            log::debug!("Bridge route {} registered", key.fingerprint());
        }
        BridgeRegistration {
            key,
            routes: Arc::clone(&self.routes),
        }
    }

    /// Whether `key` currently has a live route
    #[must_use]
    pub fn is_registered(&self, key: &AccessKey) -> bool {
        self.routes
            .read()
            .get(key)
            .is_some_and(|route| route.handler.strong_count() > 0)
    }

    /// Number of registered routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether no routes are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    fn resolve(&self, key: &AccessKey) -> Option<(Arc<dyn BridgeHandler>, Arc<ChunkReassembler>)> {
        let routes = self.routes.read();
        let route = routes.get(key)?;
        let handler = route.handler.upgrade()?;
        Some((handler, Arc::clone(&route.chunks)))
    }

    /// Parse one raw request and dispatch it
    ///
    /// Malformed JSON gets an error response. Requests that cannot be routed
    /// return `None`.
    pub async fn process_raw(&self, json: &str, cancel: &CancellationToken) -> Option<BridgeResponse> {
        match BridgeRequest::parse(json) {
            Ok(request) => self.process_bridge_request(request, cancel).await,
            Err(e) => {
                log::debug!("Malformed bridge request: {}", e);
                Some(BridgeResponse::error(format!("Malformed bridge request: {e}")))
            }
        }
    }

    /// Dispatch one request to the handler owning its access key
    ///
    /// Returns `None` when the key is missing, unknown, or its handler is
    /// gone; the caller must not answer in that case.
    pub async fn process_bridge_request(
        &self,
        request: BridgeRequest,
        cancel: &CancellationToken,
    ) -> Option<BridgeResponse> {
        if cancel.is_cancelled() {
            log::debug!("Bridge request {:?} dropped during shutdown", request.command_type);
            return None;
        }

        let Some(key) = request.access_identifier.clone() else {
            log::debug!("Bridge request {:?} without access identifier", request.command_type);
            return None;
        };
        let Some((handler, chunks)) = self.resolve(&key) else {
            log::debug!("Bridge request {:?} for unknown key rejected", request.command_type);
            return None;
        };

        if request.command_type != BridgeCommandType::Chunk {
            return handler.handle_bridge_request(request, cancel).await;
        }

        let Some(chunk) = request.chunk else {
            return Some(BridgeResponse::error("Chunk request without chunk data"));
        };

        match chunks.process_chunk(&chunk) {
            ChunkOutcome::Incomplete(missing) => {
                log::trace!(
                    "Payload {} waiting on {} chunk(s)",
                    chunk.payload_id,
                    missing.len()
                );
                Some(BridgeResponse::missing(missing))
            }
            ChunkOutcome::Rejected(reason) => {
                log::warn!("Chunked bridge request rejected: {}", reason);
                Some(BridgeResponse::error(reason))
            }
            ChunkOutcome::Complete(json) => {
                let mut logical = match BridgeRequest::parse(&json) {
                    Ok(logical) => logical,
                    Err(e) => {
                        log::warn!("Reassembled payload {} is not a request: {}", chunk.payload_id, e);
                        return Some(BridgeResponse::error(format!(
                            "Reassembled payload {} is malformed: {e}",
                            chunk.payload_id
                        )));
                    }
                };
                if logical.command_type == BridgeCommandType::Chunk {
                    return Some(BridgeResponse::error("Chunk requests cannot be nested"));
                }
                if logical.access_identifier.is_none() {
                    logical.access_identifier = Some(key);
                }
                Box::pin(self.process_bridge_request(logical, cancel)).await
            }
        }
    }
}

impl std::fmt::Debug for BridgeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeDispatcher")
            .field("routes", &self.len())
            .finish()
    }
}
