//! Bridge commands executed against the current session

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::VERSION;
use crate::bridge::{BridgeCommandType, BridgeHandler, BridgeRequest, BridgeResponse};
use crate::events::EventType;
use crate::session::{GameSession, port_is_free};
use crate::types::identifiers::AccessKey;
use crate::types::reattach::INTEROP_API_VERSION;
use crate::types::runtime::RuntimeInformation;

use super::core::WatchdogInner;

#[async_trait]
impl BridgeHandler for WatchdogInner {
    async fn handle_bridge_request(
        &self,
        request: BridgeRequest,
        _cancel: &CancellationToken,
    ) -> Option<BridgeResponse> {
        let key = request.access_identifier.clone()?;
        let session = self.session_for(&key).await?;
        log::debug!(
            "Bridge {:?} from worker pid {}",
            request.command_type,
            session.process_id()
        );

        let response = match request.command_type {
            BridgeCommandType::PortUpdate => self.on_port_update(&session, request.port).await,
            BridgeCommandType::Startup => self.on_startup(&session, request.version.as_deref()).await,
            BridgeCommandType::Prime => {
                self.primed.store(true, Ordering::SeqCst);
                BridgeResponse::success()
            }
            BridgeCommandType::Reboot => {
                self.primed.store(false, Ordering::SeqCst);
                // Cleared before the loop wakes so a prompt Startup is kept
                session.reset_started();
                session.signal_reboot();
                BridgeResponse::success()
            }
            BridgeCommandType::Kill => {
                log::info!("Worker pid {} asked to be replaced", session.process_id());
                self.hard_restart.store(true, Ordering::SeqCst);
                session.mark_expected_exit();
                self.restart.notify_one();
                self.events.emit_detached(EventType::WorkerKill, Vec::new());
                BridgeResponse::success()
            }
            BridgeCommandType::ChatSend => match request.chat_message {
                Some(message) => {
                    self.events.relay(message);
                    BridgeResponse::success()
                }
                None => BridgeResponse::error("ChatSend without chatMessage"),
            },
            BridgeCommandType::Chunk => BridgeResponse::error("Chunks must be reassembled before dispatch"),
        };
        Some(response)
    }
}

impl WatchdogInner {
    /// The session owning `key`, waiting briefly in case it is being installed
    async fn session_for(&self, key: &AccessKey) -> Option<Arc<GameSession>> {
        let mut current = self.session.subscribe();
        let lookup = current.wait_for(|session| {
            session
                .as_ref()
                .is_some_and(|session| &session.access_key() == key)
        });
        match tokio::time::timeout(self.config.probe_timeout, lookup).await {
            Ok(Ok(session)) => (*session).clone(),
            _ => {
                log::debug!("Bridge call for session {} that is not current", key.fingerprint());
                None
            }
        }
    }

    async fn on_port_update(&self, session: &GameSession, port: Option<u16>) -> BridgeResponse {
        let Some(requested) = port else {
            return BridgeResponse::error("PortUpdate without port");
        };
        let current = session.parameters().port;
        if requested == current {
            return BridgeResponse::port(current);
        }
        if !port_is_free(requested) {
            log::warn!("Worker asked for port {} which is in use", requested);
            return BridgeResponse {
                new_port: Some(current),
                error_message: Some(format!("Port {requested} is in use")),
                ..BridgeResponse::default()
            };
        }

        if let Err(e) = session.set_port(requested).await {
            log::warn!("Failed to persist port change: {}", e);
        }
        self.parameters.lock().port = requested;
        log::info!("Worker moved from port {} to {}", current, requested);
        self.events.emit_detached(
            EventType::PortChange,
            vec![current.to_string(), requested.to_string()],
        );
        BridgeResponse::port(requested)
    }

    async fn on_startup(&self, session: &GameSession, version: Option<&str>) -> BridgeResponse {
        if let Some(version) = version
            && version.split('.').next() != INTEROP_API_VERSION.split('.').next()
        {
            log::warn!(
                "Worker speaks interop {} but the watchdog speaks {}",
                version,
                INTEROP_API_VERSION
            );
        }

        let latency = session.mark_started();
        log::debug!("Worker pid {} reported startup after {:?}", session.process_id(), latency);
        BridgeResponse::runtime(self.runtime_information(session).await)
    }

    async fn runtime_information(&self, session: &GameSession) -> RuntimeInformation {
        let info = session.reattach_information();
        let artifact = session.artifact();
        let chat_channels = tokio::time::timeout(self.config.event_timeout, self.events.chat().channels())
            .await
            .unwrap_or_else(|_| {
                log::warn!("Chat relay did not list channels in time");
                Vec::new()
            });

        RuntimeInformation {
            instance_name: self.config.instance_name.clone(),
            server_version: VERSION.to_string(),
            api_version: INTEROP_API_VERSION.to_string(),
            artifact_id: info.artifact_id,
            revision: artifact.as_ref().and_then(|a| a.metadata.revision.clone()),
            test_merges: artifact
                .as_ref()
                .map(|a| a.metadata.test_merges.clone())
                .unwrap_or_default(),
            security_level: session.parameters().security_level,
            chat_channels,
            access_identifier: info.interop_access_key,
        }
    }
}
