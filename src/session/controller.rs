//! Starting and reattaching worker processes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactLease;
use crate::bridge::{BridgeDispatcher, BridgeHandler};
use crate::config::WatchdogConfig;
use crate::error::{Result, WatchdogError};
use crate::reattach::ReattachStore;
use crate::types::identifiers::AccessKey;
use crate::types::launch::LaunchParameters;
use crate::types::reattach::{INTEROP_API_VERSION, ReattachInformation};

use super::command::{CommandBuilder, find_engine};
use super::game_session::GameSession;
use super::process::{OsProcess, pid_is_alive};
use super::worker_client::WorkerClient;

/// How often a reattached process, which is not our child, is probed
pub const REATTACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Owns worker OS processes
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Start a session running `lease`'s artifact.
    ///
    /// When `reattach` describes a live, compatible worker running one of the
    /// leased artifacts, supervision resumes on it without spawning. Bridge
    /// calls carrying the session's access key are routed to `handler`.
    async fn launch_new(
        &self,
        lease: ArtifactLease,
        reattach: Option<ReattachInformation>,
        parameters: LaunchParameters,
        handler: Weak<dyn BridgeHandler>,
        cancel: &CancellationToken,
    ) -> Result<GameSession>;
}

/// [`SessionController`] backed by real engine processes
pub struct ProcessSessionController {
    config: Arc<WatchdogConfig>,
    dispatcher: BridgeDispatcher,
    client: Arc<dyn WorkerClient>,
    store: Arc<dyn ReattachStore>,
    spawned: AtomicU64,
}

impl ProcessSessionController {
    /// Create a controller
    pub fn new(
        config: Arc<WatchdogConfig>,
        dispatcher: BridgeDispatcher,
        client: Arc<dyn WorkerClient>,
        store: Arc<dyn ReattachStore>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            client,
            store,
            spawned: AtomicU64::new(0),
        }
    }

    /// Number of processes this controller spawned
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    async fn try_reattach(
        &self,
        lease: &mut Option<ArtifactLease>,
        info: &ReattachInformation,
        parameters: &LaunchParameters,
        handler: &Weak<dyn BridgeHandler>,
    ) -> Option<GameSession> {
        let pid = info.process_id;
        if !info.api_compatible() {
            log::info!(
                "Not reattaching to pid {}: interop version {} is incompatible with {}",
                pid,
                info.interop_api_version,
                INTEROP_API_VERSION
            );
            return None;
        }
        if !pid_is_alive(pid) {
            log::info!("Not reattaching to pid {}: process is gone", pid);
            return None;
        }
        if lease.as_ref()?.find(&info.artifact_id).is_none() {
            log::info!(
                "Not reattaching to pid {}: artifact {} is no longer deployed",
                pid,
                info.artifact_id
            );
            return None;
        }
        if let Err(e) = self
            .client
            .ping(info.listening_port, &info.interop_access_key, self.config.probe_timeout)
            .await
        {
            log::info!("Not reattaching to pid {}: liveness probe failed: {}", pid, e);
            return None;
        }

        let mut lease = lease.take()?;
        lease.narrow_to(&info.artifact_id);
        let registration = self
            .dispatcher
            .register(info.interop_access_key.clone(), handler.clone());
        let (session, exit) = GameSession::new(
            info.clone(),
            parameters.with_port(info.listening_port),
            lease,
            Arc::clone(&self.store),
            Arc::new(OsProcess::new(pid)),
            true,
        );

        // Not our child, so poll instead of waiting
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REATTACH_POLL_INTERVAL).await;
                if exit.is_closed() {
                    break;
                }
                if !pid_is_alive(pid) {
                    exit.exited(None);
                    break;
                }
            }
        });

        log::info!("Reattached to worker pid {} on port {}", pid, info.listening_port);
        Some(session.with_registration(registration))
    }

    async fn spawn(
        &self,
        lease: ArtifactLease,
        parameters: LaunchParameters,
        handler: Weak<dyn BridgeHandler>,
    ) -> Result<GameSession> {
        let engine = find_engine(&self.config.engine_executable)?;
        let artifact = Arc::clone(lease.primary());
        let key = AccessKey::generate();

        // Route before spawning so the worker's first call finds us
        let registration = self.dispatcher.register(key.clone(), handler);

        let mut child = CommandBuilder::new(&engine, &artifact, &parameters, &self.config, &key)
            .build()
            .spawn()
            .map_err(|e| {
                WatchdogError::launch(format!("Failed to start {}: {e}", engine.display()))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| WatchdogError::launch("Engine exited before reporting a pid"))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        if let Some(stdout) = child.stdout.take() {
            forward_output(pid, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(pid, "stderr", stderr);
        }

        let info = ReattachInformation {
            process_id: pid,
            listening_port: parameters.port,
            interop_access_key: key,
            interop_api_version: INTEROP_API_VERSION.to_string(),
            artifact_id: artifact.id.clone(),
        };
        let (session, exit) = GameSession::new(
            info,
            parameters,
            lease,
            Arc::clone(&self.store),
            Arc::new(OsProcess::new(pid)),
            false,
        );

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    log::debug!("Worker pid {} exited: {}", pid, status);
                    exit.exited(status.code());
                }
                Err(e) => {
                    log::error!("Failed to wait on worker pid {}: {}", pid, e);
                    exit.exited(None);
                }
            }
        });

        log::info!(
            "Launched worker pid {} running artifact {} on port {}",
            pid,
            artifact.id,
            session.parameters().port
        );
        if let Err(e) = session.persist().await {
            log::warn!("Failed to persist reattach information: {}", e);
        }
        Ok(session.with_registration(registration))
    }
}

#[async_trait]
impl SessionController for ProcessSessionController {
    async fn launch_new(
        &self,
        lease: ArtifactLease,
        reattach: Option<ReattachInformation>,
        parameters: LaunchParameters,
        handler: Weak<dyn BridgeHandler>,
        cancel: &CancellationToken,
    ) -> Result<GameSession> {
        let mut lease = Some(lease);
        if let Some(info) = reattach {
            if let Some(session) = self.try_reattach(&mut lease, &info, &parameters, &handler).await {
                if let Err(e) = session.persist().await {
                    log::warn!("Failed to persist reattach information: {}", e);
                }
                return Ok(session);
            }
            if let Err(e) = self.store.clear().await {
                log::warn!("Failed to clear stale reattach information: {}", e);
            }
        }

        if cancel.is_cancelled() {
            return Err(WatchdogError::Cancelled);
        }
        let lease = lease.ok_or_else(|| WatchdogError::artifact("artifact lease was consumed"))?;
        self.spawn(lease, parameters, handler).await
    }
}

fn forward_output<R>(pid: u32, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::debug!(target: "worker", "[{} {}] {}", pid, stream, line);
        }
    });
}
