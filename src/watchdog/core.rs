//! Watchdog state and administrative operations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactSlotManager;
use crate::bridge::BridgeHandler;
use crate::config::WatchdogConfig;
use crate::error::{Result, WatchdogError};
use crate::events::{ChatRelay, EventConsumer, EventSink};
use crate::jobs::JobManager;
use crate::reattach::ReattachStore;
use crate::session::{GameSession, SessionController, WorkerClient};
use crate::types::launch::LaunchParameters;
use crate::types::status::WatchdogStatus;

use super::policy::CrashTracker;

/// Collaborators a [`Watchdog`] works with
#[derive(Clone)]
pub struct WatchdogServices {
    /// Starts and reattaches worker processes
    pub controller: Arc<dyn SessionController>,
    /// Sends requests to the running worker
    pub worker_client: Arc<dyn WorkerClient>,
    /// Persists the reattach record
    pub reattach_store: Arc<dyn ReattachStore>,
    /// Active and staged artifacts
    pub slots: ArtifactSlotManager,
    /// Receives lifecycle events
    pub events: Arc<dyn EventConsumer>,
    /// Relays chat traffic
    pub chat: Arc<dyn ChatRelay>,
    /// Runs long operations
    pub jobs: Arc<dyn JobManager>,
}

pub(super) struct Monitor {
    pub(super) cancel: CancellationToken,
    pub(super) task: JoinHandle<()>,
}

pub(crate) struct WatchdogInner {
    pub(super) config: Arc<WatchdogConfig>,
    pub(super) controller: Arc<dyn SessionController>,
    pub(super) client: Arc<dyn WorkerClient>,
    pub(super) store: Arc<dyn ReattachStore>,
    pub(super) slots: ArtifactSlotManager,
    pub(super) jobs: Arc<dyn JobManager>,
    pub(super) events: EventSink,
    /// Serializes state transitions
    pub(super) transition: tokio::sync::Mutex<()>,
    pub(super) status: watch::Sender<WatchdogStatus>,
    pub(super) session: watch::Sender<Option<Arc<GameSession>>>,
    pub(super) parameters: Mutex<LaunchParameters>,
    pub(super) primed: AtomicBool,
    pub(super) hard_restart: AtomicBool,
    pub(super) graceful_restart: AtomicBool,
    pub(super) restart: Notify,
    pub(super) crashes: Mutex<CrashTracker>,
    pub(super) monitor: Mutex<Option<Monitor>>,
    /// Cancels the launch in progress
    pub(super) launching: Mutex<Option<CancellationToken>>,
    pub(super) launch_begun: Notify,
    pub(super) reattach_consumed: AtomicBool,
    pub(super) self_ref: Weak<WatchdogInner>,
}

impl WatchdogInner {
    pub(super) fn status(&self) -> WatchdogStatus {
        *self.status.borrow()
    }

    /// Move to `next`, refusing moves outside the transition table
    pub(super) fn transition(&self, next: WatchdogStatus) -> Result<()> {
        let current = self.status();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            log::error!(
                "Watchdog {} refused transition {} -> {}",
                self.config.instance_name,
                current,
                next
            );
            return Err(WatchdogError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        log::info!("Watchdog {}: {} -> {}", self.config.instance_name, current, next);
        self.status.send_replace(next);
        Ok(())
    }

    /// [`Self::transition`] reporting whether the move happened; a refused
    /// move is already logged
    pub(super) fn advance(&self, next: WatchdogStatus) -> bool {
        self.transition(next).is_ok()
    }

    pub(super) fn current_session(&self) -> Option<Arc<GameSession>> {
        self.session.borrow().clone()
    }

    pub(super) fn install_session(&self, session: Option<Arc<GameSession>>) {
        self.session.send_replace(session);
    }

    pub(super) fn handler(&self) -> Weak<dyn BridgeHandler> {
        let handler: Weak<dyn BridgeHandler> = self.self_ref.clone();
        handler
    }
}

/// Supervises one worker process
///
/// Cloning yields another handle to the same watchdog.
#[derive(Clone)]
pub struct Watchdog {
    pub(super) inner: Arc<WatchdogInner>,
}

impl Watchdog {
    /// Create a watchdog; nothing runs until [`Watchdog::launch`]
    pub fn new(config: Arc<WatchdogConfig>, services: WatchdogServices) -> Self {
        let events = EventSink::new(services.events, services.chat, config.event_timeout);
        let crashes = CrashTracker::new(config.max_consecutive_crashes, config.stable_uptime);
        let parameters = config.launch_parameters.clone();
        let (status, _) = watch::channel(WatchdogStatus::Offline);
        let (session, _) = watch::channel(None);

        let inner = Arc::new_cyclic(|self_ref| WatchdogInner {
            config,
            controller: services.controller,
            client: services.worker_client,
            store: services.reattach_store,
            slots: services.slots,
            jobs: services.jobs,
            events,
            transition: tokio::sync::Mutex::new(()),
            status,
            session,
            parameters: Mutex::new(parameters),
            primed: AtomicBool::new(false),
            hard_restart: AtomicBool::new(false),
            graceful_restart: AtomicBool::new(false),
            restart: Notify::new(),
            crashes: Mutex::new(crashes),
            monitor: Mutex::new(None),
            launching: Mutex::new(None),
            launch_begun: Notify::new(),
            reattach_consumed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> WatchdogStatus {
        self.inner.status()
    }

    /// Every status from the current one on
    pub fn status_stream(&self) -> impl Stream<Item = WatchdogStatus> + Send + 'static {
        let mut updates = self.inner.status.subscribe();
        async_stream::stream! {
            let current = *updates.borrow_and_update();
            yield current;
            while updates.changed().await.is_ok() {
                let next = *updates.borrow_and_update();
                yield next;
            }
        }
    }

    /// Session currently supervised
    #[must_use]
    pub fn session(&self) -> Option<Arc<GameSession>> {
        self.inner.current_session()
    }

    /// Whether the worker reported it is ready for players
    #[must_use]
    pub fn is_primed(&self) -> bool {
        self.inner.primed.load(Ordering::SeqCst)
    }

    /// Parameters the next launch will use
    #[must_use]
    pub fn launch_parameters(&self) -> LaunchParameters {
        self.inner.parameters.lock().clone()
    }

    /// Whether a process replacement is queued
    #[must_use]
    pub fn hard_restart_pending(&self) -> bool {
        self.inner.hard_restart.load(Ordering::SeqCst)
    }

    /// Artifact slots this watchdog runs from
    #[must_use]
    pub fn slots(&self) -> &ArtifactSlotManager {
        &self.inner.slots
    }

    /// Replace the worker process out of band
    ///
    /// # Errors
    /// Returns `InvalidTransition` when no worker is running
    pub fn restart(&self, graceful: bool) -> Result<()> {
        let status = self.status();
        if !status.has_process() {
            return Err(WatchdogError::InvalidTransition {
                from: status,
                to: WatchdogStatus::HardRestarting,
            });
        }
        log::info!(
            "Restart of {} requested ({})",
            self.inner.config.instance_name,
            if graceful { "graceful" } else { "immediate" }
        );
        self.inner.graceful_restart.store(graceful, Ordering::SeqCst);
        self.inner.hard_restart.store(true, Ordering::SeqCst);
        self.inner.restart.notify_one();
        Ok(())
    }

    /// Replace the launch parameters wholesale.
    ///
    /// Changes that need a new process take effect at the worker's next
    /// reboot. A port change is pushed to the running worker and falls back
    /// to the same path if the worker refuses it.
    pub async fn change_launch_parameters(&self, parameters: LaunchParameters) {
        let inner = &self.inner;
        *inner.parameters.lock() = parameters.clone();

        let Some(session) = inner.current_session() else {
            log::info!("Launch parameters updated; they apply at the next launch");
            return;
        };

        let running = session.parameters();
        if running.requires_relaunch(&parameters) {
            log::info!("New launch parameters need a new process; replacing it at the next reboot");
            inner.hard_restart.store(true, Ordering::SeqCst);
            return;
        }

        if running.port != parameters.port {
            let info = session.reattach_information();
            let moved = inner
                .client
                .set_port(
                    info.listening_port,
                    &info.interop_access_key,
                    parameters.port,
                    inner.config.probe_timeout,
                )
                .await;
            match moved {
                Ok(()) => {
                    if let Err(e) = session.set_port(parameters.port).await {
                        log::warn!("Failed to persist port change: {}", e);
                    }
                    inner.events.emit_detached(
                        crate::events::EventType::PortChange,
                        vec![running.port.to_string(), parameters.port.to_string()],
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Worker refused port {}: {}; replacing it at the next reboot",
                        parameters.port,
                        e
                    );
                    inner.hard_restart.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Show `text` to the worker's players
    ///
    /// # Errors
    /// Returns error when no worker runs or it does not acknowledge the notice
    pub async fn broadcast(&self, text: impl Into<String>) -> Result<()> {
        let session = self
            .inner
            .current_session()
            .ok_or_else(|| WatchdogError::bridge("no worker is running"))?;
        let info = session.reattach_information();
        self.inner
            .client
            .chat_notice(
                info.listening_port,
                &info.interop_access_key,
                text.into(),
                self.inner.config.probe_timeout,
            )
            .await
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("instance", &self.inner.config.instance_name)
            .field("status", &self.status())
            .field("session", &self.session())
            .finish()
    }
}
