//! Launching and the supervision loop

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, WatchdogError};
use crate::events::EventType;
use crate::session::{GameSession, SessionExit};
use crate::types::reattach::ReattachInformation;
use crate::types::status::WatchdogStatus;

use super::core::{Monitor, Watchdog, WatchdogInner};

enum MonitorEvent {
    Exited(SessionExit),
    Rebooted,
    RestartRequested,
}

impl Watchdog {
    /// Start supervising the worker.
    ///
    /// Resumes a process recorded in the reattach store when it is still
    /// alive, otherwise spawns one. Returns once the worker is `Online`; a
    /// background loop then follows the session until [`Watchdog::terminate`]
    /// or until `cancel` fires, which leaves the process running for a later
    /// reattach.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless `Offline`, `Cancelled` if `cancel`
    /// fired or [`Watchdog::terminate`] was called before startup, or `Fatal`
    /// once launch attempts are exhausted
    pub async fn launch(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        let status = inner.status();
        if status != WatchdogStatus::Offline {
            return Err(WatchdogError::InvalidTransition {
                from: status,
                to: WatchdogStatus::Starting,
            });
        }

        let supervision = cancel.child_token();
        *inner.launching.lock() = Some(supervision.clone());
        inner.launch_begun.notify_waiters();
        inner.transition(WatchdogStatus::Starting)?;

        let reattach = inner.load_reattach_once().await;
        let started = inner.start_session(reattach, &supervision).await;
        inner.launching.lock().take();

        if let Err(e) = started {
            inner.advance(WatchdogStatus::Offline);
            if !matches!(e, WatchdogError::Cancelled) {
                log::error!("Watchdog {} failed to launch: {}", inner.config.instance_name, e);
                inner.events.emit(EventType::WatchdogFatal, vec![e.to_string()]).await;
            }
            return Err(e);
        }
        inner.crashes.lock().reset();
        inner.transition(WatchdogStatus::Online)?;

        // Spawned under the transition lock so a concurrent terminate sees it
        let task = tokio::spawn(Arc::clone(inner).supervise(supervision.clone()));
        let previous = inner.monitor.lock().replace(Monitor {
            cancel: supervision,
            task,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(())
    }
}

impl WatchdogInner {
    async fn load_reattach_once(&self) -> Option<ReattachInformation> {
        if self.reattach_consumed.swap(true, Ordering::SeqCst) {
            return None;
        }
        match self.store.load().await {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Failed to read reattach information: {}", e);
                None
            }
        }
    }

    /// Launch with bounded retries and backoff
    pub(super) async fn start_session(
        &self,
        mut reattach: Option<ReattachInformation>,
        cancel: &CancellationToken,
    ) -> Result<Arc<GameSession>> {
        let attempts = self.config.launch_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.backoff.next(attempt - 1);
                log::info!(
                    "Retrying worker launch in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(WatchdogError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(WatchdogError::Cancelled);
            }

            match self.try_start(reattach.take(), cancel).await {
                Ok(session) => return Ok(session),
                Err(WatchdogError::Cancelled) => return Err(WatchdogError::Cancelled),
                Err(e) if e.is_retryable() => {
                    log::warn!("Worker launch attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(WatchdogError::fatal(format!(
            "worker failed to start after {attempts} attempt(s): {}",
            last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }

    async fn try_start(
        &self,
        reattach: Option<ReattachInformation>,
        cancel: &CancellationToken,
    ) -> Result<Arc<GameSession>> {
        let lease = self.slots.lock_next_artifacts(2)?;
        let parameters = self.parameters.lock().clone();
        let session = Arc::new(
            self.controller
                .launch_new(lease, reattach, parameters, self.handler(), cancel)
                .await?,
        );
        self.primed.store(false, Ordering::SeqCst);
        self.install_session(Some(Arc::clone(&session)));
        let pid = session.process_id().to_string();

        if session.is_reattached() {
            self.parameters.lock().port = session.parameters().port;
            session.mark_started();
            self.events.emit(EventType::WorkerReattach, vec![pid]).await;
            return Ok(session);
        }

        self.events.emit(EventType::WorkerLaunch, vec![pid]).await;
        match self.await_startup(&session, cancel).await {
            Ok(_) => Ok(session),
            Err(e) => {
                self.stop_session(&session, false).await;
                Err(e)
            }
        }
    }

    /// Wait for the session to report startup
    pub(super) async fn await_startup(&self, session: &GameSession, cancel: &CancellationToken) -> Result<Duration> {
        let timeout = self.config.startup_timeout;
        tokio::select! {
            latency = session.wait_started() => {
                log::info!("Worker pid {} started in {:?}", session.process_id(), latency);
                self.events
                    .emit(EventType::WorkerStartup, vec![latency.as_millis().to_string()])
                    .await;
                Ok(latency)
            }
            exit = session.wait_exit() => Err(WatchdogError::process(
                "worker exited before reporting startup",
                exit.exit_code,
            )),
            () = tokio::time::sleep(timeout) => Err(WatchdogError::StartupTimeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            () = cancel.cancelled() => Err(WatchdogError::Cancelled),
        }
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        log::debug!("Supervision loop for {} started", self.config.instance_name);
        loop {
            let Some(session) = self.current_session() else {
                break;
            };

            let event = tokio::select! {
                () = cancel.cancelled() => break,
                exit = session.wait_exit() => MonitorEvent::Exited(exit),
                () = session.rebooted() => MonitorEvent::Rebooted,
                () = self.restart.notified() => MonitorEvent::RestartRequested,
            };

            let _transition = self.transition.lock().await;
            if cancel.is_cancelled() {
                break;
            }
            let keep_going = match event {
                MonitorEvent::Exited(exit) => self.on_exit(&session, exit, &cancel).await,
                MonitorEvent::Rebooted => self.on_reboot(&session, &cancel).await,
                MonitorEvent::RestartRequested => {
                    if self.hard_restart.load(Ordering::SeqCst) {
                        let graceful = self.graceful_restart.swap(false, Ordering::SeqCst);
                        self.replace_process(&session, graceful, &cancel).await
                    } else {
                        true
                    }
                }
            };
            if !keep_going {
                break;
            }
        }
        log::debug!("Supervision loop for {} ended", self.config.instance_name);
    }

    async fn on_exit(&self, session: &Arc<GameSession>, exit: SessionExit, cancel: &CancellationToken) -> bool {
        if !exit.is_crash() || self.hard_restart.load(Ordering::SeqCst) {
            log::info!(
                "Worker pid {} exited as requested (code {:?})",
                session.process_id(),
                exit.exit_code
            );
            return self.replace_process(session, false, cancel).await;
        }

        let uptime = session.uptime();
        log::warn!(
            "Worker pid {} crashed with code {:?} after {:?}",
            session.process_id(),
            exit.exit_code,
            uptime
        );
        let code = exit
            .exit_code
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        self.events.emit(EventType::WorkerCrash, vec![code]).await;

        if !self.advance(WatchdogStatus::HardRestarting) {
            return false;
        }
        let next = self.crashes.lock().record_crash(uptime);
        self.stop_session(session, false).await;

        if next == WatchdogStatus::Offline {
            let crashes = self.crashes.lock().consecutive();
            log::error!(
                "Watchdog {} giving up after {} consecutive crashes",
                self.config.instance_name,
                crashes
            );
            self.advance(WatchdogStatus::Offline);
            self.events
                .emit(EventType::WatchdogFatal, vec![format!("{crashes} consecutive crashes")])
                .await;
            self.events
                .notify_chat("The server crashed repeatedly and will not be restarted automatically")
                .await;
            return false;
        }

        self.events.notify_chat("The server crashed and is restarting").await;
        self.relaunch(cancel).await
    }

    async fn on_reboot(&self, session: &Arc<GameSession>, cancel: &CancellationToken) -> bool {
        if self.transition(WatchdogStatus::Restarting).is_err() {
            return true;
        }
        self.primed.store(false, Ordering::SeqCst);
        self.events.emit(EventType::WorkerReboot, Vec::new()).await;

        if let Err(e) = self.apply_hot_swap(session).await {
            log::warn!("Hot swap failed, replacing the process instead: {}", e);
            self.hard_restart.store(true, Ordering::SeqCst);
        }
        if self.hard_restart.load(Ordering::SeqCst) {
            log::info!("Replacing worker pid {} at reboot", session.process_id());
            return self.replace_process(session, false, cancel).await;
        }

        if !self.advance(WatchdogStatus::Starting) {
            return false;
        }
        match self.await_startup(session, cancel).await {
            Ok(_) => self.advance(WatchdogStatus::Online),
            Err(WatchdogError::Cancelled) => false,
            Err(e) => match session.exited() {
                Some(exit) if exit.is_crash() => self.on_exit(session, exit, cancel).await,
                _ => {
                    log::warn!("Worker did not come back from reboot: {}", e);
                    self.replace_process(session, false, cancel).await
                }
            },
        }
    }

    /// Soft-swap the session to a pending, hot-swappable promotion
    async fn apply_hot_swap(&self, session: &GameSession) -> Result<()> {
        if !self.slots.promotion_pending() {
            return Ok(());
        }
        let (Some(staged), Some(current)) = (self.slots.staged(), session.artifact()) else {
            return Ok(());
        };
        if !staged.hot_swappable_from(&current) {
            self.hard_restart.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let mut lease = self.slots.lock_next_artifacts(2)?;
        if !lease.narrow_to(&staged.id) {
            return Err(WatchdogError::artifact(format!(
                "staged artifact {} is no longer staged",
                staged.id
            )));
        }
        session.replace_lease(lease).await?;
        log::info!("Worker pid {} now runs artifact {}", session.process_id(), staged.id);
        Ok(())
    }

    /// Hard restart: stop the process and launch a new one
    pub(super) async fn replace_process(
        &self,
        session: &Arc<GameSession>,
        graceful: bool,
        cancel: &CancellationToken,
    ) -> bool {
        if !self.advance(WatchdogStatus::HardRestarting) {
            return false;
        }
        self.events.emit(EventType::WorkerHardReboot, Vec::new()).await;
        self.stop_session(session, graceful).await;
        self.hard_restart.store(false, Ordering::SeqCst);
        self.relaunch(cancel).await
    }

    async fn relaunch(&self, cancel: &CancellationToken) -> bool {
        if !self.advance(WatchdogStatus::Starting) {
            return false;
        }
        match self.start_session(None, cancel).await {
            Ok(_) => self.advance(WatchdogStatus::Online),
            Err(WatchdogError::Cancelled) => {
                self.advance(WatchdogStatus::Offline);
                false
            }
            Err(e) => {
                log::error!("Watchdog {} failed to relaunch: {}", self.config.instance_name, e);
                self.advance(WatchdogStatus::Offline);
                self.events.emit(EventType::WatchdogFatal, vec![e.to_string()]).await;
                false
            }
        }
    }
}
