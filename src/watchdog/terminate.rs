//! Stopping the worker

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::EventType;
use crate::session::GameSession;
use crate::types::status::WatchdogStatus;

use super::core::{Watchdog, WatchdogInner};

impl Watchdog {
    /// Stop the worker and supervision.
    ///
    /// A graceful stop asks the worker to shut down and waits for the grace
    /// period before killing it. Artifact locks and the reattach record are
    /// released once the process is gone.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the watchdog cannot enter `Terminating`
    pub async fn terminate(&self, graceful: bool, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;

        let monitor = inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            if let Err(e) = monitor.task.await {
                log::warn!("Supervision loop ended abnormally: {}", e);
            }
        }

        let mut preempted = false;
        let _transition = loop {
            let begun = inner.launch_begun.notified();
            tokio::pin!(begun);
            begun.as_mut().enable();
            if let Some(launching) = inner.launching.lock().take() {
                log::info!("Stopping the launch in progress for {}", inner.config.instance_name);
                launching.cancel();
                preempted = true;
            }
            tokio::select! {
                guard = inner.transition.lock() => break guard,
                () = &mut begun => {}
            }
        };
        // A monitor started by a launch that finished while we waited
        if let Some(monitor) = inner.monitor.lock().take() {
            monitor.cancel.cancel();
        }

        let status = inner.status();
        let session = inner.current_session();
        if status == WatchdogStatus::Offline && session.is_none() && !preempted {
            log::debug!("Watchdog {} already offline", inner.config.instance_name);
            return Ok(());
        }

        inner.transition(WatchdogStatus::Terminating)?;
        if let Some(session) = session {
            // A cancelled terminate still finishes, but without waiting politely
            let graceful = graceful && !cancel.is_cancelled();
            inner.stop_session(&session, graceful).await;
        }
        inner.hard_restart.store(false, Ordering::SeqCst);
        inner.primed.store(false, Ordering::SeqCst);
        inner.events.emit(EventType::WatchdogShutdown, Vec::new()).await;
        inner.transition(WatchdogStatus::Offline)
    }

    /// Stop supervising without touching the worker.
    ///
    /// The process keeps running and the reattach record is kept, so a later
    /// [`Watchdog::launch`] resumes it.
    pub async fn detach(&self) {
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            let _ = monitor.task.await;
        }
        log::info!(
            "Watchdog {} detached; the worker keeps running",
            self.inner.config.instance_name
        );
    }
}

impl WatchdogInner {
    /// Make sure `session`'s process is gone, then release everything it holds
    pub(super) async fn stop_session(&self, session: &Arc<GameSession>, graceful: bool) {
        let grace = self.config.graceful_shutdown_timeout;
        let pid = session.process_id();
        session.mark_expected_exit();

        if graceful && session.exited().is_none() {
            let info = session.reattach_information();
            match self
                .client
                .graceful_shutdown(info.listening_port, &info.interop_access_key, self.config.probe_timeout)
                .await
            {
                Ok(()) => log::debug!("Worker pid {} acknowledged shutdown", pid),
                Err(e) => log::warn!("Worker pid {} refused graceful shutdown: {}", pid, e),
            }
            if tokio::time::timeout(grace, session.wait_exit()).await.is_err() {
                log::warn!("Worker pid {} did not exit within {:?}; killing it", pid, grace);
            }
        }

        if session.exited().is_none() {
            if let Err(e) = session.kill() {
                log::warn!("Failed to kill worker pid {}: {}", pid, e);
            }
            if tokio::time::timeout(grace, session.wait_exit()).await.is_err() {
                log::error!("Worker pid {} is still running after kill", pid);
            }
        }

        session.detach();
        let is_current = self
            .current_session()
            .is_some_and(|current| Arc::ptr_eq(&current, session));
        if is_current {
            self.install_session(None);
        }
        if let Err(e) = self.store.clear().await {
            log::warn!("Failed to clear reattach information: {}", e);
        }
    }
}
