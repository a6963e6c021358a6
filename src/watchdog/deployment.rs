//! Promotion of staged artifacts

use std::sync::Weak;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use crate::artifacts::{ArtifactSlotManager, PromotionEvent, PromotionOutcome};
use crate::error::{Result, WatchdogError};
use crate::jobs::{JobContext, JobFuture, JobHandle};
use crate::types::identifiers::ArtifactId;

use super::core::{Watchdog, WatchdogInner};

impl Watchdog {
    /// Promote the staged artifact.
    ///
    /// When no process holds the active artifact the swap is immediate and
    /// `None` is returned. Otherwise the promotion is deferred and a
    /// "staged deployment" job is returned that finishes once the worker
    /// picked the artifact up. A promotion that cannot be hot-swapped queues a
    /// process replacement for the worker's next reboot.
    pub fn promote_staged(&self) -> Option<JobHandle> {
        let inner = &self.inner;
        let events = inner.slots.subscribe();

        match inner.slots.promote_staged() {
            PromotionOutcome::NothingStaged => {
                log::debug!("Nothing staged to promote");
                None
            }
            PromotionOutcome::Applied => None,
            PromotionOutcome::Deferred => {
                let staged = inner.slots.staged()?;
                let running = inner.current_session().and_then(|session| session.artifact());
                if running.is_some_and(|current| !staged.hot_swappable_from(&current)) {
                    log::info!(
                        "Artifact {} needs a new process; replacing it at the next reboot",
                        staged.id
                    );
                    inner.hard_restart.store(true, Ordering::SeqCst);
                }

                let deployment = StagedDeployment {
                    watchdog: inner.self_ref.clone(),
                    slots: inner.slots.clone(),
                    artifact: staged.id.clone(),
                    timeout: inner.config.promotion_timeout,
                    events,
                };
                Some(inner.jobs.register(
                    format!("Staged deployment of artifact {}", staged.id),
                    Box::new(move |ctx: JobContext| -> JobFuture { Box::pin(deployment.run(ctx)) }),
                ))
            }
        }
    }
}

struct StagedDeployment {
    watchdog: Weak<WatchdogInner>,
    slots: ArtifactSlotManager,
    artifact: ArtifactId,
    timeout: Duration,
    events: tokio::sync::broadcast::Receiver<PromotionEvent>,
}

impl StagedDeployment {
    async fn run(mut self, ctx: JobContext) -> Result<()> {
        ctx.report(10, "Waiting for the worker to release the active artifact");
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(PromotionEvent::Applied(id)) if id == self.artifact => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if !self.slots.promotion_pending() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(WatchdogError::artifact("artifact slots were dropped"));
                    }
                },
                () = &mut deadline => {
                    if !self.slots.promotion_pending() {
                        break;
                    }
                    return Err(self.force_restart());
                }
            }
        }

        ctx.report(100, "Deployed");
        log::info!("Artifact {} deployed", self.artifact);
        Ok(())
    }

    fn force_restart(&self) -> WatchdogError {
        log::warn!(
            "Artifact {} still not deployed after {:?}; forcing a hard restart",
            self.artifact,
            self.timeout
        );
        if let Some(watchdog) = self.watchdog.upgrade() {
            watchdog.hard_restart.store(true, Ordering::SeqCst);
            watchdog.restart.notify_one();
        }
        WatchdogError::timeout(format!(
            "artifact {} was not deployed within {:?}",
            self.artifact, self.timeout
        ))
    }
}
