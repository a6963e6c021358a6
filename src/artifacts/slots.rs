//! Active/staged artifact slots with reference-counted locks
//!
//! All access to the two slots goes through [`ArtifactSlotManager`]. Consumers
//! pin artifacts with an [`ArtifactLease`]; an artifact's resources are only
//! handed to the [`ArtifactCleanup`] once it left its slot and the last lease
//! holding it is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Result, WatchdogError};
use crate::types::identifiers::ArtifactId;

use super::artifact::CompiledArtifact;
use super::cleanup::{ArtifactCleanup, NoopCleanup};

const EVENT_CAPACITY: usize = 16;

/// Result of [`ArtifactSlotManager::promote_staged`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// Nothing was staged
    NothingStaged,
    /// `staged` became `active` immediately
    Applied,
    /// The active artifact is locked; the swap happens on release
    Deferred,
}

/// Notifications about slot changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionEvent {
    /// A new artifact was staged
    Staged(ArtifactId),
    /// A promotion is waiting for the active artifact to be released
    Deferred(ArtifactId),
    /// The artifact is now active
    Applied(ArtifactId),
}

#[derive(Default)]
struct SlotState {
    active: Option<Arc<CompiledArtifact>>,
    staged: Option<Arc<CompiledArtifact>>,
    locks: HashMap<ArtifactId, usize>,
    promotion_pending: bool,
    /// Left their slot while still locked
    orphans: Vec<Arc<CompiledArtifact>>,
}

impl SlotState {
    fn lock_count(&self, id: &ArtifactId) -> usize {
        self.locks.get(id).copied().unwrap_or(0)
    }

    fn is_locked(&self, artifact: &Option<Arc<CompiledArtifact>>) -> bool {
        artifact.as_ref().is_some_and(|a| self.lock_count(&a.id) > 0)
    }

    /// Move `staged` into `active`, returning the displaced artifact
    fn swap(&mut self) -> Option<Arc<CompiledArtifact>> {
        self.promotion_pending = false;
        let next = self.staged.take()?;
        self.active.replace(next)
    }

    /// Park or hand out an artifact that left its slot
    fn displace(&mut self, artifact: Arc<CompiledArtifact>, retire: &mut Vec<Arc<CompiledArtifact>>) {
        if self.lock_count(&artifact.id) > 0 {
            self.orphans.push(artifact);
        } else {
            retire.push(artifact);
        }
    }
}

struct Shared {
    state: Mutex<SlotState>,
    cleanup: Arc<dyn ArtifactCleanup>,
    events: broadcast::Sender<PromotionEvent>,
}

impl Shared {
    fn emit(&self, event: PromotionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn retire_all(&self, retired: Vec<Arc<CompiledArtifact>>) {
        for artifact in retired {
            self.cleanup.retire(&artifact);
        }
    }

    fn release(&self, artifacts: &[Arc<CompiledArtifact>]) {
        let mut retire = Vec::new();
        let mut applied = None;
        {
            let mut state = self.state.lock();
            for artifact in artifacts {
                if let Some(count) = state.locks.get_mut(&artifact.id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.locks.remove(&artifact.id);
                    }
                }
            }

            if state.promotion_pending && !state.is_locked(&state.active.clone()) {
                if let Some(old) = state.swap() {
                    state.displace(old, &mut retire);
                }
                applied = state.active.as_ref().map(|a| a.id.clone());
            }

            let (free, still_locked): (Vec<_>, Vec<_>) = std::mem::take(&mut state.orphans)
                .into_iter()
                .partition(|a| state.lock_count(&a.id) == 0);
            state.orphans = still_locked;
            retire.extend(free);
        }

        if let Some(id) = applied {
            log::info!("Deferred promotion applied: artifact {} is now active", id);
            self.emit(PromotionEvent::Applied(id));
        }
        self.retire_all(retire);
    }
}

/// Pins one or more artifacts for as long as it is alive
pub struct ArtifactLease {
    shared: Arc<Shared>,
    artifacts: Vec<Arc<CompiledArtifact>>,
}

impl ArtifactLease {
    /// The artifact a new process should run
    #[must_use]
    pub fn primary(&self) -> &Arc<CompiledArtifact> {
        // Leases are never built empty
        &self.artifacts[0]
    }

    /// Every pinned artifact
    #[must_use]
    pub fn artifacts(&self) -> &[Arc<CompiledArtifact>] {
        &self.artifacts
    }

    /// Find a pinned artifact by id
    #[must_use]
    pub fn find(&self, id: &ArtifactId) -> Option<&Arc<CompiledArtifact>> {
        self.artifacts.iter().find(|a| &a.id == id)
    }

    /// Keep only the lock on `id`, releasing the others.
    ///
    /// Returns false (and keeps every lock) when `id` is not pinned.
    pub fn narrow_to(&mut self, id: &ArtifactId) -> bool {
        let Some(position) = self.artifacts.iter().position(|a| &a.id == id) else {
            return false;
        };
        let keep = self.artifacts.swap_remove(position);
        let released = std::mem::replace(&mut self.artifacts, vec![keep]);
        self.shared.release(&released);
        true
    }
}

impl std::fmt::Debug for ArtifactLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactLease")
            .field(
                "artifacts",
                &self.artifacts.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        let artifacts = std::mem::take(&mut self.artifacts);
        self.shared.release(&artifacts);
    }
}

/// Owner of the `active` and `staged` slots
#[derive(Clone)]
pub struct ArtifactSlotManager {
    shared: Arc<Shared>,
}

impl ArtifactSlotManager {
    /// Create a manager that keeps retired artifacts on disk
    #[must_use]
    pub fn new() -> Self {
        Self::with_cleanup(Arc::new(NoopCleanup))
    }

    /// Create a manager with a custom cleanup for retired artifacts
    #[must_use]
    pub fn with_cleanup(cleanup: Arc<dyn ArtifactCleanup>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SlotState::default()),
                cleanup,
                events,
            }),
        }
    }

    /// Subscribe to slot change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PromotionEvent> {
        self.shared.events.subscribe()
    }

    /// Currently active artifact
    #[must_use]
    pub fn active(&self) -> Option<Arc<CompiledArtifact>> {
        self.shared.state.lock().active.clone()
    }

    /// Currently staged artifact
    #[must_use]
    pub fn staged(&self) -> Option<Arc<CompiledArtifact>> {
        self.shared.state.lock().staged.clone()
    }

    /// Whether a promotion waits for the active artifact to be released
    #[must_use]
    pub fn promotion_pending(&self) -> bool {
        self.shared.state.lock().promotion_pending
    }

    /// Number of live locks on an artifact
    #[must_use]
    pub fn lock_count(&self, id: &ArtifactId) -> usize {
        self.shared.state.lock().lock_count(id)
    }

    /// Put a finished build into the `staged` slot, replacing any staged one
    pub fn stage(&self, artifact: CompiledArtifact) {
        let id = artifact.id.clone();
        let mut retire = Vec::new();
        {
            let mut state = self.shared.state.lock();
            if let Some(previous) = state.staged.replace(Arc::new(artifact)) {
                state.displace(previous, &mut retire);
            }
        }
        log::info!("Artifact {} staged", id);
        self.shared.emit(PromotionEvent::Staged(id));
        self.shared.retire_all(retire);
    }

    /// Promote `staged` to `active`.
    ///
    /// Swaps immediately when nobody holds the active artifact; otherwise the
    /// swap is deferred until the last lease on it is dropped.
    pub fn promote_staged(&self) -> PromotionOutcome {
        let mut retire = Vec::new();
        let (outcome, id) = {
            let mut state = self.shared.state.lock();
            let Some(staged_id) = state.staged.as_ref().map(|a| a.id.clone()) else {
                return PromotionOutcome::NothingStaged;
            };

            if state.is_locked(&state.active.clone()) {
                state.promotion_pending = true;
                (PromotionOutcome::Deferred, staged_id)
            } else {
                if let Some(old) = state.swap() {
                    state.displace(old, &mut retire);
                }
                (PromotionOutcome::Applied, staged_id)
            }
        };

        match outcome {
            PromotionOutcome::Applied => {
                log::info!("Artifact {} promoted to active", id);
                self.shared.emit(PromotionEvent::Applied(id));
            }
            PromotionOutcome::Deferred => {
                log::info!("Promotion of artifact {} deferred until the active artifact is released", id);
                self.shared.emit(PromotionEvent::Deferred(id));
            }
            PromotionOutcome::NothingStaged => {}
        }
        self.shared.retire_all(retire);
        outcome
    }

    /// Pin up to `n` artifacts: the active one first, then the staged one.
    ///
    /// With no active artifact the staged one is promoted first, since nothing
    /// can be consuming the empty slot.
    ///
    /// # Errors
    /// Returns `Artifact` when both slots are empty or `n` is zero
    pub fn lock_next_artifacts(&self, n: usize) -> Result<ArtifactLease> {
        if n == 0 {
            return Err(WatchdogError::artifact("cannot lock zero artifacts"));
        }

        let mut promoted = None;
        let artifacts = {
            let mut state = self.shared.state.lock();
            if state.active.is_none() && state.staged.is_some() {
                state.swap();
                promoted = state.active.as_ref().map(|a| a.id.clone());
            }

            let Some(active) = state.active.clone() else {
                return Err(WatchdogError::artifact("no artifact has been deployed"));
            };

            let mut artifacts = vec![active];
            if n >= 2
                && let Some(staged) = state.staged.clone()
            {
                artifacts.push(staged);
            }
            for artifact in &artifacts {
                *state.locks.entry(artifact.id.clone()).or_insert(0) += 1;
            }
            artifacts
        };

        if let Some(id) = promoted {
            self.shared.emit(PromotionEvent::Applied(id));
        }

        Ok(ArtifactLease {
            shared: Arc::clone(&self.shared),
            artifacts,
        })
    }
}

impl Default for ArtifactSlotManager {
    fn default() -> Self {
        Self::new()
    }
}
