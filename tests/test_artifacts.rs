//! Integration tests for artifact slots and lock tracking

use std::sync::Arc;

use parking_lot::Mutex;
use worker_watchdog::{
    ArtifactCleanup, ArtifactId, ArtifactMetadata, ArtifactSlotManager, CompiledArtifact,
    DirectoryCleanup, PromotionEvent, PromotionOutcome,
};

/// Cleanup that remembers what it was handed
#[derive(Default)]
struct RecordingCleanup {
    retired: Mutex<Vec<ArtifactId>>,
}

impl RecordingCleanup {
    fn retired(&self) -> Vec<ArtifactId> {
        self.retired.lock().clone()
    }
}

impl ArtifactCleanup for RecordingCleanup {
    fn retire(&self, artifact: &CompiledArtifact) {
        self.retired.lock().push(artifact.id.clone());
    }
}

fn artifact(name: &str) -> CompiledArtifact {
    CompiledArtifact::new(std::env::temp_dir().join(name), "server.dmb", ArtifactMetadata::default())
}

fn slots() -> (ArtifactSlotManager, Arc<RecordingCleanup>) {
    let cleanup = Arc::new(RecordingCleanup::default());
    (ArtifactSlotManager::with_cleanup(cleanup.clone()), cleanup)
}

#[test]
fn test_empty_slots_cannot_be_locked() {
    let (slots, _) = slots();
    assert!(slots.lock_next_artifacts(1).is_err());
    assert_eq!(slots.promote_staged(), PromotionOutcome::NothingStaged);
}

#[test]
fn test_first_lock_promotes_staged() {
    let (slots, _) = slots();
    let a = artifact("a");
    let id = a.id.clone();
    slots.stage(a);

    let lease = slots.lock_next_artifacts(2).unwrap();
    assert_eq!(lease.primary().id, id);
    assert_eq!(lease.artifacts().len(), 1);
    assert_eq!(slots.active().unwrap().id, id);
    assert!(slots.staged().is_none());
}

#[test]
fn test_locked_artifact_is_never_retired() {
    let (slots, cleanup) = slots();
    let a = artifact("a");
    let a_id = a.id.clone();
    slots.stage(a);
    slots.promote_staged();

    let lease = slots.lock_next_artifacts(1).unwrap();
    let b = artifact("b");
    let b_id = b.id.clone();
    slots.stage(b);

    assert_eq!(slots.promote_staged(), PromotionOutcome::Deferred);
    assert!(slots.promotion_pending());
    assert_eq!(slots.active().unwrap().id, a_id);
    assert!(cleanup.retired().is_empty());

    drop(lease);
    assert_eq!(slots.active().unwrap().id, b_id);
    assert!(!slots.promotion_pending());
    assert_eq!(cleanup.retired(), vec![a_id]);
}

#[test]
fn test_restaged_artifact_waits_for_its_lease() {
    let (slots, cleanup) = slots();
    slots.stage(artifact("a"));
    slots.promote_staged();
    let b = artifact("b");
    let b_id = b.id.clone();
    slots.stage(b);

    // Pins the active and the staged artifact
    let lease = slots.lock_next_artifacts(2).unwrap();
    assert_eq!(lease.artifacts().len(), 2);
    assert_eq!(slots.lock_count(&b_id), 1);

    let c = artifact("c");
    let c_id = c.id.clone();
    slots.stage(c);
    assert_eq!(slots.staged().unwrap().id, c_id);
    assert!(cleanup.retired().is_empty());

    drop(lease);
    assert_eq!(cleanup.retired(), vec![b_id]);
}

#[test]
fn test_unlocked_staged_artifact_is_retired_on_restage() {
    let (slots, cleanup) = slots();
    let a = artifact("a");
    let a_id = a.id.clone();
    slots.stage(a);
    slots.stage(artifact("b"));

    assert_eq!(cleanup.retired(), vec![a_id]);
}

#[test]
fn test_narrowing_releases_other_locks() {
    let (slots, _) = slots();
    slots.stage(artifact("a"));
    slots.promote_staged();
    let a_id = slots.active().unwrap().id.clone();
    let b = artifact("b");
    let b_id = b.id.clone();
    slots.stage(b);

    let mut lease = slots.lock_next_artifacts(2).unwrap();
    assert!(!lease.narrow_to(&ArtifactId::new("unknown")));
    assert_eq!(slots.lock_count(&a_id), 1);

    assert!(lease.narrow_to(&b_id));
    assert_eq!(slots.lock_count(&a_id), 0);
    assert_eq!(slots.lock_count(&b_id), 1);
    assert_eq!(lease.primary().id, b_id);
}

#[test]
fn test_locks_are_counted() {
    let (slots, cleanup) = slots();
    slots.stage(artifact("a"));
    slots.promote_staged();
    let a_id = slots.active().unwrap().id.clone();

    let first = slots.lock_next_artifacts(1).unwrap();
    let second = slots.lock_next_artifacts(1).unwrap();
    assert_eq!(slots.lock_count(&a_id), 2);

    slots.stage(artifact("b"));
    assert_eq!(slots.promote_staged(), PromotionOutcome::Deferred);

    drop(first);
    assert!(slots.promotion_pending());
    assert!(cleanup.retired().is_empty());

    drop(second);
    assert!(!slots.promotion_pending());
    assert_eq!(cleanup.retired(), vec![a_id]);
}

#[test]
fn test_deferred_promotion_is_announced() {
    let (slots, _) = slots();
    slots.stage(artifact("a"));
    slots.promote_staged();
    let lease = slots.lock_next_artifacts(1).unwrap();

    let mut events = slots.subscribe();
    let b = artifact("b");
    let b_id = b.id.clone();
    slots.stage(b);
    slots.promote_staged();
    drop(lease);

    assert_eq!(events.try_recv().unwrap(), PromotionEvent::Staged(b_id.clone()));
    assert_eq!(events.try_recv().unwrap(), PromotionEvent::Deferred(b_id.clone()));
    assert_eq!(events.try_recv().unwrap(), PromotionEvent::Applied(b_id));
}

#[tokio::test]
async fn test_directory_cleanup_removes_retired_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let old_dir = dir.path().join("old");
    std::fs::create_dir_all(&old_dir).unwrap();
    std::fs::write(old_dir.join("server.dmb"), b"compiled").unwrap();

    let slots = ArtifactSlotManager::with_cleanup(Arc::new(DirectoryCleanup));
    slots.stage(CompiledArtifact::new(&old_dir, "server.dmb", ArtifactMetadata::default()));
    slots.promote_staged();
    slots.stage(CompiledArtifact::new(dir.path().join("new"), "server.dmb", ArtifactMetadata::default()));
    slots.promote_staged();

    let removed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while old_dir.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(removed.is_ok());
}
