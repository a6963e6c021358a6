//! Compiled artifacts and the active/staged slot manager
//!
//! The compiler collaborator hands finished builds to
//! [`ArtifactSlotManager::stage`]; sessions pin what they run through
//! [`ArtifactSlotManager::lock_next_artifacts`].

mod artifact;
mod cleanup;
mod slots;

pub use artifact::{ArtifactMetadata, CompiledArtifact};
pub use cleanup::{ArtifactCleanup, DirectoryCleanup, NoopCleanup};
pub use slots::{ArtifactLease, ArtifactSlotManager, PromotionEvent, PromotionOutcome};
