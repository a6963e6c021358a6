//! Disposal of retired artifacts

use std::path::PathBuf;

use super::artifact::CompiledArtifact;

/// Called once an artifact left its slot and no consumer holds a lock on it
pub trait ArtifactCleanup: Send + Sync {
    /// Free the artifact's resources
    fn retire(&self, artifact: &CompiledArtifact);
}

/// Keeps retired artifacts on disk
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCleanup;

impl ArtifactCleanup for NoopCleanup {
    fn retire(&self, artifact: &CompiledArtifact) {
        log::debug!("Artifact {} retired", artifact.id);
    }
}

/// Deletes the directory of retired artifacts
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryCleanup;

impl DirectoryCleanup {
    fn remove(id: String, directory: PathBuf) {
        match std::fs::remove_dir_all(&directory) {
            Ok(()) => log::info!("Removed artifact {} at {}", id, directory.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "Failed to remove artifact {} at {}: {}",
                id,
                directory.display(),
                e
            ),
        }
    }
}

impl ArtifactCleanup for DirectoryCleanup {
    fn retire(&self, artifact: &CompiledArtifact) {
        let id = artifact.id.to_string();
        let directory = artifact.directory.clone();

        // Lease drops happen on runtime threads; keep the delete off them
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || Self::remove(id, directory));
            }
            Err(_) => Self::remove(id, directory),
        }
    }
}
