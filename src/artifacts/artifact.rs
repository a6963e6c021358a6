//! Compiled artifact handle

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::identifiers::ArtifactId;
use crate::types::runtime::TestMerge;

/// Build metadata supplied by the compiler collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    /// Source revision the artifact was built from
    pub revision: Option<String>,
    /// Engine version the artifact targets
    pub engine_version: String,
    /// Test merges included in the build
    #[serde(default)]
    pub test_merges: Vec<TestMerge>,
    /// Compiler asked for a full process replacement
    #[serde(default)]
    pub force_hard_restart: bool,
    /// When the build finished
    pub compiled_at: DateTime<Utc>,
}

impl Default for ArtifactMetadata {
    fn default() -> Self {
        Self {
            revision: None,
            engine_version: String::new(),
            test_merges: Vec::new(),
            force_hard_restart: false,
            compiled_at: Utc::now(),
        }
    }
}

/// One immutable, runnable build of the worker payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledArtifact {
    /// Unique id
    pub id: ArtifactId,
    /// Directory holding the build output
    pub directory: PathBuf,
    /// File inside `directory` the engine loads
    pub entry_file: String,
    /// Build metadata
    pub metadata: ArtifactMetadata,
}

impl CompiledArtifact {
    /// Create an artifact with a fresh id
    pub fn new(
        directory: impl Into<PathBuf>,
        entry_file: impl Into<String>,
        metadata: ArtifactMetadata,
    ) -> Self {
        Self {
            id: ArtifactId::generate(),
            directory: directory.into(),
            entry_file: entry_file.into(),
            metadata,
        }
    }

    /// Full path of the entry file
    #[must_use]
    pub fn entry_path(&self) -> PathBuf {
        self.directory.join(&self.entry_file)
    }

    /// Directory holding the build output
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Whether a worker running `previous` can pick this artifact up with a
    /// soft restart instead of a new process.
    #[must_use]
    pub fn hot_swappable_from(&self, previous: &CompiledArtifact) -> bool {
        !self.metadata.force_hard_restart
            && self.metadata.engine_version == previous.metadata.engine_version
            && self.metadata.test_merges == previous.metadata.test_merges
    }
}
