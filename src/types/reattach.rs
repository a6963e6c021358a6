//! Reattach record persisted across supervisor restarts

use serde::{Deserialize, Serialize};

use super::identifiers::{AccessKey, ArtifactId};

/// Interop API version spoken by this supervisor
pub const INTEROP_API_VERSION: &str = "5.10.0";

/// Minimal state needed to resume supervision of a running worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReattachInformation {
    /// OS process id of the worker
    pub process_id: u32,
    /// Port the worker currently listens on
    pub listening_port: u16,
    /// Access key the worker presents on bridge calls
    pub interop_access_key: AccessKey,
    /// Interop API version the worker was launched with
    pub interop_api_version: String,
    /// Artifact the worker is running
    pub artifact_id: ArtifactId,
}

impl ReattachInformation {
    /// Whether this supervisor still speaks the recorded interop version.
    ///
    /// Only the major component has to match.
    #[must_use]
    pub fn api_compatible(&self) -> bool {
        major(&self.interop_api_version) == major(INTEROP_API_VERSION)
    }
}

fn major(version: &str) -> Option<&str> {
    version.split('.').next().filter(|m| !m.is_empty())
}
