//! Runtime information handed to the worker at startup, and chat payloads

use serde::{Deserialize, Serialize};

use super::identifiers::{AccessKey, ArtifactId};
use super::launch::SecurityLevel;

/// A pull request merged into the running artifact for testing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMerge {
    /// Pull request number
    pub number: u64,
    /// Merged commit
    pub target_commit: String,
    /// Pull request title
    pub title: String,
    /// Pull request author
    pub author: String,
}

/// A chat channel the worker may address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatChannel {
    /// Channel id used in `ChatSend`
    pub id: u64,
    /// Display name
    pub friendly_name: String,
    /// Whether admin-only traffic goes here
    pub is_admin_channel: bool,
    /// Receives watchdog event notices
    pub is_watchdog_channel: bool,
}

/// A chat message relayed from the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message text
    pub text: String,
    /// Destination channel ids; empty means every channel
    #[serde(default)]
    pub channel_ids: Vec<u64>,
}

/// Bundle returned to the worker when it reports startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInformation {
    /// Name of the managed instance
    pub instance_name: String,
    /// Supervisor version
    pub server_version: String,
    /// Interop API version
    pub api_version: String,
    /// Artifact the worker is running
    pub artifact_id: ArtifactId,
    /// Source revision of the artifact
    pub revision: Option<String>,
    /// Test merges in the artifact
    pub test_merges: Vec<TestMerge>,
    /// Sandbox level of this launch
    pub security_level: SecurityLevel,
    /// Chat channels currently connected
    pub chat_channels: Vec<ChatChannel>,
    /// Per-session access identifier for further bridge calls
    pub access_identifier: AccessKey,
}
