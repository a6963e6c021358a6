//! Bridge message types
//!
//! One JSON object per call in each direction. Requests larger than the
//! transport's payload ceiling travel as a series of `Chunk` requests whose
//! payloads concatenate to the logical request.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchdogError};
use crate::types::identifiers::AccessKey;
use crate::types::runtime::{ChatMessage, RuntimeInformation};

/// Command carried by a bridge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeCommandType {
    /// Move the worker to another port
    PortUpdate,
    /// The worker finished initialising
    Startup,
    /// The worker is ready to accept players
    Prime,
    /// The worker is re-initialising inside the same process
    Reboot,
    /// The worker wants its process replaced
    Kill,
    /// Relay a chat message
    ChatSend,
    /// One part of a larger request
    Chunk,
}

/// One part of a chunked request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedPayload {
    /// Identifies the logical request the parts belong to
    pub payload_id: u32,
    /// Number of parts of the logical request
    pub total_chunks: u32,
    /// Position of this part, 0-based
    pub sequence_id: u32,
    /// This part's slice of the logical request JSON
    #[serde(alias = "partialJson")]
    pub payload: String,
}

/// Request sent by the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    /// Command to execute
    pub command_type: BridgeCommandType,
    /// Access key of the calling session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_identifier: Option<AccessKey>,
    /// New port for `PortUpdate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Interop version the worker speaks, sent with `Startup`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Message for `ChatSend`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_message: Option<ChatMessage>,
    /// Part for `Chunk`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkedPayload>,
}

impl BridgeRequest {
    /// Create a request without command-specific fields
    #[must_use]
    pub fn new(command_type: BridgeCommandType) -> Self {
        Self {
            command_type,
            access_identifier: None,
            port: None,
            version: None,
            chat_message: None,
            chunk: None,
        }
    }

    /// Attach the caller's access key
    #[must_use]
    pub fn with_access(mut self, key: AccessKey) -> Self {
        self.access_identifier = Some(key);
        self
    }

    /// Create a `PortUpdate` request
    #[must_use]
    pub fn port_update(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::new(BridgeCommandType::PortUpdate)
        }
    }

    /// Create a `ChatSend` request
    #[must_use]
    pub fn chat(message: ChatMessage) -> Self {
        Self {
            chat_message: Some(message),
            ..Self::new(BridgeCommandType::ChatSend)
        }
    }

    /// Create a `Chunk` request
    #[must_use]
    pub fn chunk(chunk: ChunkedPayload) -> Self {
        Self {
            chunk: Some(chunk),
            ..Self::new(BridgeCommandType::Chunk)
        }
    }

    /// Parse one request from JSON
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or names an unknown command
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(WatchdogError::from)
    }

    /// Split this request into `Chunk` requests whose payloads are at most
    /// `max_part` bytes, cut on character boundaries.
    ///
    /// The chunk requests carry this request's access key.
    ///
    /// # Errors
    /// Returns error if `max_part` is zero or serialization fails
    pub fn into_chunks(&self, payload_id: u32, max_part: usize) -> Result<Vec<Self>> {
        if max_part == 0 {
            return Err(WatchdogError::chunk("chunk size must be positive"));
        }

        let json = serde_json::to_string(self)?;
        let mut parts = Vec::new();
        let mut rest = json.as_str();
        while !rest.is_empty() {
            let mut end = rest.len().min(max_part);
            while !rest.is_char_boundary(end) {
                end -= 1;
            }
            if end == 0 {
                // A single character wider than the part size
                end = rest.chars().next().map_or(rest.len(), char::len_utf8);
            }
            let (head, tail) = rest.split_at(end);
            parts.push(head.to_string());
            rest = tail;
        }

        let total_chunks = u32::try_from(parts.len())
            .map_err(|_| WatchdogError::chunk("request needs too many chunks"))?;
        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(sequence_id, payload)| {
                let mut request = Self::chunk(ChunkedPayload {
                    payload_id,
                    total_chunks,
                    sequence_id: sequence_id as u32,
                    payload,
                });
                request.access_identifier = self.access_identifier.clone();
                request
            })
            .collect())
    }
}

/// Response returned to the worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    /// Port the worker should use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_port: Option<u16>,
    /// Startup bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_information: Option<RuntimeInformation>,
    /// Chunk sequence ids still missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<u32>>,
    /// Error description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BridgeResponse {
    /// Plain success
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    /// Error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Response carrying the port to use
    #[must_use]
    pub fn port(port: u16) -> Self {
        Self {
            new_port: Some(port),
            ..Self::default()
        }
    }

    /// Response listing chunks still needed
    #[must_use]
    pub fn missing(sequence_ids: Vec<u32>) -> Self {
        Self {
            missing_chunks: Some(sequence_ids),
            ..Self::default()
        }
    }

    /// Response carrying the startup bundle
    #[must_use]
    pub fn runtime(info: RuntimeInformation) -> Self {
        Self {
            runtime_information: Some(info),
            ..Self::default()
        }
    }

    /// Whether this is an error response
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}
