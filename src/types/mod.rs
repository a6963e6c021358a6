//! Type definitions shared across the watchdog
//!
//! - [`identifiers`] - Type-safe ID wrappers (`AccessKey`, `ArtifactId`)
//! - [`launch`] - Launch parameters, security level, visibility flags
//! - [`reattach`] - Persisted reattach record
//! - [`runtime`] - Startup runtime bundle and chat payloads
//! - [`status`] - Watchdog status and transition table

pub mod identifiers;
pub mod launch;
pub mod reattach;
pub mod runtime;
pub mod status;

pub use identifiers::{AccessKey, ArtifactId};
pub use launch::{LaunchParameters, SecurityLevel, VisibilityFlags};
pub use reattach::{INTEROP_API_VERSION, ReattachInformation};
pub use runtime::{ChatChannel, ChatMessage, RuntimeInformation, TestMerge};
pub use status::WatchdogStatus;
