#![recursion_limit = "256"]

//! # Worker Watchdog
//!
//! Supervision and interop core for a long-running game-server worker.
//! A [`Watchdog`] launches the worker, talks to it over a loopback bridge,
//! restarts it on crash or request, swaps compiled artifacts in and out,
//! and reattaches to a surviving process after the supervisor restarts.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use worker_watchdog::{
//!     ArtifactSlotManager, BridgeDispatcher, JsonFileReattachStore, NullCollaborator,
//!     ProcessSessionController, TcpWorkerClient, TokioJobManager, Watchdog, WatchdogConfig,
//!     WatchdogServices,
//! };
//!
//! # async fn example() -> worker_watchdog::Result<()> {
//! let config = Arc::new(WatchdogConfig::from_file("watchdog.json").await?);
//! let cancel = CancellationToken::new();
//! let dispatcher = BridgeDispatcher::new();
//! let client = Arc::new(TcpWorkerClient);
//! let store = Arc::new(JsonFileReattachStore::new(&config.reattach_file));
//!
//! let services = WatchdogServices {
//!     controller: Arc::new(ProcessSessionController::new(
//!         Arc::clone(&config),
//!         dispatcher.clone(),
//!         client.clone(),
//!         store.clone(),
//!     )),
//!     worker_client: client,
//!     reattach_store: store,
//!     slots: ArtifactSlotManager::new(),
//!     events: Arc::new(NullCollaborator),
//!     chat: Arc::new(NullCollaborator),
//!     jobs: Arc::new(TokioJobManager::new(cancel.child_token())),
//! };
//!
//! let watchdog = Watchdog::new(config, services);
//! watchdog.launch(&cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`watchdog`] - The state machine: launch, supervision, restarts, termination
//! - [`session`] - Worker processes: spawning, reattaching, signals, liveness
//! - [`bridge`] - The worker-to-watchdog request protocol, chunking, TCP server
//! - [`artifacts`] - Active/staged compiled artifacts and lock tracking
//! - [`reattach`] - Persistence of the record needed to resume a process
//! - [`events`] / [`jobs`] - Event, chat and background-job collaborators
//!
//! ## Logging
//!
//! Everything logs through the [`log`] facade; the binary installs
//! `env_logger`. Worker stdout and stderr are forwarded at debug level under
//! the `worker` target.

#![warn(clippy::all)]

pub mod artifacts;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod reattach;
pub mod session;
pub mod types;
pub mod watchdog;

// Re-export commonly used types for external API
pub use artifacts::{
    ArtifactCleanup, ArtifactLease, ArtifactMetadata, ArtifactSlotManager, CompiledArtifact,
    DirectoryCleanup, NoopCleanup, PromotionEvent, PromotionOutcome,
};
pub use bridge::{
    BridgeCommandType, BridgeDispatcher, BridgeHandler, BridgeRegistration, BridgeRequest,
    BridgeResponse, BridgeServer, ChunkReassembler, ChunkedPayload,
};
pub use config::{WatchdogConfig, WatchdogConfigBuilder};
pub use error::{Result, WatchdogError};
pub use events::{ChatRelay, EventConsumer, EventType, NullCollaborator};
pub use jobs::{JobContext, JobHandle, JobManager, JobState, TokioJobManager};
pub use reattach::{JsonFileReattachStore, MemoryReattachStore, ReattachStore};
pub use session::{
    GameSession, ProcessSessionController, SessionController, TcpWorkerClient, WorkerClient,
};
pub use watchdog::{BackoffPolicy, CrashTracker, Watchdog, WatchdogServices};

// Re-export type submodules for flat public API
pub use types::identifiers::{AccessKey, ArtifactId};
pub use types::launch::{LaunchParameters, SecurityLevel, VisibilityFlags};
pub use types::reattach::{INTEROP_API_VERSION, ReattachInformation};
pub use types::runtime::{ChatChannel, ChatMessage, RuntimeInformation, TestMerge};
pub use types::status::WatchdogStatus;

/// Version of the watchdog, reported to the worker at startup
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
