//! The watchdog state machine
//!
//! One [`Watchdog`] supervises one worker. State transitions are serialized
//! behind an internal lock; bridge calls only touch small fields next to it
//! and never wait on the supervision loop.
//!
//! This module is organized into logical submodules:
//! - `core`: State, constructor, and administrative operations
//! - `launch`: Launching and the supervision loop
//! - `terminate`: Stopping the worker
//! - `bridge_handler`: Bridge commands against the current session
//! - `deployment`: Promotion of staged artifacts
//! - [`policy`]: Backoff and crash policies

// Module declarations
mod bridge_handler;
mod core;
mod deployment;
mod launch;
pub mod policy;
mod terminate;

// Re-export public API
pub use self::core::{Watchdog, WatchdogServices};
pub use policy::{BackoffPolicy, CrashTracker};
