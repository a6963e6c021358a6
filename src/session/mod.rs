//! Worker process sessions
//!
//! - [`controller`] - Launching and reattaching processes
//! - [`game_session`] - Handle to one running process
//! - [`command`] - Engine command line
//! - [`process`] - Signals and liveness probes
//! - [`worker_client`] - Requests from the watchdog to the worker

pub mod command;
pub mod controller;
pub mod game_session;
pub mod process;
pub mod worker_client;

pub use command::{CommandBuilder, find_engine};
pub use controller::{ProcessSessionController, SessionController};
pub use game_session::{ExitSender, GameSession, SessionExit};
pub use process::{OsProcess, ProcessControl, ProcessSignal, pid_is_alive, port_is_free};
pub use worker_client::{TcpWorkerClient, WorkerClient, WorkerCommand};
