//! Bridge interop protocol between the worker and the watchdog

pub mod chunking;
pub mod dispatcher;
pub mod messages;
pub mod server;

pub use chunking::{ChunkOutcome, ChunkReassembler, MAX_TOTAL_CHUNKS};
pub use dispatcher::{BridgeDispatcher, BridgeHandler, BridgeRegistration};
pub use messages::{BridgeCommandType, BridgeRequest, BridgeResponse, ChunkedPayload};
pub use server::BridgeServer;
