//! Connection I/O state machine and context lifecycle built on top of
//! `pomp-core`'s wire format and `pomp-loop`'s event loop.

mod addr_sys;
pub mod connection;
pub mod context;

pub use connection::{Connection, Keepalive, PeerCred, QueueOutcome, ReadOutcome, DEFAULT_READ_SIZE};
pub use context::{Context, ContextConfig, CtxEvent, SendStatus, MAX_CONN};
