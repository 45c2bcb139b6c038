//! Inter-process communication for jobhub
//!
//! This crate provides the wire protocol spoken between the hub and each
//! worker process, and newline-delimited JSON framing over any async byte
//! stream (child stdio, process stdio, in-memory duplex pipes).

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    parse_reported_error, HubMessage, MessageEnvelope, RuntimeOptions, WorkerMessage,
    IPC_PROTOCOL_VERSION,
};
pub use transport::{stdio, FrameReader, FrameWriter};
