//! Core of a yamux stream multiplexer
//!
//! Turns one reliable ordered byte stream into many independent,
//! flow-controlled logical streams. The [`Session`] owns the transport
//! and the stream table, [`StreamHandle`] is the per-stream byte pipe
//! exposed to the application, and [`Control`] is a cloneable handle for
//! opening streams and pinging the peer from outside the session task.
//!
//! Frame layout and flow-control rules follow the yamux wire contract:
//! a 12-byte big-endian header followed by an optional payload, with
//! per-stream credit windows replenished by window update frames.

#![deny(missing_docs)]

// Config module
pub mod config;
// Error module
pub mod error;
// Frame module
pub mod frame;
// Flow control windows
mod flow;
// Session module
pub mod session;
// Stream module
mod control;
pub mod stream;

// Stream ID type
pub(crate) type StreamId = u32;

pub use crate::{
    config::Config, control::Control, error::Error, session::Session, stream::StreamHandle,
};

// Latest Protocol Version
pub(crate) const PROTOCOL_VERSION: u8 = 0;
// The 0 ID is reserved to represent the session.
pub(crate) const RESERVED_STREAM_ID: StreamId = 0;
// The header is 12 bytes
pub(crate) const HEADER_SIZE: usize = 12;

/// Protocol identifier for negotiation layers that multiplex by name
pub const PROTOCOL_ID: &str = "/yamux/1.0.0";
