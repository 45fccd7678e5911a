//! The error types

use std::io;

use thiserror::Error;

use crate::StreamId;

/// The error types
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// InvalidPacketFormat means we received a header that fails
    /// the wire validity rules
    #[error("invalid packet format: {0}")]
    InvalidPacketFormat(&'static str),

    /// UnsupportedVersion means the peer sent a frame with a
    /// version other than 0
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// ProtocolViolation means the peer broke a state machine or
    /// routing rule
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// FlowControlViolation means the peer sent more data than its
    /// credit allows, or a window increment overflowed
    #[error("flow control violation")]
    FlowControlViolation,

    /// ChannelSetupRejected is used if a stream open was refused,
    /// locally or by the remote
    #[error("stream setup rejected")]
    ChannelSetupRejected,

    /// StreamsExhausted is returned if we have no more
    /// stream ids to issue
    #[error("no more stream ids to issue")]
    StreamsExhausted,

    /// StreamNotWritable is returned when writing to a half-closed,
    /// closed or reset stream
    #[error("stream is not writable")]
    StreamNotWritable,

    /// TransportShutdown is used when the underlying transport ended
    #[error("transport shutdown")]
    TransportShutdown,

    /// UnknownStream is used for a frame carrying a stream id we never
    /// allocated while the peer lacked syn authority
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// SessionShutdown is used if there is a shutdown during
    /// an operation
    #[error("session shutdown")]
    SessionShutdown,

    /// RemoteGoAway is used when we get a go away from the other side
    #[error("go away message from the other side")]
    RemoteGoAway,

    /// Timeout is used when we reach an IO deadline
    #[error("reach an io deadline")]
    Timeout,

    /// Sub stream send event channel full, block to complete
    #[error("sub stream send channel full")]
    WouldBlock,
}

impl Error {
    /// Whether this error must tear the whole session down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidPacketFormat(_)
                | Error::UnsupportedVersion(_)
                | Error::ProtocolViolation(_)
                | Error::FlowControlViolation
                | Error::UnknownStream(_)
        )
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::InvalidPacketFormat(_)
            | Error::UnsupportedVersion(_)
            | Error::ProtocolViolation(_)
            | Error::FlowControlViolation
            | Error::UnknownStream(_) => io::ErrorKind::InvalidData,
            Error::StreamNotWritable | Error::SessionShutdown | Error::RemoteGoAway => {
                io::ErrorKind::BrokenPipe
            }
            Error::TransportShutdown => io::ErrorKind::UnexpectedEof,
            Error::ChannelSetupRejected => io::ErrorKind::ConnectionRefused,
            Error::StreamsExhausted => io::ErrorKind::Other,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::WouldBlock => io::ErrorKind::WouldBlock,
        };
        io::Error::new(kind, err)
    }
}
