//! Process the frame

use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    config::INITIAL_STREAM_WINDOW, error::Error, StreamId, HEADER_SIZE, PROTOCOL_VERSION,
    RESERVED_STREAM_ID,
};

/// The base message type is frame
#[derive(Debug, Eq, PartialEq)]
pub struct Frame {
    header: Header,
    body: Option<Bytes>,
}

impl Frame {
    /// Create a data frame
    pub fn new_data(flags: Flags, stream_id: StreamId, body: Bytes) -> Frame {
        Frame {
            header: Header {
                version: PROTOCOL_VERSION,
                ty: Type::Data,
                flags,
                stream_id,
                length: body.len() as u32,
            },
            body: Some(body),
        }
    }

    /// Create a window update frame
    pub fn new_window_update(flags: Flags, stream_id: StreamId, delta: u32) -> Frame {
        Frame {
            header: Header {
                version: PROTOCOL_VERSION,
                ty: Type::WindowUpdate,
                flags,
                stream_id,
                length: delta,
            },
            body: None,
        }
    }

    /// Create a ping frame
    pub fn new_ping(flags: Flags, ping_id: u32) -> Frame {
        Frame {
            header: Header {
                version: PROTOCOL_VERSION,
                ty: Type::Ping,
                flags,
                stream_id: RESERVED_STREAM_ID,
                length: ping_id,
            },
            body: None,
        }
    }

    /// Create a go away frame
    pub fn new_go_away(reason: GoAwayCode) -> Frame {
        Frame {
            header: Header {
                version: PROTOCOL_VERSION,
                ty: Type::GoAway,
                flags: Flags::default(),
                stream_id: RESERVED_STREAM_ID,
                length: reason as u32,
            },
            body: None,
        }
    }

    /// The type of current frame
    pub fn ty(&self) -> Type {
        self.header.ty
    }

    /// The stream id of current frame
    pub fn stream_id(&self) -> StreamId {
        self.header.stream_id
    }

    /// The flags of current frame
    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    /// The length field of current body or some other things such as ping_id/go away code/delta
    pub fn length(&self) -> u32 {
        self.header.length
    }

    /// Consume current frame split into header and body
    pub fn into_parts(self) -> (Header, Option<Bytes>) {
        (self.header, self.body)
    }

    /// The wire size of current frame
    pub fn size(&self) -> usize {
        if self.body.is_some() {
            self.header.length as usize + HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Materialize the ordered list of logical messages this frame carries.
    ///
    /// One frame may open, carry data on, and close a stream all at once
    /// (SYN|FIN with a body); consumers process the resulting messages in
    /// the canonical rank order SYN, ACK, Data, WindowUpdate, Ping, FIN,
    /// RST, GoAway.
    pub fn into_messages(self) -> Vec<Message> {
        let Frame { header, body } = self;
        let id = header.stream_id;
        let flags = header.flags;
        let mut messages = Vec::with_capacity(2);
        match header.ty {
            Type::Data | Type::WindowUpdate => {
                if flags.contains(Flag::Syn) {
                    messages.push(Message::ChannelOpen(id));
                }
                if flags.contains(Flag::Ack) {
                    messages.push(Message::ChannelOpenAck(id));
                }
                if header.ty == Type::Data {
                    match body {
                        Some(data) if !data.is_empty() => {
                            messages.push(Message::ChannelData(id, data))
                        }
                        _ => (),
                    }
                } else if header.length > 0 {
                    messages.push(Message::ChannelWindowAdjust(id, header.length));
                }
                if flags.contains(Flag::Fin) {
                    messages.push(Message::ChannelClose(id));
                }
                if flags.contains(Flag::Rst) {
                    messages.push(Message::ChannelReset(id));
                }
            }
            Type::Ping => {
                if flags.contains(Flag::Syn) {
                    messages.push(Message::SessionOpen);
                } else if flags.contains(Flag::Ack) && header.length == 0 {
                    messages.push(Message::SessionOpenAck);
                } else {
                    messages.push(Message::Ping {
                        ack: flags.contains(Flag::Ack),
                        id: header.length,
                    });
                }
            }
            Type::GoAway => messages.push(Message::GoAway(GoAwayCode::from(header.length))),
        }
        messages
    }
}

/// A logical event implied by one frame's type and flags
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    /// Session-level open announcement (ping with syn)
    SessionOpen,
    /// Acknowledgment of a session open (ping with ack, zero length)
    SessionOpenAck,
    /// Keep-alive / RTT probe, `ack` marks the response direction
    Ping {
        /// Response or request
        ack: bool,
        /// Opaque echo value
        id: u32,
    },
    /// Session termination announcement
    GoAway(GoAwayCode),
    /// A new stream opened by the peer
    ChannelOpen(StreamId),
    /// Acknowledgment of a stream we opened
    ChannelOpenAck(StreamId),
    /// Payload bytes for a stream
    ChannelData(StreamId, Bytes),
    /// Send-credit replenishment for a stream
    ChannelWindowAdjust(StreamId, u32),
    /// Half-close of a stream by the peer
    ChannelClose(StreamId),
    /// Abort of a stream by the peer
    ChannelReset(StreamId),
}

impl Message {
    /// Canonical processing rank of this message within one frame
    pub fn rank(&self) -> u8 {
        match self {
            Message::SessionOpen | Message::ChannelOpen(_) => 0,
            Message::SessionOpenAck | Message::ChannelOpenAck(_) => 1,
            Message::ChannelData(..) => 2,
            Message::ChannelWindowAdjust(..) => 3,
            Message::Ping { .. } => 4,
            Message::ChannelClose(_) => 5,
            Message::ChannelReset(_) => 6,
            Message::GoAway(_) => 7,
        }
    }

    /// The stream id this message belongs to, if it is channel-level
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Message::ChannelOpen(id)
            | Message::ChannelOpenAck(id)
            | Message::ChannelData(id, _)
            | Message::ChannelWindowAdjust(id, _)
            | Message::ChannelClose(id)
            | Message::ChannelReset(id) => Some(*id),
            _ => None,
        }
    }
}

/// The frame header
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    version: u8,
    ty: Type,
    flags: Flags,
    stream_id: StreamId,
    length: u32,
}

impl Header {
    fn validate(&self) -> Result<(), Error> {
        match self.ty {
            Type::Ping | Type::GoAway => {
                if self.stream_id != RESERVED_STREAM_ID {
                    return Err(Error::InvalidPacketFormat(
                        "ping/go away must use the session id",
                    ));
                }
            }
            Type::Data | Type::WindowUpdate => {
                if self.stream_id == RESERVED_STREAM_ID {
                    return Err(Error::InvalidPacketFormat(
                        "data/window update on the session id",
                    ));
                }
                if self.ty == Type::Data && self.length == 0 && self.flags.is_empty() {
                    return Err(Error::InvalidPacketFormat("empty data frame without flags"));
                }
            }
        }
        Ok(())
    }
}

/// The type field is used to switch the frame message type.
/// The following message types are supported:
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Type {
    /// Used to transmit data.
    /// May transmit zero length payloads depending on the flags.
    Data = 0x0,

    /// Used to updated the senders receive window size.
    /// This is used to implement per-session flow control.
    WindowUpdate = 0x1,

    /// Used to measure RTT.
    /// It can also be used to heart-beat and do keep-alives over TCP.
    Ping = 0x2,

    /// Used to close a session.
    GoAway = 0x3,
}

impl Type {
    pub(crate) fn try_from(value: u8) -> Option<Type> {
        match value {
            0x0 => Some(Type::Data),
            0x1 => Some(Type::WindowUpdate),
            0x2 => Some(Type::Ping),
            0x3 => Some(Type::GoAway),
            _ => None,
        }
    }
}

/// The frame flag
#[derive(Copy, Clone, Debug)]
#[repr(u16)]
pub enum Flag {
    /// SYN - Signals the start of a new stream.
    ///   May be sent with a data or window update message.
    ///   Also sent with a ping to announce a session open.
    Syn = 0x1,

    /// ACK - Acknowledges the start of a new stream.
    ///   May be sent with a data or window update message.
    ///   Also sent with a ping to indicate response.
    Ack = 0x2,

    /// FIN (finish) - Performs a half-close of a stream.
    ///   May be sent with a data message or window update.
    Fin = 0x4,

    /// RST - Reset a stream immediately.
    ///   May be sent with a data or window update message.
    Rst = 0x8,
}

impl From<Flag> for Flags {
    fn from(value: Flag) -> Flags {
        Flags(value as u16)
    }
}

/// Represent all flags of a frame
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Flags(u16);

impl Flags {
    /// Add a flag
    pub fn add(&mut self, flag: Flag) {
        self.0 |= flag as u16;
    }

    /// Remove a flag
    pub fn remove(&mut self, flag: Flag) {
        self.0 &= !(flag as u16);
    }

    /// Check if contains a target flag
    pub fn contains(self, flag: Flag) -> bool {
        let flag_value = flag as u16;
        (self.0 & flag_value) == flag_value
    }

    /// Check if no flag is set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The value of all flags
    pub fn value(self) -> u16 {
        self.0
    }
}

/// When a session is being terminated, the Go Away message should
/// be sent. The Length should be set to one of the following to
/// provide an error code:
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum GoAwayCode {
    /// Normal termination
    Normal = 0x0,
    /// Protocol error
    ProtocolError = 0x1,
    /// Internal error
    InternalError = 0x2,
}

impl From<u32> for GoAwayCode {
    fn from(value: u32) -> GoAwayCode {
        match value {
            0x0 => GoAwayCode::Normal,
            0x1 => GoAwayCode::ProtocolError,
            0x2 => GoAwayCode::InternalError,
            _ => GoAwayCode::ProtocolError,
        }
    }
}

/// The frame decoder/encoder
pub struct FrameCodec {
    // A parsed data header whose body has not fully arrived yet.
    // Kept across decode calls so the header is never re-parsed.
    unused_data_header: Option<Header>,
    max_frame_size: u32,
}

impl Default for FrameCodec {
    fn default() -> FrameCodec {
        FrameCodec {
            unused_data_header: None,
            max_frame_size: INITIAL_STREAM_WINDOW,
        }
    }
}

impl FrameCodec {
    /// Set the upper bound of a single data frame body
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.unused_data_header.take() {
            Some(header) => header,
            None if src.len() >= HEADER_SIZE => {
                let header_data = src.split_to(HEADER_SIZE);

                let version = header_data[0];
                if version != PROTOCOL_VERSION {
                    return Err(Error::UnsupportedVersion(version).into());
                }
                let ty_value = header_data[1];
                let ty = match Type::try_from(ty_value) {
                    Some(ty) => ty,
                    None => {
                        return Err(Error::InvalidPacketFormat("unknown frame type").into());
                    }
                };

                let flags = Flags(BigEndian::read_u16(&header_data[2..4]));
                let stream_id = BigEndian::read_u32(&header_data[4..8]);
                let length = BigEndian::read_u32(&header_data[8..12]);
                let header = Header {
                    version,
                    ty,
                    flags,
                    stream_id,
                    length,
                };
                header.validate().map_err(io::Error::from)?;
                if ty == Type::Data && length > self.max_frame_size {
                    return Err(Error::InvalidPacketFormat("oversized data frame").into());
                }
                header
            }
            None => {
                trace!("not enough data for decode header");
                return Ok(None);
            }
        };

        let body = if header.ty == Type::Data {
            if src.len() < header.length as usize {
                trace!("not enough data for decode body");
                self.unused_data_header = Some(header);
                return Ok(None);
            } else {
                Some(src.split_to(header.length as usize).freeze())
            }
        } else {
            // Not data frame
            None
        };

        Ok(Some(Frame { header, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Must ensure that there is enough space in the buf
        dst.reserve(item.size());
        let (header, body) = item.into_parts();
        dst.put_u8(header.version);
        dst.put_u8(header.ty as u8);
        dst.put_u16(header.flags.value());
        dst.put_u32(header.stream_id);
        dst.put_u32(header.length);
        if let Some(data) = body {
            dst.put(data);
        }
        trace!("encode item: length={}", dst.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Flag, Flags, Frame, FrameCodec, GoAwayCode, Message, Type};
    use bytes::{Bytes, BytesMut};
    use std::io;
    use tokio_util::codec::{Decoder, Encoder};

    fn decode_all(data: &[u8]) -> Result<Option<Frame>, io::Error> {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(data);
        codec.decode(&mut buf)
    }

    #[test]
    fn test_header_round_trip() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::new_window_update(Flags::from(Flag::Syn), 3, 1024);
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(buf.len(), 12);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded.ty(), Type::WindowUpdate);
        assert_eq!(decoded.stream_id(), 3);
        assert_eq!(decoded.length(), 1024);
        assert!(decoded.flags().contains(Flag::Syn));
    }

    #[test]
    fn test_data_frame_round_trip() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::new_data(Flags::default(), 1, Bytes::from_static(b"Hello World!"));
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(buf.len(), 12 + 12);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        let (header, body) = decoded.into_parts();
        assert_eq!(header, {
            let (header, _) =
                Frame::new_data(Flags::default(), 1, Bytes::from_static(b"Hello World!"))
                    .into_parts();
            header
        });
        assert_eq!(body.unwrap(), Bytes::from_static(b"Hello World!"));
    }

    #[test]
    fn test_flag_subsets_preserved() {
        for bits in 0..16u16 {
            let mut flags = Flags::default();
            for flag in [Flag::Syn, Flag::Ack, Flag::Fin, Flag::Rst] {
                if bits & (flag as u16) != 0 {
                    flags.add(flag);
                }
            }
            let mut codec = FrameCodec::default();
            let mut buf = BytesMut::new();
            codec
                .encode(Frame::new_window_update(flags, 7, 0), &mut buf)
                .unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.flags().value(), bits);
        }
    }

    #[test]
    fn test_flags_remove() {
        let mut flags = Flags::from(Flag::Syn);
        flags.add(Flag::Fin);
        flags.remove(Flag::Syn);
        assert!(!flags.contains(Flag::Syn));
        assert!(flags.contains(Flag::Fin));
        // Removing an absent flag must not toggle it back on
        flags.remove(Flag::Syn);
        assert!(!flags.contains(Flag::Syn));
    }

    #[test]
    fn test_decode_needs_more_data() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Nothing consumed while the header is short
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_decode_resumes_partial_body() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        // Data frame, stream 1, length 12, only 5 body bytes arrived
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 12]);
        buf.extend_from_slice(b"Hello");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // The header was consumed and parked, the partial body kept
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(b" World!");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.stream_id(), 1);
        let (_, body) = frame.into_parts();
        assert_eq!(body.unwrap(), Bytes::from_static(b"Hello World!"));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let err = decode_all(&[9, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_bad_type() {
        let err = decode_all(&[0, 4, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_ping_on_stream() {
        let err = decode_all(&[0, 2, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_data_on_session_id() {
        let err = decode_all(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_empty_data_without_flags() {
        let err = decode_all(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // With a syn flag the empty body is a plain open
        let frame = decode_all(&[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0])
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_messages(), vec![Message::ChannelOpen(1)]);
    }

    #[test]
    fn test_messages_open_data_close() {
        // SYN|FIN data frame carrying "Hello World!" on stream 1
        let mut flags = Flags::from(Flag::Syn);
        flags.add(Flag::Fin);
        let frame = Frame::new_data(flags, 1, Bytes::from_static(b"Hello World!"));
        let messages = frame.into_messages();
        assert_eq!(
            messages,
            vec![
                Message::ChannelOpen(1),
                Message::ChannelData(1, Bytes::from_static(b"Hello World!")),
                Message::ChannelClose(1),
            ]
        );
        assert!(messages.windows(2).all(|w| w[0].rank() <= w[1].rank()));
    }

    #[test]
    fn test_messages_session_level() {
        assert_eq!(
            Frame::new_ping(Flags::from(Flag::Syn), 0).into_messages(),
            vec![Message::SessionOpen]
        );
        assert_eq!(
            Frame::new_ping(Flags::from(Flag::Ack), 0).into_messages(),
            vec![Message::SessionOpenAck]
        );
        assert_eq!(
            Frame::new_ping(Flags::from(Flag::Ack), 1234).into_messages(),
            vec![Message::Ping {
                ack: true,
                id: 1234
            }]
        );
        assert_eq!(
            Frame::new_ping(Flags::default(), 42).into_messages(),
            vec![Message::Ping { ack: false, id: 42 }]
        );
        assert_eq!(
            Frame::new_go_away(GoAwayCode::Normal).into_messages(),
            vec![Message::GoAway(GoAwayCode::Normal)]
        );
    }

    #[test]
    fn test_go_away_code_from_u32() {
        assert_eq!(GoAwayCode::from(0), GoAwayCode::Normal);
        assert_eq!(GoAwayCode::from(1), GoAwayCode::ProtocolError);
        assert_eq!(GoAwayCode::from(2), GoAwayCode::InternalError);
        assert_eq!(GoAwayCode::from(77), GoAwayCode::ProtocolError);
    }
}
