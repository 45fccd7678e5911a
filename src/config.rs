//! Configuration of session and stream

use std::time::Duration;

/// Both sides assume the initial 256KB window size
pub const INITIAL_STREAM_WINDOW: u32 = 256 * 1024;
/// Default maximum data payload carried by one frame
pub const DEFAULT_MAX_FRAME_PAYLOAD: u32 = 64 * 1024;
/// Default value for accept_backlog
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;
/// Default max stream count
pub const DEFAULT_MAX_STREAM_COUNT: usize = 65535;
/// Default keepalive interval duration
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration of session and stream
#[derive(Clone, Copy)]
pub struct Config {
    /// InitialStreamWindow is the receive window every new stream
    /// starts with, and the credit we grant the peer on open.
    /// Must be greater than or equal to 256 * 1024
    pub initial_stream_window: u32,

    /// MaxFramePayload bounds the payload of a single data frame.
    /// Logical writes larger than this are split across frames.
    pub max_frame_payload: u32,

    /// AcceptBacklog is used to limit how many inbound streams may be
    /// waiting an accept. Streams beyond the backlog are refused with RST.
    pub accept_backlog: usize,

    /// Max count of live streams, both directions combined. Inbound
    /// opens beyond it are refused with RST, local opens fail.
    pub max_stream_count: usize,

    /// PingInterval, if set, sends a keep-alive ping on that period.
    /// A ping unanswered for 30s fails the session.
    pub ping_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            initial_stream_window: INITIAL_STREAM_WINDOW,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            max_stream_count: DEFAULT_MAX_STREAM_COUNT,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
        }
    }
}
