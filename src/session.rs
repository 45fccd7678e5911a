//! The session, can open and manage substreams

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::{
    channel::{
        mpsc::{channel, Receiver, Sender},
        oneshot,
    },
    Sink, Stream,
};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{
    config::Config,
    control::{Command, Control},
    error::Error,
    frame::{Flag, Flags, Frame, FrameCodec, GoAwayCode, Message},
    stream::{StreamEvent, StreamHandle, StreamState},
    StreamId,
};

const BUF_SHRINK_THRESHOLD: usize = u8::MAX as usize;
const DELAY_TIME: Duration = Duration::from_millis(300);
const TIMEOUT: Duration = Duration::from_secs(30);

/// The session
pub struct Session<T> {
    // Framed low level raw stream
    framed_stream: Framed<T, FrameCodec>,

    // Got EOF from low level raw stream
    eof: bool,

    state: SessionState,

    // nextStreamID is the next stream we should
    // send. This depends if we are a initiator/listener.
    next_stream_id: StreamId,
    ty: SessionType,

    // config holds our configuration
    config: Config,

    // pings is used to track inflight pings
    pings: BTreeMap<u32, PingRecord>,
    ping_id: u32,
    keepalive: Option<tokio::time::Interval>,

    // streams maps a stream id to a sender of messages
    streams: HashMap<StreamId, Sender<Message>>,
    // inflight has an entry for any outgoing stream that has not yet been established
    inflight: HashSet<StreamId>,
    // Control opens parked until the peer acknowledges or resets
    pending_open: HashMap<StreamId, PendingOpen>,
    // Half-close bookkeeping derived from the frames the session routes
    local_fin: HashSet<StreamId>,
    remote_fin: HashSet<StreamId>,
    // Ids torn down locally whose trailing frames are dropped until the
    // peer's own fin/rst is observed
    errored_ids: HashSet<StreamId>,
    // The StreamHandle not yet been polled
    pending_streams: VecDeque<StreamHandle>,
    // The buffer which will send to underlying network
    write_pending_frames: VecDeque<Frame>,
    // The buffer which will distribute to sub streams
    read_pending_messages: VecDeque<Message>,

    // For receive events from sub streams (for clone to new stream)
    event_sender: Sender<StreamEvent>,
    // For receive events from sub streams
    event_receiver: Receiver<StreamEvent>,

    // Commands issued through a Control handle
    control_sender: Sender<Command>,
    control_receiver: Receiver<Command>,

    /// Delay notify with abnormally poor network status
    delay: Arc<AtomicBool>,
    /// Last successful send time
    last_send_success: Instant,
}

struct PendingOpen {
    handle: StreamHandle,
    reply: oneshot::Sender<Result<StreamHandle, Error>>,
}

struct PingRecord {
    sent_at: Instant,
    reply: Option<oneshot::Sender<Result<Duration, Error>>>,
}

/// Session type, initiator or listener
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SessionType {
    /// The session dialed the underlying connection, uses odd stream ids
    Initiator,
    /// The session accepted the underlying connection, uses even stream ids
    Listener,
}

impl SessionType {
    /// If this is an initiator type
    pub fn is_initiator(self) -> bool {
        self == SessionType::Initiator
    }

    /// If this is a listener type (typical low level stream is an accepted TcpStream)
    pub fn is_listener(self) -> bool {
        self == SessionType::Listener
    }

    // A peer-opened stream id must carry the parity of the peer's role
    fn peer_syn_valid(self, stream_id: StreamId) -> bool {
        match self {
            SessionType::Initiator => stream_id % 2 == 0,
            SessionType::Listener => stream_id % 2 == 1,
        }
    }
}

/// The session lifecycle
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    /// Nothing announced yet
    Idle,
    /// The session open exchange happened
    Open,
    /// We sent a go away, no new streams, existing ones may drain
    GoAwaySent,
    /// The peer sent a go away, everything is torn down
    GoAwayReceived,
    /// The transport is gone
    Closed,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new session from a low level stream
    pub fn new(raw_stream: T, config: Config, ty: SessionType) -> Session<T> {
        let next_stream_id = match ty {
            SessionType::Initiator => 1,
            SessionType::Listener => 2,
        };
        let (event_sender, event_receiver) = channel(32);
        let (control_sender, control_receiver) = channel(32);
        let framed_stream = Framed::new(
            raw_stream,
            FrameCodec::default().max_frame_size(config.initial_stream_window),
        );

        let mut session = Session {
            framed_stream,
            eof: false,
            state: SessionState::Idle,
            next_stream_id,
            ty,
            config,
            pings: BTreeMap::default(),
            ping_id: 0,
            keepalive: None,
            streams: HashMap::default(),
            inflight: HashSet::default(),
            pending_open: HashMap::default(),
            local_fin: HashSet::default(),
            remote_fin: HashSet::default(),
            errored_ids: HashSet::default(),
            pending_streams: VecDeque::default(),
            write_pending_frames: VecDeque::default(),
            read_pending_messages: VecDeque::default(),
            event_sender,
            event_receiver,
            control_sender,
            control_receiver,
            delay: Arc::new(AtomicBool::new(false)),
            last_send_success: Instant::now(),
        };
        if ty.is_listener() {
            // The listener announces the session on attach
            session
                .write_pending_frames
                .push_back(Frame::new_ping(Flags::from(Flag::Syn), 0));
            session.state = SessionState::Open;
        }
        session
    }

    /// Create a listener session (typical raw_stream is an accepted TcpStream)
    pub fn new_listener(raw_stream: T, config: Config) -> Session<T> {
        Self::new(raw_stream, config, SessionType::Listener)
    }

    /// Create an initiator session
    pub fn new_initiator(raw_stream: T, config: Config) -> Session<T> {
        Self::new(raw_stream, config, SessionType::Initiator)
    }

    /// The current session lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Create a control handle to this session
    pub fn control(&self) -> Control {
        Control::new(self.control_sender.clone())
    }

    /// shutdown is used to quiesce the session: no new streams are
    /// accepted or opened, a GoAway is announced, existing streams drain.
    pub fn shutdown(&mut self, cx: &mut Context) -> Result<(), Error> {
        if self.is_dead() || self.state == SessionState::GoAwaySent {
            return Ok(());
        }

        // Ignore frames remaining in pending queue
        self.write_pending_frames.clear();
        self.state = SessionState::GoAwaySent;
        self.send_frame(cx, Frame::new_go_away(GoAwayCode::Normal))
    }

    // Send all pending frames to remote streams
    fn flush(&mut self, cx: &mut Context) -> Result<(), Error> {
        self.recv_events(cx)?;
        self.send_all(cx)?;
        self.distribute_messages(cx)?;
        Ok(())
    }

    fn is_dead(&self) -> bool {
        matches!(
            self.state,
            SessionState::Closed | SessionState::GoAwayReceived
        ) || self.eof
    }

    /// Open a new stream to remote session.
    ///
    /// The syn goes out with the session's next flush; the handle is
    /// usable right away and establishes once the peer acknowledges.
    pub fn open_stream(&mut self) -> Result<StreamHandle, Error> {
        if self.is_dead() {
            Err(Error::SessionShutdown)
        } else if self.state == SessionState::GoAwaySent
            || self.streams.len() >= self.config.max_stream_count
        {
            Err(Error::ChannelSetupRejected)
        } else {
            let stream = self.create_stream(None)?;
            Ok(stream)
        }
    }

    fn create_stream(&mut self, stream_id: Option<StreamId>) -> Result<StreamHandle, Error> {
        let (stream_id, state) = match stream_id {
            // The syn was validated by the caller, the ack goes out below
            Some(stream_id) => (stream_id, StreamState::Established),
            None => {
                let next_id = self.next_stream_id;
                self.next_stream_id = self
                    .next_stream_id
                    .checked_add(2)
                    .ok_or(Error::StreamsExhausted)?;
                (next_id, StreamState::SynSent)
            }
        };
        let (message_sender, message_receiver) = channel(8);
        self.streams.insert(stream_id, message_sender);
        let stream = StreamHandle::new(
            stream_id,
            self.event_sender.clone(),
            message_receiver,
            state,
            self.config.initial_stream_window,
            self.config.initial_stream_window,
            self.config.max_frame_payload,
        );
        let open_frame = match state {
            StreamState::SynSent => {
                self.inflight.insert(stream_id);
                Frame::new_window_update(Flags::from(Flag::Syn), stream_id, 0)
            }
            _ => Frame::new_window_update(Flags::from(Flag::Ack), stream_id, 0),
        };
        self.write_pending_frames.push_back(open_frame);
        Ok(stream)
    }

    fn send_ping(
        &mut self,
        cx: &mut Context,
        reply: Option<oneshot::Sender<Result<Duration, Error>>>,
    ) -> Result<(), Error> {
        // Id 0 is reserved for the session open exchange
        self.ping_id = self.ping_id.checked_add(1).unwrap_or(1);
        let ping_id = self.ping_id;
        debug!("[{:?}] sent ping (id={})", self.ty, ping_id);
        self.pings.insert(
            ping_id,
            PingRecord {
                sent_at: Instant::now(),
                reply,
            },
        );
        let frame = Frame::new_ping(Flags::default(), ping_id);
        self.send_frame(cx, frame)
    }

    fn keep_alive(&mut self, cx: &mut Context) -> Result<(), Error> {
        // If the remote peer does not follow the protocol, doesn't answer
        // the ping message, the connection is considered broken.
        if self
            .pings
            .values()
            .any(|record| record.sent_at.elapsed() > TIMEOUT)
        {
            return Err(Error::Timeout);
        }
        self.send_ping(cx, None)
    }

    /// Sink `start_send` Ready -> data in buffer or send
    /// Sink `start_send` NotReady -> buffer full need poll complete
    #[inline]
    fn send_all(&mut self, cx: &mut Context) -> Result<bool, Error> {
        while let Some(frame) = self.write_pending_frames.pop_front() {
            if self.is_dead() {
                break;
            }

            let mut sink = Pin::new(&mut self.framed_stream);

            match sink.as_mut().poll_ready(cx).map_err(map_io_error)? {
                Poll::Ready(()) => {
                    sink.as_mut().start_send(frame).map_err(map_io_error)?;
                    self.last_send_success = Instant::now();
                }
                Poll::Pending => {
                    debug!("[{:?}] framed_stream NotReady, frame: {:?}", self.ty, frame);
                    self.write_pending_frames.push_front(frame);
                    // No frame has left for too long, the connection is
                    // no longer considered valid
                    if self.last_send_success.elapsed() > TIMEOUT {
                        return Err(Error::Timeout);
                    }

                    if self.poll_complete(cx)? {
                        return Ok(true);
                    }
                }
            }
        }
        self.poll_complete(cx)?;
        if self.write_pending_frames.capacity() > BUF_SHRINK_THRESHOLD {
            self.write_pending_frames.shrink_to_fit();
        }
        Ok(false)
    }

    /// Must use poll complete to ensure data send to lower-level
    ///
    /// Sink `poll_flush` Ready -> no buffer remain, flush all
    /// Sink `poll_flush` NotReady -> there is more work left to do, may wake up next poll
    fn poll_complete(&mut self, cx: &mut Context) -> Result<bool, Error> {
        match Pin::new(&mut self.framed_stream).poll_flush(cx) {
            Poll::Pending => {
                self.set_delay(cx);
                Ok(true)
            }
            Poll::Ready(res) => {
                res.map_err(map_io_error)?;
                Ok(false)
            }
        }
    }

    fn send_frame(&mut self, cx: &mut Context, frame: Frame) -> Result<(), Error> {
        self.write_pending_frames.push_back(frame);
        self.send_all(cx)?;
        Ok(())
    }

    fn handle_frame(&mut self, cx: &mut Context, frame: Frame) -> Result<(), Error> {
        debug!("[{:?}] Session::handle_frame({:?})", self.ty, frame.ty());
        self.read_pending_messages.extend(frame.into_messages());
        self.distribute_messages(cx)?;
        Ok(())
    }

    /// Try to route buffered messages to the session handler or sub streams
    fn distribute_messages(&mut self, cx: &mut Context) -> Result<(), Error> {
        let mut blocked_streams = HashSet::new();

        for message in self.read_pending_messages.split_off(0) {
            if self.is_dead() {
                // A go away tore the stream table down mid-batch
                self.read_pending_messages.clear();
                return Ok(());
            }
            let stream_id = match message.stream_id() {
                Some(stream_id) => stream_id,
                None => {
                    self.handle_session_message(cx, message)?;
                    continue;
                }
            };
            // Guarantee the order in which messages are delivered
            if blocked_streams.contains(&stream_id) {
                self.read_pending_messages.push_back(message);
                continue;
            }
            if let Message::ChannelOpen(_) = message {
                self.handle_channel_open(cx, stream_id)?;
                continue;
            }
            if !self.streams.contains_key(&stream_id) {
                if self.errored_ids.contains(&stream_id) {
                    // Trailing frame of a torn down stream; the peer's own
                    // fin/rst releases the id
                    if matches!(
                        message,
                        Message::ChannelClose(_) | Message::ChannelReset(_)
                    ) {
                        self.errored_ids.remove(&stream_id);
                    }
                    continue;
                }
                return Err(Error::UnknownStream(stream_id));
            }

            let is_ack = matches!(message, Message::ChannelOpenAck(_));
            let is_close = matches!(message, Message::ChannelClose(_));
            let is_reset = matches!(message, Message::ChannelReset(_));

            let outcome = {
                let message_sender = self.streams.get_mut(&stream_id).expect("checked above");
                match message_sender.try_send(message) {
                    Ok(_) => RouteOutcome::Delivered,
                    Err(err) => {
                        if err.is_full() {
                            self.read_pending_messages.push_back(err.into_inner());
                            RouteOutcome::Blocked
                        } else {
                            debug!("send to stream {} error: {:?}", stream_id, err);
                            RouteOutcome::Disconnected
                        }
                    }
                }
            };
            match outcome {
                RouteOutcome::Delivered => {
                    if is_reset {
                        // The peer's reset is its final word on this id
                        self.teardown_stream(stream_id, false);
                        continue;
                    }
                    if is_ack {
                        self.inflight.remove(&stream_id);
                    }
                    if is_close {
                        self.remote_fin.insert(stream_id);
                    }
                    self.post_route(cx, stream_id)?;
                }
                RouteOutcome::Blocked => {
                    self.set_delay(cx);
                    blocked_streams.insert(stream_id);
                }
                RouteOutcome::Disconnected => {
                    // The handle was dropped without a close, reset the stream
                    self.send_frame(
                        cx,
                        Frame::new_window_update(Flags::from(Flag::Rst), stream_id, 0),
                    )?;
                    self.teardown_stream(stream_id, true);
                }
            }
        }

        if self.read_pending_messages.capacity() > BUF_SHRINK_THRESHOLD {
            self.read_pending_messages.shrink_to_fit();
        }

        Ok(())
    }

    // Lifecycle consequences of a message that was routed to a live stream
    fn post_route(&mut self, cx: &mut Context, stream_id: StreamId) -> Result<(), Error> {
        if self.remote_fin.contains(&stream_id) && self.local_fin.contains(&stream_id) {
            // Both sides half-closed, the stream completed normally
            self.finish_stream(stream_id);
            return Ok(());
        }
        if let Some(pending) = self.pending_open.remove(&stream_id) {
            if !self.inflight.contains(&stream_id) {
                // Acknowledged: hand the parked handle to the caller
                if let Err(handle) = pending.reply.send(Ok(pending.handle)) {
                    // The open was cancelled, reset immediately
                    drop(handle);
                    debug!("[{:?}] open of stream {} cancelled", self.ty, stream_id);
                    self.send_frame(
                        cx,
                        Frame::new_window_update(Flags::from(Flag::Rst), stream_id, 0),
                    )?;
                    self.teardown_stream(stream_id, true);
                }
            } else {
                self.pending_open.insert(stream_id, pending);
            }
        }
        Ok(())
    }

    fn handle_channel_open(&mut self, cx: &mut Context, stream_id: StreamId) -> Result<(), Error> {
        if self.errored_ids.contains(&stream_id) {
            return Ok(());
        }
        if !self.ty.peer_syn_valid(stream_id) {
            // The peer used our own id space, the contract is broken
            return Err(Error::ProtocolViolation("stream id parity mismatch"));
        }
        if self.streams.contains_key(&stream_id) {
            // Duplicate syn: refuse the open, the session survives
            debug!("[{:?}] duplicate syn for stream {}", self.ty, stream_id);
            return self.reject_stream(cx, stream_id);
        }
        if self.state == SessionState::GoAwaySent {
            debug!(
                "[{:?}] go away sent, refuse remote stream {}",
                self.ty, stream_id
            );
            return self.reject_stream(cx, stream_id);
        }
        if self.pending_streams.len() >= self.config.accept_backlog
            || self.streams.len() >= self.config.max_stream_count
        {
            debug!(
                "[{:?}] accept backlog or stream count full, refuse remote stream {}",
                self.ty, stream_id
            );
            return self.reject_stream(cx, stream_id);
        }
        debug!("[{:?}] accept a stream id={}", self.ty, stream_id);
        let stream = self.create_stream(Some(stream_id))?;
        self.pending_streams.push_back(stream);
        self.send_all(cx)?;
        Ok(())
    }

    fn reject_stream(&mut self, cx: &mut Context, stream_id: StreamId) -> Result<(), Error> {
        let flags = Flags::from(Flag::Rst);
        self.send_frame(cx, Frame::new_window_update(flags, stream_id, 0))?;
        self.errored_ids.insert(stream_id);
        Ok(())
    }

    fn handle_session_message(&mut self, cx: &mut Context, message: Message) -> Result<(), Error> {
        match message {
            Message::SessionOpen => {
                debug!("[{:?}] session open from peer", self.ty);
                self.send_frame(cx, Frame::new_ping(Flags::from(Flag::Ack), 0))?;
                if self.state == SessionState::Idle {
                    self.state = SessionState::Open;
                }
            }
            Message::SessionOpenAck => {
                debug!("[{:?}] session open acknowledged", self.ty);
                if self.state == SessionState::Idle {
                    self.state = SessionState::Open;
                }
            }
            Message::Ping { ack: false, id } => {
                // Send ping back
                self.send_frame(cx, Frame::new_ping(Flags::from(Flag::Ack), id))?;
            }
            Message::Ping { ack: true, id } => {
                if let Some(record) = self.pings.remove(&id) {
                    let rtt = record.sent_at.elapsed();
                    if let Some(reply) = record.reply {
                        let _ignore = reply.send(Ok(rtt));
                    }
                }
                // If the remote peer does not follow the protocol,
                // there may be a memory leak, so here need to discard all ping ids below the ack.
                self.pings = self.pings.split_off(&id);
            }
            Message::GoAway(code) => return self.handle_go_away(code),
            _ => unreachable!("channel messages are routed by stream id"),
        }
        Ok(())
    }

    fn handle_go_away(&mut self, code: GoAwayCode) -> Result<(), Error> {
        debug!("[{:?}] go away from peer: {:?}", self.ty, code);
        self.state = SessionState::GoAwayReceived;
        // The peer said the last word: tear down without answering
        self.write_pending_frames.clear();
        self.close_all_streams(Error::RemoteGoAway);
        match code {
            GoAwayCode::Normal => Ok(()),
            GoAwayCode::ProtocolError | GoAwayCode::InternalError => Err(Error::RemoteGoAway),
        }
    }

    // Drop every stream and fail every parked open with `error`
    fn close_all_streams(&mut self, error: Error) {
        self.streams.clear();
        self.inflight.clear();
        self.local_fin.clear();
        self.remote_fin.clear();
        self.errored_ids.clear();
        self.pending_streams.clear();
        for (_, pending) in self.pending_open.drain() {
            let _ignore = pending.reply.send(Err(error.clone()));
        }
    }

    fn teardown_stream(&mut self, stream_id: StreamId, expect_trailing: bool) {
        self.streams.remove(&stream_id);
        self.inflight.remove(&stream_id);
        self.local_fin.remove(&stream_id);
        self.remote_fin.remove(&stream_id);
        if let Some(pending) = self.pending_open.remove(&stream_id) {
            let _ignore = pending.reply.send(Err(Error::ChannelSetupRejected));
        }
        if expect_trailing {
            self.errored_ids.insert(stream_id);
        }
        debug!("[{:?}] remove a stream id={}", self.ty, stream_id);
    }

    fn finish_stream(&mut self, stream_id: StreamId) {
        self.teardown_stream(stream_id, false);
    }

    // Receive frames from low level stream
    fn recv_frames(&mut self, cx: &mut Context) -> Result<(), Error> {
        for _ in 0..64 {
            if self.is_dead() {
                return Ok(());
            }

            match Pin::new(&mut self.framed_stream).as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    self.handle_frame(cx, frame)?;
                }
                Poll::Ready(None) => {
                    self.eof = true;
                    return Ok(());
                }
                Poll::Pending => {
                    return Ok(());
                }
                Poll::Ready(Some(Err(err))) => {
                    debug!("[{:?}] Session recv_frames error: {:?}", self.ty, err);
                    return Err(map_io_error(err));
                }
            }
        }
        self.set_delay(cx);
        Ok(())
    }

    fn handle_event(&mut self, cx: &mut Context, event: StreamEvent) -> Result<(), Error> {
        match event {
            StreamEvent::Frame(frame) => {
                let stream_id = frame.stream_id();
                let flags = frame.flags();
                self.send_frame(cx, frame)?;
                // Outbound fin/rst drive the same lifecycle bookkeeping
                // as their inbound counterparts
                if flags.contains(Flag::Rst) {
                    self.teardown_stream(stream_id, true);
                } else if flags.contains(Flag::Fin) {
                    self.local_fin.insert(stream_id);
                    if self.remote_fin.contains(&stream_id) {
                        self.finish_stream(stream_id);
                    }
                }
            }
            StreamEvent::Flush(stream_id) => {
                debug!("[{}] session flushing.....", stream_id);
                self.flush(cx)?;
                debug!("[{}] session flushed", stream_id);
            }
            StreamEvent::ProtocolError((stream_id, error)) => {
                warn!(
                    "[{:?}] stream {} reported a peer violation: {}",
                    self.ty, stream_id, error
                );
                return Err(error);
            }
        }
        Ok(())
    }

    // Receive events from sub streams
    fn recv_events(&mut self, cx: &mut Context) -> Result<(), Error> {
        for _ in 0..64 {
            if self.is_dead() {
                return Ok(());
            }

            match Pin::new(&mut self.event_receiver).as_mut().poll_next(cx) {
                Poll::Ready(Some(event)) => self.handle_event(cx, event)?,
                Poll::Ready(None) => {
                    // Since session hold one event sender,
                    // the channel can not be disconnected.
                    unreachable!()
                }
                Poll::Pending => {
                    return Ok(());
                }
            }
        }
        self.set_delay(cx);
        Ok(())
    }

    // Receive commands from control handles
    fn recv_commands(&mut self, cx: &mut Context) -> Result<(), Error> {
        for _ in 0..64 {
            if self.is_dead() {
                return Ok(());
            }

            match Pin::new(&mut self.control_receiver).as_mut().poll_next(cx) {
                Poll::Ready(Some(command)) => self.handle_command(cx, command)?,
                Poll::Ready(None) => {
                    // Since session hold one control sender,
                    // the channel can not be disconnected.
                    unreachable!()
                }
                Poll::Pending => {
                    return Ok(());
                }
            }
        }
        self.set_delay(cx);
        Ok(())
    }

    fn handle_command(&mut self, cx: &mut Context, command: Command) -> Result<(), Error> {
        match command {
            Command::OpenStream(reply) => {
                match self.open_stream() {
                    Ok(handle) => {
                        // Parked until the peer acknowledges
                        let stream_id = handle.id();
                        self.pending_open
                            .insert(stream_id, PendingOpen { handle, reply });
                    }
                    Err(err) => {
                        let _ignore = reply.send(Err(err));
                    }
                }
                self.send_all(cx)?;
            }
            Command::Ping(reply) => {
                self.send_ping(cx, Some(reply))?;
            }
            Command::Shutdown(reply) => {
                self.shutdown(cx)?;
                let _ignore = reply.send(());
            }
        }
        Ok(())
    }

    #[inline]
    fn set_delay(&mut self, cx: &mut Context) {
        // Why use `delay` instead of `notify`?
        //
        // In fact, on machines that can use multi-core normally, there is almost no problem with the `notify` behavior,
        // and even the efficiency will be higher.
        //
        // However, if you are on a single-core bully machine, `notify` may have a very amazing starvation behavior.
        //
        // Under a single-core machine, `notify` may fall into the loop of infinitely preemptive CPU, causing starvation.
        if !self.delay.load(Ordering::Acquire) {
            self.delay.store(true, Ordering::Release);
            let waker = cx.waker().clone();
            let delay = self.delay.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DELAY_TIME).await;
                waker.wake();
                delay.store(false, Ordering::Release);
            });
        }
    }

    // A fatal condition: announce it when the peer deserves an answer,
    // then tear everything down
    fn on_fatal(&mut self, cx: &mut Context, error: Error) -> Error {
        warn!("[{:?}] session failed: {}", self.ty, error);
        if self.state != SessionState::GoAwayReceived && !self.eof {
            let code = match error {
                Error::Timeout | Error::SessionShutdown => GoAwayCode::InternalError,
                _ => GoAwayCode::ProtocolError,
            };
            self.write_pending_frames.clear();
            self.write_pending_frames.push_back(Frame::new_go_away(code));
            // Best effort: the transport may already be gone
            let _ignore = self.send_all(cx);
        }
        self.close_all_streams(error.clone());
        self.state = SessionState::Closed;
        error
    }

    fn poll_inner(&mut self, cx: &mut Context) -> Result<Option<StreamHandle>, Error> {
        if !self.read_pending_messages.is_empty() || !self.write_pending_frames.is_empty() {
            self.flush(cx)?;
        }

        self.poll_complete(cx)?;

        if let Some(period) = self.config.ping_interval {
            if self.keepalive.is_none() {
                // Lazy so that sessions can be constructed outside a runtime
                self.keepalive = Some(tokio::time::interval(period));
            }
            loop {
                let ticked = match self.keepalive.as_mut() {
                    Some(interval) => interval.poll_tick(cx).is_ready(),
                    None => false,
                };
                if !ticked {
                    break;
                }
                self.keep_alive(cx)?;
            }
        }

        self.recv_frames(cx)?;
        self.recv_commands(cx)?;
        self.recv_events(cx)?;
        self.send_all(cx)?;

        Ok(self.pending_streams.pop_front())
    }
}

impl<T> Stream for Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<StreamHandle, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        if self.is_dead() {
            debug!("yamux::Session finished because is_dead");
            // A straggler accepted but never yielded is torn down too
            self.close_all_streams(Error::SessionShutdown);
            return Poll::Ready(None);
        }

        match self.poll_inner(cx) {
            Ok(Some(stream)) => {
                debug!("[{:?}] accepted stream {} is ready", self.ty, stream.id());
                Poll::Ready(Some(Ok(stream)))
            }
            Ok(None) => {
                if self.eof {
                    // The transport ended under us: every stream dies with it
                    let was_quiescing = self.state == SessionState::GoAwaySent;
                    let had_streams = !self.streams.is_empty();
                    self.close_all_streams(Error::TransportShutdown);
                    self.state = SessionState::Closed;
                    if had_streams && !was_quiescing {
                        return Poll::Ready(Some(Err(Error::TransportShutdown)));
                    }
                    return Poll::Ready(None);
                }
                if self.is_dead() {
                    return Poll::Ready(None);
                }
                Poll::Pending
            }
            Err(err) => {
                let err = self.on_fatal(cx, err);
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

enum RouteOutcome {
    Delivered,
    Blocked,
    Disconnected,
}

// Decode errors carry the protocol error; everything else is the transport
fn map_io_error(err: io::Error) -> Error {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<Error>())
        .cloned()
        .unwrap_or(Error::TransportShutdown)
}
