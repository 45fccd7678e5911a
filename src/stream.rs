//! The substream, the main interface is AsyncRead/AsyncWrite

use bytes::BytesMut;
use futures::{
    channel::mpsc::{Receiver, Sender},
    Stream,
};

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    error::Error,
    flow::{RecvWindow, SendWindow},
    frame::{Flag, Flags, Frame, Message},
    StreamId,
};

/// The substream
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    state: StreamState,

    send_window: SendWindow,
    recv_window: RecvWindow,
    max_frame_payload: u32,

    read_buf: BytesMut,
    write_buf: BytesMut,
    // Events produced while the session channel was full; drained before
    // anything new is sent so frame order is preserved
    pending_events: VecDeque<StreamEvent>,

    // The session dropped the message channel without a FIN/RST first
    transport_gone: bool,

    // A writer parked on window credit or a missing ack. Reads and
    // writes may run on split halves of one handle, so the message
    // receiver's waker alone cannot be relied on to resume the writer
    write_waker: Option<Waker>,

    // Send stream event to parent session
    event_sender: Sender<StreamEvent>,

    // Receive messages of current stream from parent session
    // (if the sender closed means session closed the stream should close too)
    message_receiver: Receiver<Message>,

    delay: Arc<AtomicBool>,
}

impl StreamHandle {
    // Create a StreamHandle from session.
    //
    // An outbound handle is born in SynSent: the session has already
    // queued the SYN. An inbound handle is born in Established: the
    // session validated the SYN and queued the ACK.
    pub(crate) fn new(
        id: StreamId,
        event_sender: Sender<StreamEvent>,
        message_receiver: Receiver<Message>,
        state: StreamState,
        recv_window_size: u32,
        send_window_size: u32,
        max_frame_payload: u32,
    ) -> StreamHandle {
        assert!(state == StreamState::SynSent || state == StreamState::Established);
        StreamHandle {
            id,
            state,
            send_window: SendWindow::new(send_window_size),
            recv_window: RecvWindow::new(recv_window_size),
            max_frame_payload,
            read_buf: BytesMut::default(),
            write_buf: BytesMut::default(),
            pending_events: VecDeque::default(),
            transport_gone: false,
            write_waker: None,
            event_sender,
            message_receiver,
            delay: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the stream id
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get the stream state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Remaining outbound credit granted by the peer
    pub fn send_window(&self) -> u32 {
        self.send_window.free()
    }

    /// Credit currently granted to the peer on the receive side
    pub fn recv_window(&self) -> u32 {
        self.recv_window.window()
    }

    /// Largest data payload this stream puts in a single frame
    pub fn max_frame_payload(&self) -> u32 {
        self.max_frame_payload
    }

    /// Whether a write would be accepted without backpressure
    pub fn is_writable(&self) -> bool {
        self.state.can_send() && self.send_window.is_writable()
    }

    /// Abort the stream immediately.
    ///
    /// Subsequent reads return no data and writes fail; calling it on an
    /// already terminal stream is a no-op.
    pub fn reset(&mut self) -> Result<(), Error> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = StreamState::Reset;
        let frame = Frame::new_window_update(Flags::from(Flag::Rst), self.id, 0);
        match self.send_frame(frame) {
            // Parked, the reset frame goes out with the next drain
            Err(Error::WouldBlock) => Ok(()),
            res => res,
        }
    }

    fn send_event(&mut self, event: StreamEvent) -> Result<(), Error> {
        self.pending_events.push_back(event);
        self.drain_events()
    }

    // Push parked events out in order. WouldBlock means the tail is
    // still parked locally, nothing was lost.
    fn drain_events(&mut self) -> Result<(), Error> {
        while let Some(event) = self.pending_events.pop_front() {
            if let Err(e) = self.event_sender.try_send(event) {
                if e.is_full() {
                    self.pending_events.push_front(e.into_inner());
                    return Err(Error::WouldBlock);
                } else {
                    return Err(Error::SessionShutdown);
                }
            }
        }
        Ok(())
    }

    #[inline]
    fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let event = StreamEvent::Frame(frame);
        self.send_event(event)
    }

    // Send a window update when consumption crossed the advertise threshold
    fn advertise_window(&mut self) -> Result<(), Error> {
        if !self.state.can_recv() {
            return Ok(());
        }
        let delta = match self.recv_window.take_advertise(self.read_buf.len()) {
            Some(delta) => delta,
            None => return Ok(()),
        };
        debug!("[{}] advertise window delta={}", self.id, delta);
        let frame = Frame::new_window_update(Flags::default(), self.id, delta);
        match self.send_frame(frame) {
            Err(Error::WouldBlock) => Ok(()),
            res => res,
        }
    }

    // Move as much of the write buffer onto the wire as credit and the
    // per-frame payload cap allow
    fn drain_write_buf(&mut self) -> Result<(), Error> {
        while !self.write_buf.is_empty() {
            let n = (self.send_window.free() as usize)
                .min(self.max_frame_payload as usize)
                .min(self.write_buf.len());
            if n == 0 {
                break;
            }
            let body = self.write_buf.split_to(n).freeze();
            let frame = Frame::new_data(Flags::default(), self.id, body);
            match self.send_frame(frame) {
                Ok(()) => self.send_window.on_wrote(n),
                Err(Error::WouldBlock) => {
                    // The frame is parked and owns its bytes already
                    self.send_window.on_wrote(n);
                    return Err(Error::WouldBlock);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        match self.state {
            StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                self.state = StreamState::LocalHalfClosed;
                self.send_fin()?;
            }
            StreamState::RemoteHalfClosed => {
                self.state = StreamState::Closed;
                self.send_fin()?;
            }
            // close() on a closed or reset stream is a no-op
            StreamState::LocalHalfClosed | StreamState::Closed | StreamState::Reset => {}
            StreamState::Idle => {
                self.state = StreamState::Closed;
            }
        }
        Ok(())
    }

    fn send_fin(&mut self) -> Result<(), Error> {
        let frame = Frame::new_window_update(Flags::from(Flag::Fin), self.id, 0);
        match self.send_frame(frame) {
            Err(Error::WouldBlock) => Ok(()),
            res => res,
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<(), Error> {
        debug!("[{}] StreamHandle.handle_message({:?})", self.id, message);
        match message {
            Message::ChannelOpenAck(_) => self.handle_open_ack(),
            Message::ChannelData(_, data) => self.handle_data(data),
            Message::ChannelWindowAdjust(_, delta) => self.handle_window_adjust(delta),
            Message::ChannelClose(_) => self.handle_close(),
            Message::ChannelReset(_) => {
                if !self.state.is_terminal() {
                    self.state = StreamState::Reset;
                }
                Ok(())
            }
            // Session-level messages are never routed to a stream
            _ => Ok(()),
        }
    }

    fn handle_open_ack(&mut self) -> Result<(), Error> {
        match self.state {
            StreamState::SynSent => {
                self.state = StreamState::Established;
                Ok(())
            }
            // We half-closed before the ack arrived, the ack is still fine
            StreamState::LocalHalfClosed => Ok(()),
            StreamState::Closed | StreamState::Reset => Ok(()),
            StreamState::Established => {
                Err(Error::ProtocolViolation("ack on an established stream"))
            }
            _ => Err(Error::ProtocolViolation("unexpected ack")),
        }
    }

    fn handle_data(&mut self, data: bytes::Bytes) -> Result<(), Error> {
        match self.state {
            // Data may race our own FIN, that is legal
            StreamState::Established | StreamState::LocalHalfClosed => {
                self.recv_window.on_data(data.len() as u32)?;
                self.read_buf.extend_from_slice(&data);
                Ok(())
            }
            StreamState::Closed | StreamState::Reset => Ok(()),
            StreamState::RemoteHalfClosed => {
                Err(Error::ProtocolViolation("data after the peer's fin"))
            }
            _ => Err(Error::ProtocolViolation("data before established")),
        }
    }

    fn handle_window_adjust(&mut self, delta: u32) -> Result<(), Error> {
        match self.state {
            StreamState::Established
            | StreamState::LocalHalfClosed
            | StreamState::RemoteHalfClosed => {
                self.send_window.on_increment(delta)?;
                match self.drain_write_buf() {
                    Ok(()) | Err(Error::WouldBlock) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            StreamState::Closed | StreamState::Reset => Ok(()),
            _ => Err(Error::ProtocolViolation("window update before established")),
        }
    }

    fn handle_close(&mut self) -> Result<(), Error> {
        match self.state {
            StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                self.state = StreamState::RemoteHalfClosed;
                Ok(())
            }
            StreamState::LocalHalfClosed => {
                self.state = StreamState::Closed;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn recv_messages(&mut self, cx: &mut Context) -> Result<(), Error> {
        // Opportunistically push parked events now that the session may
        // have drained its inbox
        let _ignore = self.drain_events();

        for _ in 0..64 {
            match Pin::new(&mut self.message_receiver).as_mut().poll_next(cx) {
                Poll::Ready(Some(message)) => {
                    let res = self.handle_message(message);
                    self.wake_writer();
                    if let Err(err) = res {
                        if err.is_fatal() {
                            // The peer broke the contract, tell the session
                            // so it can fail with a go away
                            let _ignore =
                                self.send_event(StreamEvent::ProtocolError((self.id, err.clone())));
                            self.state = StreamState::Reset;
                        }
                        return Err(err);
                    }
                }
                Poll::Ready(None) => {
                    if !self.state.is_terminal() {
                        self.transport_gone = true;
                        self.state = StreamState::Closed;
                    }
                    self.wake_writer();
                    return Ok(());
                }
                Poll::Pending => {
                    return Ok(());
                }
            }
        }
        self.set_delay(cx);
        Ok(())
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

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
                tokio::time::sleep(Duration::from_millis(200)).await;
                waker.wake();
                delay.store(false, Ordering::Release);
            });
        }
    }

    fn check_self_state(&mut self) -> io::Result<()> {
        // Read errors surface only once the buffered bytes are drained
        if self.read_buf.is_empty() {
            match self.state {
                StreamState::Reset => {
                    debug!("[{}] connection reset", self.id);
                    Err(io::ErrorKind::ConnectionReset.into())
                }
                StreamState::Closed if self.transport_gone => {
                    debug!("[{}] transport gone", self.id);
                    Err(Error::TransportShutdown.into())
                }
                _ => Ok(()),
            }
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for StreamHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let rv = self.recv_messages(cx);
        debug!(
            "[{}] StreamHandle.poll_read() recv_messages() => {:?}, state: {:?}",
            self.id, rv, self.state
        );
        if let Err(err) = rv {
            if err.is_fatal() {
                return Poll::Ready(Err(err.into()));
            }
        }

        self.check_self_state()?;

        let n = buf.remaining().min(self.read_buf.len());
        if n == 0 {
            return match self.state {
                // Peer half-closed and everything is consumed: EOF
                StreamState::RemoteHalfClosed | StreamState::Closed => Poll::Ready(Ok(())),
                _ => Poll::Pending,
            };
        }
        let b = self.read_buf.split_to(n);
        buf.put_slice(&b);
        if let Err(err) = self.advertise_window() {
            debug!("[{}] advertise_window error: {:?}", self.id, err);
        }

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StreamHandle {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        debug!("[{}] StreamHandle.poll_write({})", self.id, buf.len());
        if let Err(e) = self.recv_messages(cx) {
            if e.is_fatal() {
                return Poll::Ready(Err(e.into()));
            }
        }

        match self.state {
            StreamState::Established | StreamState::RemoteHalfClosed => {}
            // Not yet acknowledged, hold the caller back
            StreamState::Idle | StreamState::SynSent | StreamState::SynReceived => {
                self.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            StreamState::LocalHalfClosed | StreamState::Closed | StreamState::Reset => {
                return Poll::Ready(Err(Error::StreamNotWritable.into()));
            }
        }

        if !self.send_window.is_writable() {
            debug!(
                "[{}] write blocked, window={}, buffered={}",
                self.id,
                self.send_window.free(),
                self.write_buf.len()
            );
            self.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        self.send_window.on_buffer(buf.len());
        self.write_buf.extend_from_slice(buf);
        match self.drain_write_buf() {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(Error::WouldBlock) => {
                // Bytes are accepted, the parked frames leave on a later poll
                self.set_delay(cx);
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        debug!("[{}] StreamHandle.poll_flush()", self.id);
        if let Err(e) = self.recv_messages(cx) {
            if e.is_fatal() {
                return Poll::Ready(Err(e.into()));
            }
        }
        match self.drain_write_buf() {
            Ok(()) => (),
            Err(Error::WouldBlock) => {
                self.set_delay(cx);
                return Poll::Pending;
            }
            Err(_) => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
        if !self.write_buf.is_empty() {
            // Window starved, resumes when the peer grants credit
            self.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let event = StreamEvent::Flush(self.id);
        match self.send_event(event) {
            Err(Error::WouldBlock) => {
                self.set_delay(cx);
                Poll::Pending
            }
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Ok(()) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        debug!("[{}] StreamHandle.poll_shutdown()", self.id);
        if let Err(e) = self.recv_messages(cx) {
            if e.is_fatal() {
                return Poll::Ready(Err(e.into()));
            }
        }
        match self.drain_write_buf() {
            Ok(()) => (),
            Err(Error::WouldBlock) => {
                self.set_delay(cx);
                return Poll::Pending;
            }
            Err(_) => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
        if !self.write_buf.is_empty() {
            self.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        match self.close() {
            Err(Error::WouldBlock) => {
                self.set_delay(cx);
                Poll::Pending
            }
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Ok(()) => Poll::Ready(Ok(())),
        }
    }
}

// Stream event
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Frame(Frame),
    // Flush stream's frames to remote stream
    Flush(StreamId),
    // The peer broke the stream contract, the session must go away
    ProtocolError((StreamId, Error)),
}

/// The stream state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    /// Just created, nothing announced
    Idle,
    /// We sent a Syn message
    SynSent,
    /// We received a Syn message
    SynReceived,
    /// Stream established
    Established,
    /// We half-closed the stream
    LocalHalfClosed,
    /// Remote half-closed the stream
    RemoteHalfClosed,
    /// Both sides of the stream closed
    Closed,
    /// Stream reset by either side
    Reset,
}

impl StreamState {
    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }

    pub(crate) fn can_send(self) -> bool {
        matches!(self, StreamState::Established | StreamState::RemoteHalfClosed)
    }

    pub(crate) fn can_recv(self) -> bool {
        matches!(self, StreamState::Established | StreamState::LocalHalfClosed)
    }
}
