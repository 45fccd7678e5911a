use futures::{
    channel::{mpsc, oneshot},
    sink::SinkExt,
};
use std::time::Duration;

use crate::{error::Error, stream::StreamHandle};

pub(crate) enum Command {
    OpenStream(oneshot::Sender<Result<StreamHandle, Error>>),
    Ping(oneshot::Sender<Result<Duration, Error>>),
    Shutdown(oneshot::Sender<()>),
}

/// A session control is used to open streams, measure round trip time
/// or close the session from outside the session task
#[derive(Clone)]
pub struct Control {
    sender: mpsc::Sender<Command>,
}

impl Control {
    pub(crate) fn new(sender: mpsc::Sender<Command>) -> Self {
        Control { sender }
    }

    /// Open a new stream to remote session.
    ///
    /// Resolves once the peer acknowledged the stream; fails on reset,
    /// session close or stream id exhaustion. Dropping the returned
    /// future before it resolves makes the session reset the stream as
    /// soon as the acknowledgment arrives.
    pub async fn open_stream(&mut self) -> Result<StreamHandle, Error> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::OpenStream(tx))
            .await
            .map_err(|_| Error::SessionShutdown)?;
        rx.await.map_err(|_| Error::SessionShutdown)?
    }

    /// Measure the round trip time to the peer
    pub async fn ping(&mut self) -> Result<Duration, Error> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Ping(tx))
            .await
            .map_err(|_| Error::SessionShutdown)?;
        rx.await.map_err(|_| Error::SessionShutdown)?
    }

    /// shutdown is used to close the session and all streams.
    pub async fn close(&mut self) {
        if self.sender.is_closed() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        let _ignore = self.sender.send(Command::Shutdown(tx)).await;
        let _ignore = rx.await;
    }
}
