//! Wire-level checks: raw header bytes in, raw header bytes out

use std::{
    future::poll_fn,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use yamux_core::{
    config::Config,
    error::Error,
    session::{Session, SessionState},
    StreamHandle,
};

fn quiet_config() -> Config {
    Config {
        ping_interval: None,
        ..Config::default()
    }
}

// Drive the session one poll without consuming an accepted stream
async fn poll_session<T>(session: &mut Session<T>) -> Option<Option<Result<StreamHandle, Error>>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    poll_fn(|cx: &mut Context| match Pin::new(&mut *session).poll_next(cx) {
        Poll::Ready(item) => Poll::Ready(Some(item)),
        Poll::Pending => Poll::Ready(None),
    })
    .await
}

async fn read_frame_bytes<T: AsyncRead + Unpin>(remote: &mut T) -> [u8; 12] {
    let mut header = [0u8; 12];
    remote.read_exact(&mut header).await.unwrap();
    header
}

#[tokio::test]
async fn test_listener_announces_session_open() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_listener(local, quiet_config());
    assert_eq!(session.state(), SessionState::Open);

    poll_session(&mut session).await;

    // Ping with syn on the session id announces the open
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);

    remote
        .write_all(&[0, 2, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    poll_session(&mut session).await;
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_initiator_acknowledges_session_open() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_initiator(local, quiet_config());
    assert_eq!(session.state(), SessionState::Idle);

    poll_session(&mut session).await;

    remote
        .write_all(&[0, 2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    poll_session(&mut session).await;

    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 2, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_ping_echo() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_initiator(local, quiet_config());

    // Ping without flags, opaque value 1234
    remote
        .write_all(&[0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0x04, 0xD2])
        .await
        .unwrap();
    poll_session(&mut session).await;

    // The echo keeps the value and adds the ack flag
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 2, 0, 2, 0, 0, 0, 0, 0, 0, 0x04, 0xD2]);
}

#[tokio::test]
async fn test_data_open_and_send() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_listener(local, quiet_config());
    poll_session(&mut session).await;
    // Discard the session open announcement
    read_frame_bytes(&mut remote).await;

    // Data with syn|fin on stream 1 carrying "Hello World!"
    remote
        .write_all(&[0, 0, 0, 5, 0, 0, 0, 1, 0, 0, 0, 12])
        .await
        .unwrap();
    remote.write_all(b"Hello World!").await.unwrap();

    let mut stream = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap();
        }
    };
    assert_eq!(stream.id(), 1);

    // The accept acknowledged the stream on the wire
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 1, 0, 2, 0, 0, 0, 1, 0, 0, 0, 0]);

    // Data was delivered, then the peer's fin half-closed the stream
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"Hello World!");
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_syn_with_wrong_parity_fails_session() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    // An initiator owns the odd ids: an odd syn from the peer is a violation
    let mut session = Session::new_initiator(local, quiet_config());

    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 3, 0, 0, 0, 0])
        .await
        .unwrap();

    let err = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap_err();
        }
    };
    assert!(matches!(err, Error::ProtocolViolation(_)));

    // The session announced the failure before closing
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
}

#[tokio::test]
async fn test_window_increment_overflow_fails_session() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_listener(local, quiet_config());
    poll_session(&mut session).await;
    read_frame_bytes(&mut remote).await;

    // Peer opens stream 1
    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut stream = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap();
        }
    };
    read_frame_bytes(&mut remote).await;

    // A window update pushing the credit past u32::MAX
    remote
        .write_all(&[0, 1, 0, 0, 0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF])
        .await
        .unwrap();
    poll_session(&mut session).await;

    // The stream detects the overflow when polled
    let mut buf = [0u8; 8];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    // ... and the session goes away with a protocol error
    let err = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap_err();
        }
    };
    assert_eq!(err, Error::FlowControlViolation);

    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
}

#[tokio::test]
async fn test_go_away_terminates_session() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_initiator(local, quiet_config());

    remote
        .write_all(&[0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let finished = loop {
        match poll_session(&mut session).await {
            Some(None) => break true,
            Some(Some(item)) => panic!("unexpected item: {:?}", item.map(|s| s.id())),
            None => (),
        }
    };
    assert!(finished);
    assert_eq!(session.state(), SessionState::GoAwayReceived);

    // No answer goes out after a go away
    poll_session(&mut session).await;
    let mut buf = [0u8; 12];
    let pending = poll_fn(|cx| {
        Poll::Ready(matches!(
            Pin::new(&mut remote).poll_read(cx, &mut tokio::io::ReadBuf::new(&mut buf)),
            Poll::Pending
        ))
    })
    .await;
    assert!(pending);
}

#[tokio::test]
async fn test_unknown_stream_is_fatal() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_listener(local, quiet_config());
    poll_session(&mut session).await;
    read_frame_bytes(&mut remote).await;

    // Data for a stream that was never opened
    remote
        .write_all(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2])
        .await
        .unwrap();
    remote.write_all(b"hi").await.unwrap();

    let err = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap_err();
        }
    };
    assert_eq!(err, Error::UnknownStream(1));

    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
}

#[tokio::test]
async fn test_accept_backlog_rejects_with_reset() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let config = Config {
        accept_backlog: 1,
        ping_interval: None,
        ..Config::default()
    };
    let mut session = Session::new_listener(local, config);
    poll_session(&mut session).await;
    read_frame_bytes(&mut remote).await;

    // Three opens land in one read batch, only one fits the backlog
    for id in [1u8, 3, 5] {
        remote
            .write_all(&[0, 1, 0, 1, 0, 0, 0, id, 0, 0, 0, 0])
            .await
            .unwrap();
    }

    let stream = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap();
        }
    };
    assert_eq!(stream.id(), 1);

    // Ack for stream 1, rst for the two over the backlog
    assert_eq!(
        read_frame_bytes(&mut remote).await,
        [0, 1, 0, 2, 0, 0, 0, 1, 0, 0, 0, 0]
    );
    assert_eq!(
        read_frame_bytes(&mut remote).await,
        [0, 1, 0, 8, 0, 0, 0, 3, 0, 0, 0, 0]
    );
    assert_eq!(
        read_frame_bytes(&mut remote).await,
        [0, 1, 0, 8, 0, 0, 0, 5, 0, 0, 0, 0]
    );
}

#[tokio::test]
async fn test_max_stream_count_rejects_opens() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let config = Config {
        max_stream_count: 1,
        ping_interval: None,
        ..Config::default()
    };
    let mut session = Session::new_listener(local, config);
    poll_session(&mut session).await;
    read_frame_bytes(&mut remote).await;

    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    let stream = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap();
        }
    };
    assert_eq!(stream.id(), 1);
    read_frame_bytes(&mut remote).await;

    // One live stream is the limit: the next inbound open is refused
    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 3, 0, 0, 0, 0])
        .await
        .unwrap();
    poll_session(&mut session).await;
    assert_eq!(
        read_frame_bytes(&mut remote).await,
        [0, 1, 0, 8, 0, 0, 0, 3, 0, 0, 0, 0]
    );

    // ... and local opens fail as well
    assert_eq!(
        session.open_stream().unwrap_err(),
        Error::ChannelSetupRejected
    );
}

#[tokio::test]
async fn test_half_close_on_the_wire() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_listener(local, quiet_config());
    poll_session(&mut session).await;
    read_frame_bytes(&mut remote).await;

    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut stream = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap();
        }
    };
    read_frame_bytes(&mut remote).await;

    stream.shutdown().await.unwrap();
    poll_session(&mut session).await;

    // Our half-close is a window update with the fin flag
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 1, 0, 4, 0, 0, 0, 1, 0, 0, 0, 0]);

    // The peer's fin completes the close
    remote
        .write_all(&[0, 1, 0, 4, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    poll_session(&mut session).await;
    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_syn_is_rejected_without_failing_session() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_listener(local, quiet_config());
    poll_session(&mut session).await;
    read_frame_bytes(&mut remote).await;

    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    let stream = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap();
        }
    };
    read_frame_bytes(&mut remote).await;

    // The same id syn'd again is refused with a reset only
    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    poll_session(&mut session).await;
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 1, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0]);

    // The session survived: pings are still answered
    remote
        .write_all(&[0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7])
        .await
        .unwrap();
    poll_session(&mut session).await;
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 2, 0, 2, 0, 0, 0, 0, 0, 0, 0, 7]);
    drop(stream);
}

#[tokio::test]
async fn test_trailing_frames_after_local_reset_are_dropped() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_listener(local, quiet_config());
    poll_session(&mut session).await;
    read_frame_bytes(&mut remote).await;

    remote
        .write_all(&[0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut stream = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap();
        }
    };
    read_frame_bytes(&mut remote).await;

    stream.reset().unwrap();
    poll_session(&mut session).await;
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 1, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0]);

    // Data already in flight when we reset is silently dropped
    remote
        .write_all(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 4])
        .await
        .unwrap();
    remote.write_all(b"late").await.unwrap();
    assert!(poll_session(&mut session).await.is_none());

    // The peer's own reset releases the id...
    remote
        .write_all(&[0, 1, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0])
        .await
        .unwrap();
    assert!(poll_session(&mut session).await.is_none());

    // ...after which frames for it are a violation again
    remote
        .write_all(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 4])
        .await
        .unwrap();
    remote.write_all(b"late").await.unwrap();
    let err = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap_err();
        }
    };
    assert_eq!(err, Error::UnknownStream(1));
}

#[tokio::test]
async fn test_remote_go_away_with_error_code() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_initiator(local, quiet_config());

    remote
        .write_all(&[0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1])
        .await
        .unwrap();

    let err = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap_err();
        }
    };
    assert_eq!(err, Error::RemoteGoAway);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_data_with_ack_establishes_and_delivers() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_initiator(local, quiet_config());

    let mut stream = session.open_stream().unwrap();
    poll_session(&mut session).await;

    // The open goes out as a window update with the syn flag
    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0]);

    // The peer acknowledges and sends data in one frame
    remote
        .write_all(&[0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2])
        .await
        .unwrap();
    remote.write_all(b"hi").await.unwrap();
    poll_session(&mut session).await;

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
    assert_eq!(stream.state(), yamux_core::stream::StreamState::Established);
}

#[tokio::test]
async fn test_bad_version_fails_session() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let mut session = Session::new_initiator(local, quiet_config());

    remote
        .write_all(&[9, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let err = loop {
        if let Some(item) = poll_session(&mut session).await {
            break item.unwrap().unwrap_err();
        }
    };
    assert_eq!(err, Error::UnsupportedVersion(9));

    let header = read_frame_bytes(&mut remote).await;
    assert_eq!(header, [0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
}
