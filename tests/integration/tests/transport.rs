//! Transport-level behavior: stream-id exhaustion and draining, flow
//! control under pinned windows, and reset handling mid-message.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream;
use integration_tests::*;
use roam::transport::Http2Settings;
use roam::{Channel, ChannelOptions, Code, Request};

// Property: with a stream-id cap of 4, three overlapping calls span
// exactly two transports, and the first transport closes once its last
// stream finishes.
#[tokio::test]
async fn stream_id_cap_drains_to_a_successor_transport() {
    roam::inmemory::register();
    let listener = roam::inmemory::Listener::new();
    let target = listener.target();

    let connections = Arc::new(AtomicUsize::new(0));
    let server = roam::Server::builder().add_service(echo_service()).build();
    {
        let server = server.clone();
        let connections = connections.clone();
        tokio::spawn(async move {
            while let Some(io) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.serve_connection(io).await;
                });
            }
        });
    }

    let mut options = ChannelOptions::default();
    options.http2 = Http2Settings {
        max_stream_id: 4,
        ..Http2Settings::default()
    };
    let channel = Channel::new(&target, None, options).unwrap();

    // Two overlapping streams fit under the cap (ids 1 and 3).
    let first = channel
        .streaming(
            BIDI_STREAMING_ECHO,
            Request::new(stream::iter(vec!["a".to_string()])),
            TextCodec,
        )
        .await
        .unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    let second = channel
        .streaming(
            BIDI_STREAMING_ECHO,
            Request::new(stream::iter(vec!["b".to_string()])),
            TextCodec,
        )
        .await
        .unwrap();

    // Admitting the second stream exhausted the id space; the third must
    // land on a fresh transport while the first two finish undisturbed.
    let third = channel
        .streaming(
            BIDI_STREAMING_ECHO,
            Request::new(stream::iter(vec!["c".to_string()])),
            TextCodec,
        )
        .await
        .unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    // All three calls complete.
    for (response, expect) in [(first, "a"), (second, "b"), (third, "c")] {
        let mut inbound = response.into_inner();
        assert_eq!(inbound.message().await.unwrap().unwrap(), expect);
        assert!(inbound.message().await.unwrap().is_none());
    }
}

// Liveness under pinned 64 KiB windows: a payload many times the window
// size forces repeated WINDOW_UPDATE exchanges in both directions.
#[tokio::test]
async fn flow_control_moves_large_messages_through_small_windows() {
    let (_server, target) = start_echo_server();

    let mut options = ChannelOptions::default();
    options.http2 = Http2Settings {
        initial_stream_window_size: Some(65_535),
        initial_connection_window_size: Some(65_535),
        ..Http2Settings::default()
    };
    let channel = Channel::new(&target, None, options).unwrap();

    let body = "z".repeat(1024 * 1024);
    let response = tokio::time::timeout(
        Duration::from_secs(30),
        channel.unary(UNARY_ECHO, Request::new(body.clone()), TextCodec),
    )
    .await
    .expect("transfer stalled: flow-control credit was not replenished")
    .unwrap();
    assert_eq!(response.get_ref().len(), body.len());
}

// With the adaptive window left on, the same transfer exercises the
// BDP-driven window growth path.
#[tokio::test]
async fn adaptive_window_transfer() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);

    let body = "w".repeat(4 * 1024 * 1024);
    let response = tokio::time::timeout(
        Duration::from_secs(30),
        channel.unary(UNARY_ECHO, Request::new(body.clone()), TextCodec),
    )
    .await
    .expect("transfer stalled")
    .unwrap();
    assert_eq!(response.get_ref().len(), body.len());
}

// The RST-mid-message seed: the server announces a 2048-byte message,
// delivers half of it, then resets with CANCEL. The call must surface
// CANCELLED, not a decode error.
#[tokio::test]
async fn reset_mid_message_is_cancelled() {
    roam::inmemory::register();
    let listener = roam::inmemory::Listener::new();
    let target = listener.target();

    tokio::spawn(async move {
        while let Some(io) = listener.accept().await {
            tokio::spawn(async move {
                let mut connection = h2::server::handshake(io).await.unwrap();
                while let Some(result) = connection.accept().await {
                    let (_request, mut respond) = result.unwrap();
                    let response = http::Response::builder()
                        .status(200)
                        .header("content-type", "application/grpc")
                        .body(())
                        .unwrap();
                    let mut send = respond.send_response(response, false).unwrap();

                    // Five-byte prefix claiming 2048 bytes, then only half
                    // the payload.
                    let mut frame = Vec::with_capacity(5 + 1024);
                    frame.push(0u8);
                    frame.extend_from_slice(&2048u32.to_be_bytes());
                    frame.extend_from_slice(&[7u8; 1024]);
                    send.send_data(bytes::Bytes::from(frame), false).unwrap();
                    send.send_reset(h2::Reason::CANCEL);
                }
            });
        }
    });

    let channel = connect(&target);
    let err = channel
        .unary(UNARY_ECHO, Request::new("x".to_string()), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
}

#[tokio::test]
async fn works_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = roam::Server::builder().add_service(echo_service()).build();
    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
    }

    let channel = connect(&format!("dns:///{addr}"));
    let response = channel
        .unary(UNARY_ECHO, Request::new("over tcp".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "over tcp");
}

#[cfg(unix)]
#[tokio::test]
async fn works_over_unix_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    let server = roam::Server::builder().add_service(echo_service()).build();
    {
        let server = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.serve_connection(socket).await;
                });
            }
        });
    }

    let channel = connect(&format!("unix://{}", path.display()));
    let response = channel
        .unary(UNARY_ECHO, Request::new("over uds".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "over uds");
}
