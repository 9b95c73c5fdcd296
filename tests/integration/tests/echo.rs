//! Round trips over every RPC shape, status preservation, metadata and
//! message-size limits.

use futures_util::stream;
use integration_tests::*;
use roam::codec::CompressionEncoding;
use roam::{Channel, ChannelOptions, Code, Request, Response, Server, Service, Status};

#[tokio::test]
async fn unary_round_trip() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);

    let response = channel
        .unary(UNARY_ECHO, Request::new("hello".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "hello");
}

#[tokio::test]
async fn client_streaming_round_trip() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);

    let messages = stream::iter(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    let response = channel
        .client_streaming(CLIENT_STREAMING_ECHO, Request::new(messages), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "a,b,c");
}

#[tokio::test]
async fn server_streaming_round_trip() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);

    let response = channel
        .server_streaming(
            SERVER_STREAMING_ECHO,
            Request::new("one two three".to_string()),
            TextCodec,
        )
        .await
        .unwrap();
    let mut inbound = response.into_inner();
    let mut received = Vec::new();
    while let Some(message) = inbound.message().await.unwrap() {
        received.push(message);
    }
    assert_eq!(received, vec!["one", "two", "three"]);
}

// The ping-pong seed scenario: a server-streaming echo of the literal
// client message.
#[tokio::test]
async fn server_streaming_ping_pong() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);

    let response = channel
        .server_streaming(
            SERVER_STREAMING_ECHO,
            Request::new("Client Message".to_string()),
            TextCodec,
        )
        .await
        .unwrap();
    let mut inbound = response.into_inner();
    let mut received = Vec::new();
    while let Some(message) = inbound.message().await.unwrap() {
        received.push(message);
    }
    assert_eq!(received.join(" "), "Client Message");
}

#[tokio::test]
async fn bidi_round_trip() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);

    let outbound = stream::iter(vec!["x".to_string(), "y".to_string()]);
    let response = channel
        .streaming(BIDI_STREAMING_ECHO, Request::new(outbound), TextCodec)
        .await
        .unwrap();
    let mut inbound = response.into_inner();
    assert_eq!(inbound.message().await.unwrap().unwrap(), "x");
    assert_eq!(inbound.message().await.unwrap().unwrap(), "y");
    assert!(inbound.message().await.unwrap().is_none());
}

fn failing_service(code: Code, message: &'static str) -> Service {
    Service::new("test.Fail").unary("Fail", TextCodec, move |_req: Request<String>| async move {
        let mut metadata = roam::metadata::MetadataMap::new();
        metadata.insert("key", "value").unwrap();
        Err::<Response<String>, Status>(Status::with_metadata(code, message, metadata))
    })
}

#[tokio::test]
async fn status_code_and_message_are_preserved() {
    let codes = [
        Code::Cancelled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];
    for code in codes {
        let (_server, target) = start_server(
            Server::builder()
                .add_service(failing_service(code, "the exact message"))
                .build(),
        );
        let channel = connect(&target);
        let err = channel
            .unary("/test.Fail/Fail", Request::new("x".to_string()), TextCodec)
            .await
            .unwrap_err();
        assert_eq!(err.code(), code, "code {code:?} was not preserved");
        assert_eq!(err.message(), "the exact message");
    }
}

// A server returning CANCELLED is reported verbatim, not reinterpreted
// as a local cancellation, and its trailer metadata survives.
#[tokio::test]
async fn server_returned_cancelled_is_not_masked() {
    let (_server, target) = start_server(
        Server::builder()
            .add_service(failing_service(Code::Cancelled, "server returned Canceled"))
            .build(),
    );
    let channel = connect(&target);
    let err = channel
        .unary("/test.Fail/Fail", Request::new("x".to_string()), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    assert_eq!(err.message(), "server returned Canceled");
    assert_eq!(err.metadata().get("key"), Some("value"));
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);
    let err = channel
        .unary(
            "/echo.Echo/DoesNotExist",
            Request::new("x".to_string()),
            TextCodec,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    // Method lookup is case-sensitive.
    let err = channel
        .unary(
            "/echo.Echo/unaryecho",
            Request::new("x".to_string()),
            TextCodec,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn metadata_round_trips_to_handler_and_back() {
    let service = Service::new("test.Meta").unary(
        "Inspect",
        TextCodec,
        |request: Request<String>| async move {
            let ascii = request.metadata().get("x-token").unwrap_or("missing");
            let binary = request
                .metadata()
                .get_bin("x-blob-bin")
                .map(|b| b.to_vec())
                .unwrap_or_default();

            let mut response = Response::new(format!("{ascii}:{binary:?}"));
            response.metadata_mut().insert("x-reply", "ok").unwrap();
            Ok(response)
        },
    );
    let (_server, target) = start_server(Server::builder().add_service(service).build());
    let channel = connect(&target);

    let mut request = Request::new("x".to_string());
    request.metadata_mut().insert("x-token", "abc").unwrap();
    request
        .metadata_mut()
        .insert_bin("x-blob-bin", &[1, 2, 3])
        .unwrap();

    let response = channel
        .unary("/test.Meta/Inspect", request, TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "abc:[1, 2, 3]");
    assert_eq!(response.metadata().get("x-reply"), Some("ok"));
}

#[tokio::test]
async fn compressed_round_trip() {
    let (_server, target) = start_server(
        Server::builder()
            .add_service(echo_service())
            .accept_compression(CompressionEncoding::Gzip)
            .send_compression(CompressionEncoding::Gzip)
            .build(),
    );

    let mut options = ChannelOptions::default();
    options.send_compression = Some(CompressionEncoding::Gzip);
    options.accept_compression.enable(CompressionEncoding::Gzip);
    let channel = Channel::new(&target, None, options).unwrap();

    let body = "squeeze me ".repeat(4096);
    let response = channel
        .unary(UNARY_ECHO, Request::new(body.clone()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), &body);
}

// Compression asymmetry: a client compressing toward a server that does
// not accept it fails with UNIMPLEMENTED.
#[tokio::test]
async fn client_only_compression_is_unimplemented() {
    let (_server, target) = start_echo_server();

    let mut options = ChannelOptions::default();
    options.send_compression = Some(CompressionEncoding::Gzip);
    let channel = Channel::new(&target, None, options).unwrap();

    let err = channel
        .unary(UNARY_ECHO, Request::new("x".to_string()), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn oversize_response_is_resource_exhausted() {
    let (_server, target) = start_echo_server();

    let mut options = ChannelOptions::default();
    options.max_recv_message_size = Some(64);
    let channel = Channel::new(&target, None, options).unwrap();

    let err = channel
        .unary(UNARY_ECHO, Request::new("x".repeat(1024)), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
}

#[tokio::test]
async fn oversize_request_is_rejected_locally() {
    let (_server, target) = start_echo_server();

    let mut options = ChannelOptions::default();
    options.max_send_message_size = Some(64);
    let channel = Channel::new(&target, None, options).unwrap();

    let err = channel
        .unary(UNARY_ECHO, Request::new("x".repeat(1024)), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
}
