//! Deadline propagation and cancellation.

use std::time::Duration;

use futures_util::stream;
use integration_tests::*;
use roam::context::CallContext;
use roam::server::ResponseStream;
use roam::{Channel, ChannelOptions, Code, Request, Response, Server, Service};

fn sleepy_service() -> Service {
    Service::new("test.Sleepy").unary("Sleep", TextCodec, |_req: Request<String>| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Response::new("too late".to_string()))
    })
}

#[tokio::test]
async fn deadline_fires_on_slow_handler() {
    let (_server, target) = start_server(Server::builder().add_service(sleepy_service()).build());
    let channel = connect(&target);

    let mut request = Request::new("x".to_string());
    request.set_timeout(Duration::from_millis(200));

    let started = tokio::time::Instant::now();
    let err = channel
        .unary("/test.Sleepy/Sleep", request, TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    // Observed no later than the deadline plus scheduling slack.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn deadline_is_propagated_to_the_server_context() {
    let service = Service::new("test.Deadline").unary(
        "Check",
        TextCodec,
        |request: Request<String>| async move {
            let context = request
                .extensions()
                .get::<CallContext>()
                .expect("handlers see the call context");
            let remaining = context.time_remaining().expect("deadline was propagated");
            Ok(Response::new(format!("{}", remaining.as_secs())))
        },
    );
    let (_server, target) = start_server(Server::builder().add_service(service).build());
    let channel = connect(&target);

    let mut request = Request::new("x".to_string());
    request.set_timeout(Duration::from_secs(3600));
    let response = channel
        .unary("/test.Deadline/Check", request, TextCodec)
        .await
        .unwrap();
    let seconds: u64 = response.get_ref().parse().unwrap();
    assert!(seconds > 3500, "server saw {seconds}s remaining");
}

// The method-config timeout applies when the caller sets no deadline.
#[tokio::test]
async fn method_config_timeout_applies() {
    let (_server, target) = start_server(Server::builder().add_service(sleepy_service()).build());

    let mut options = ChannelOptions::default();
    options.default_service_config = Some(
        r#"{"methodConfig": [{
            "name": [{"service": "test.Sleepy", "method": "Sleep"}],
            "timeout": "0.2s"
        }]}"#
            .to_string(),
    );
    let channel = Channel::new(&target, None, options).unwrap();

    let err = channel
        .unary("/test.Sleepy/Sleep", Request::new("x".to_string()), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

// Cancelling a streaming call (by dropping it) marks the server
// handler's context done promptly.
#[tokio::test]
async fn client_cancellation_reaches_the_server() {
    let (cancelled_tx, cancelled_rx) = tokio::sync::oneshot::channel::<()>();
    let cancelled_tx = parking_lot::Mutex::new(Some(cancelled_tx));

    let service = Service::new("test.Cancel").streaming(
        "Watch",
        TextCodec,
        move |request: Request<roam::Streaming<String>>| {
            let cancelled_tx = cancelled_tx.lock().take();
            async move {
                let context = request
                    .extensions()
                    .get::<CallContext>()
                    .expect("handlers see the call context")
                    .clone();
                tokio::spawn(async move {
                    context.done().await;
                    if let Some(tx) = cancelled_tx {
                        let _ = tx.send(());
                    }
                });
                // Never produce a message; wait for the peer to go away.
                let stream: ResponseStream<String> = Box::pin(futures_util::stream::pending());
                Ok(Response::new(stream))
            }
        },
    );
    let (_server, target) = start_server(Server::builder().add_service(service).build());
    let channel = connect(&target);

    let outbound = stream::iter(vec!["x".to_string()]);
    let response = channel
        .streaming("/test.Cancel/Watch", Request::new(outbound), TextCodec)
        .await
        .unwrap();

    // Dropping the response stream resets the HTTP/2 stream.
    drop(response);

    tokio::time::timeout(Duration::from_secs(5), cancelled_rx)
        .await
        .expect("server context was not marked done")
        .unwrap();
}

// A queued call (no connection available) fails with DEADLINE_EXCEEDED
// at its deadline rather than waiting forever.
#[tokio::test]
async fn queued_pick_respects_the_deadline() {
    // A listener nobody serves: connections are accepted into the void,
    // so the channel never becomes READY.
    let listener = roam::inmemory::Listener::new();
    let target = listener.target();
    let channel = connect(&target);

    let mut request = Request::new("x".to_string());
    request.set_timeout(Duration::from_millis(300));
    let err = channel
        .unary(UNARY_ECHO, request, TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}
