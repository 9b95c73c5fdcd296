//! Channel lifecycle: connectivity states, close semantics, idle mode
//! and load-balancing across backends.

use std::time::Duration;

use integration_tests::*;
use roam::{Channel, ChannelOptions, Code, ConnectivityState, Request};

#[tokio::test]
async fn channel_starts_idle_and_becomes_ready() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);
    assert_eq!(channel.state(), ConnectivityState::Idle);

    channel.connect();
    // IDLE -> CONNECTING happens promptly...
    assert!(
        channel
            .wait_for_state_change(ConnectivityState::Idle, Duration::from_secs(5))
            .await
    );
    // ...and the channel settles READY without any call being made.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while channel.state() != ConnectivityState::Ready {
        assert!(
            tokio::time::Instant::now() < deadline,
            "channel never became READY (stuck in {})",
            channel.state()
        );
        channel
            .wait_for_state_change(channel.state(), Duration::from_millis(500))
            .await;
    }
}

#[tokio::test]
async fn wait_for_state_change_times_out() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);
    // No call, no connect: the state stays IDLE past the timeout.
    assert!(
        !channel
            .wait_for_state_change(ConnectivityState::Idle, Duration::from_millis(200))
            .await
    );
}

#[tokio::test]
async fn close_is_terminal_and_fails_calls() {
    let (_server, target) = start_echo_server();
    let channel = connect(&target);

    let response = channel
        .unary(UNARY_ECHO, Request::new("x".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "x");

    channel.close();
    channel
        .wait_for_state_change(ConnectivityState::Ready, Duration::from_secs(5))
        .await;
    assert_eq!(channel.state(), ConnectivityState::Shutdown);

    let err = channel
        .unary(UNARY_ECHO, Request::new("y".to_string()), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);

    // connect() after close must not resurrect the channel.
    channel.connect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.state(), ConnectivityState::Shutdown);
}

#[tokio::test]
async fn idle_channel_parks_and_revives() {
    let (_server, target) = start_echo_server();

    let mut options = ChannelOptions::default();
    options.idle_timeout = Some(Duration::from_millis(1200));
    let channel = Channel::new(&target, None, options).unwrap();

    channel
        .unary(UNARY_ECHO, Request::new("x".to_string()), TextCodec)
        .await
        .unwrap();

    // With no further calls the channel parks itself.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while channel.state() != ConnectivityState::Idle {
        assert!(
            tokio::time::Instant::now() < deadline,
            "channel never entered idle (state {})",
            channel.state()
        );
        channel
            .wait_for_state_change(channel.state(), Duration::from_millis(500))
            .await;
    }

    // The next call revives it from the retained resolver state.
    let response = channel
        .unary(UNARY_ECHO, Request::new("revived".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "revived");
}

#[tokio::test]
async fn round_robin_spreads_calls_across_backends() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    roam::inmemory::register();

    // Two backends, each counting the calls it serves.
    let mut targets = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..2 {
        let counter = Arc::new(AtomicUsize::new(0));
        let service = {
            let counter = counter.clone();
            roam::Service::new("echo.Echo").unary(
                "UnaryEcho",
                TextCodec,
                move |request: Request<String>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(roam::Response::new(request.into_inner()))
                    }
                },
            )
        };
        let (_server, target) =
            start_server(roam::Server::builder().add_service(service).build());
        counters.push(counter);
        targets.push(target);
    }

    // A resolver state with both backends, via a custom registered
    // scheme would be overkill here: the inmemory scheme resolves one
    // listener per target, so use a multi-endpoint resolver instead.
    let endpoints: Vec<String> = targets
        .iter()
        .map(|t| t.trim_start_matches("inmemory:///").to_string())
        .collect();
    multi::register(endpoints);

    let mut options = ChannelOptions::default();
    options.default_service_config =
        Some(r#"{"loadBalancingConfig": [{"round_robin": {}}]}"#.to_string());
    let channel = Channel::new("multi:///backends", None, options).unwrap();

    for i in 0..10 {
        channel
            .unary(UNARY_ECHO, Request::new(format!("{i}")), TextCodec)
            .await
            .unwrap();
    }

    let served: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(served.iter().sum::<usize>(), 10);
    assert!(
        served.iter().all(|&n| n >= 2),
        "calls were not spread: {served:?}"
    );
}

/// A resolver scheme returning a fixed set of in-memory endpoints.
mod multi {
    use std::sync::Once;

    use parking_lot::Mutex;
    use roam::client::name_resolution::{
        Address, Endpoint, Resolver, ResolverBuilder, ResolverOptions, ResolverState, Target,
        GLOBAL_RESOLVER_REGISTRY,
    };

    static ENDPOINTS: Mutex<Vec<String>> = Mutex::new(Vec::new());
    static REGISTER: Once = Once::new();

    pub fn register(endpoints: Vec<String>) {
        *ENDPOINTS.lock() = endpoints;
        REGISTER.call_once(|| {
            GLOBAL_RESOLVER_REGISTRY.add_builder(MultiResolverBuilder);
        });
    }

    struct MultiResolverBuilder;

    impl ResolverBuilder for MultiResolverBuilder {
        fn scheme(&self) -> &'static str {
            "multi"
        }

        fn build(&self, _target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
            let endpoints = ENDPOINTS
                .lock()
                .iter()
                .map(|id| Endpoint {
                    addresses: vec![Address {
                        transport_type: "inmemory".to_string(),
                        addr: id.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .collect();
            let state = ResolverState {
                endpoints: Some(endpoints),
                ..Default::default()
            };
            let controller = options.controller;
            Box::new(PushOnce {
                task: Some(tokio::spawn(async move {
                    let _ = controller.update(state).await;
                })),
            })
        }
    }

    struct PushOnce {
        task: Option<tokio::task::JoinHandle<()>>,
    }

    impl Resolver for PushOnce {
        fn resolve_now(&mut self) {}
    }

    impl Drop for PushOnce {
        fn drop(&mut self) {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }
}
