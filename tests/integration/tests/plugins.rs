//! The plugin surfaces: LB policies and pickers, status laundering,
//! health listeners, resolver authorities and interceptors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use integration_tests::*;
use parking_lot::Mutex;
use roam::client::load_balancing::{
    ChannelController, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, PickInfo,
    PickResult, Picker, Subchannel, SubchannelState, GLOBAL_LB_REGISTRY,
};
use roam::client::name_resolution::{ResolverState, Target, GLOBAL_RESOLVER_REGISTRY};
use roam::client::ConnectivityState;
use roam::interceptor::{
    ClientUnaryInterceptor, ClientUnaryNext, MethodInfo, ServerStreamInterceptor,
    ServerStreamNext, ServerUnaryInterceptor, ServerUnaryNext,
};
use roam::metadata::MetadataMap;
use roam::{
    async_trait, Channel, ChannelOptions, Code, Request, Response, Server, Status,
};

// Test policies wrap pick_first and rewrite the picker results so the
// channel-side laundering can be observed end to end.
struct RewriteBuilder {
    name: &'static str,
    code: Code,
}

struct RewritePolicy {
    inner: Box<dyn LbPolicy>,
    code: Code,
}

struct RewritePicker {
    code: Code,
}

impl Picker for RewritePicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Drop(Status::new(self.code, "x"))
    }
}

impl LbPolicyBuilder for RewriteBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        let inner = GLOBAL_LB_REGISTRY
            .get("pick_first")
            .unwrap()
            .build(options);
        Box::new(RewritePolicy {
            inner,
            code: self.code,
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Intercepts picker updates, replacing READY pickers with a failing
/// picker carrying a fixed code.
struct RewriteController<'a> {
    inner: &'a mut dyn ChannelController,
    code: Code,
}

impl ChannelController for RewriteController<'_> {
    fn new_subchannel(
        &mut self,
        address: &roam::client::name_resolution::Address,
    ) -> Arc<dyn Subchannel> {
        self.inner.new_subchannel(address)
    }

    fn update_picker(&mut self, update: LbState) {
        if update.connectivity_state == ConnectivityState::Ready {
            self.inner.update_picker(LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RewritePicker { code: self.code }),
            });
        } else {
            self.inner.update_picker(update);
        }
    }

    fn request_resolution(&mut self) {
        self.inner.request_resolution();
    }
}

impl LbPolicy for RewritePolicy {
    fn resolver_update(
        &mut self,
        update: ResolverState,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), roam::Error> {
        let mut controller = RewriteController {
            inner: channel_controller,
            code: self.code,
        };
        self.inner.resolver_update(update, config, &mut controller)
    }

    fn resolver_error(&mut self, error: Status, channel_controller: &mut dyn ChannelController) {
        let mut controller = RewriteController {
            inner: channel_controller,
            code: self.code,
        };
        self.inner.resolver_error(error, &mut controller)
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let mut controller = RewriteController {
            inner: channel_controller,
            code: self.code,
        };
        self.inner
            .subchannel_update(subchannel, state, &mut controller)
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let mut controller = RewriteController {
            inner: channel_controller,
            code: self.code,
        };
        self.inner.exit_idle(&mut controller)
    }
}

async fn pick_error_through_policy(policy_name: &'static str) -> Status {
    let (_server, target) = start_echo_server();
    let mut options = ChannelOptions::default();
    options.default_service_config =
        Some(format!(r#"{{"loadBalancingConfig": [{{"{policy_name}": {{}}}}]}}"#));
    let channel = Channel::new(&target, None, options).unwrap();
    channel
        .unary(UNARY_ECHO, Request::new("x".to_string()), TextCodec)
        .await
        .unwrap_err()
}

// Picker laundering: NOT_FOUND from a picker reaches the caller as
// INTERNAL with the message preserved; UNAVAILABLE passes through.
#[tokio::test]
async fn picker_status_codes_are_laundered() {
    GLOBAL_LB_REGISTRY.add_builder(RewriteBuilder {
        name: "test_rewrite_not_found",
        code: Code::NotFound,
    });
    GLOBAL_LB_REGISTRY.add_builder(RewriteBuilder {
        name: "test_rewrite_unavailable",
        code: Code::Unavailable,
    });

    let err = pick_error_through_policy("test_rewrite_not_found").await;
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "x");

    let err = pick_error_through_policy("test_rewrite_unavailable").await;
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(err.message(), "x");
}

// Health listener semantics on a live subchannel: replay on
// registration while READY, and replacement silences the predecessor.
struct HealthProbeBuilder {
    events: Arc<Mutex<Vec<(&'static str, ConnectivityState)>>>,
}

struct HealthProbePolicy {
    inner: Box<dyn LbPolicy>,
    events: Arc<Mutex<Vec<(&'static str, ConnectivityState)>>>,
    registered: bool,
}

impl LbPolicyBuilder for HealthProbeBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(HealthProbePolicy {
            inner: GLOBAL_LB_REGISTRY
                .get("pick_first")
                .unwrap()
                .build(options),
            events: self.events.clone(),
            registered: false,
        })
    }

    fn name(&self) -> &'static str {
        "test_health_probe"
    }
}

impl LbPolicy for HealthProbePolicy {
    fn resolver_update(
        &mut self,
        update: ResolverState,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), roam::Error> {
        self.inner
            .resolver_update(update, config, channel_controller)
    }

    fn resolver_error(&mut self, error: Status, channel_controller: &mut dyn ChannelController) {
        self.inner.resolver_error(error, channel_controller)
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.inner
            .subchannel_update(subchannel, state, channel_controller);

        if state.connectivity_state == ConnectivityState::Ready && !self.registered {
            self.registered = true;
            // Registering while READY replays the current health state to
            // the listener; replacing it silences the first one for good.
            let events = self.events.clone();
            subchannel.register_health_listener(Some(Box::new(move |state| {
                events.lock().push(("first", state.connectivity_state));
            })));
            let events = self.events.clone();
            subchannel.register_health_listener(Some(Box::new(move |state| {
                events.lock().push(("second", state.connectivity_state));
            })));
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.inner.exit_idle(channel_controller)
    }
}

#[tokio::test]
async fn health_listener_replacement_and_replay() {
    let events = Arc::new(Mutex::new(Vec::new()));
    GLOBAL_LB_REGISTRY.add_builder(HealthProbeBuilder {
        events: events.clone(),
    });

    let (_server, target) = start_echo_server();
    let mut options = ChannelOptions::default();
    options.default_service_config =
        Some(r#"{"loadBalancingConfig": [{"test_health_probe": {}}]}"#.to_string());
    let channel = Channel::new(&target, None, options).unwrap();

    let response = channel
        .unary(UNARY_ECHO, Request::new("x".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "x");

    let events = events.lock().clone();
    // The currently-registered (second) listener saw the READY replay.
    assert!(events.contains(&("second", ConnectivityState::Ready)));
    // The first listener got at most its own registration replay and
    // nothing after being replaced.
    let first_events = events.iter().filter(|(name, _)| *name == "first").count();
    assert!(first_events <= 1, "silenced listener kept receiving: {events:?}");
}

// Authority derivation per scheme, via the public resolver registry.
#[test]
fn resolver_default_authorities() {
    roam::inmemory::register();
    let cases = [
        ("unix:sock.sock", "localhost"),
        ("unix:/tmp/x", "localhost"),
        ("unix:///tmp/x", "localhost"),
        ("passthrough:///unix:///tmp/x", "unix:%2F%2F%2Ftmp%2Fx"),
        ("dns:///example.com:50051", "example.com:50051"),
    ];
    for (target, want) in cases {
        let target = Target::parse(target).unwrap();
        let builder = GLOBAL_RESOLVER_REGISTRY
            .get(target.scheme())
            .unwrap_or_else(|| panic!("no resolver for {}", target.scheme()));
        assert_eq!(builder.default_authority(&target), want, "{target}");
    }
}

// The :authority actually sent for an in-memory target reaches the
// server handler.
#[tokio::test]
async fn authority_reaches_the_server() {
    use roam::server::CallAuthority;

    let service = roam::Service::new("test.Authority").unary(
        "Get",
        TextCodec,
        |request: Request<String>| async move {
            let authority = request
                .extensions()
                .get::<CallAuthority>()
                .map(|a| a.0.clone())
                .unwrap_or_default();
            Ok(Response::new(authority))
        },
    );
    let (_server, target) = start_server(Server::builder().add_service(service).build());
    let channel = connect(&target);

    let response = channel
        .unary("/test.Authority/Get", Request::new(String::new()), TextCodec)
        .await
        .unwrap();
    // inmemory targets use the endpoint (the listener id) as authority.
    assert_eq!(
        response.get_ref().as_str(),
        target.trim_start_matches("inmemory:///")
    );
}

struct ClientTagger;

#[async_trait]
impl ClientUnaryInterceptor for ClientTagger {
    async fn call(
        &self,
        mut request: Request<Bytes>,
        _info: &MethodInfo,
        next: ClientUnaryNext<'_>,
    ) -> Result<Response<Bytes>, Status> {
        request.metadata_mut().insert("x-tag", "tagged").unwrap();
        next.run(request).await
    }
}

#[tokio::test]
async fn client_interceptor_adds_metadata() {
    let service = roam::Service::new("test.Tag").unary(
        "Check",
        TextCodec,
        |request: Request<String>| async move {
            Ok(Response::new(
                request.metadata().get("x-tag").unwrap_or("missing").to_string(),
            ))
        },
    );
    let (_server, target) = start_server(Server::builder().add_service(service).build());

    let mut options = ChannelOptions::default();
    options.unary_interceptors.push(Arc::new(ClientTagger));
    let channel = Channel::new(&target, None, options).unwrap();

    let response = channel
        .unary("/test.Tag/Check", Request::new("x".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "tagged");
}

// The allow-all-with-deny-stream scenario: an authorization interceptor
// admits unary calls and denies the streaming method, keeping an audit
// count of both outcomes.
struct Authz {
    allowed: Arc<AtomicUsize>,
    denied: Arc<AtomicUsize>,
}

#[async_trait]
impl ServerUnaryInterceptor for Authz {
    async fn call(
        &self,
        request: Request<Bytes>,
        _info: &MethodInfo,
        next: ServerUnaryNext<'_>,
    ) -> Result<Response<Bytes>, Status> {
        self.allowed.fetch_add(1, Ordering::SeqCst);
        next.run(request).await
    }
}

#[async_trait]
impl ServerStreamInterceptor for Authz {
    async fn call(
        &self,
        _metadata: &MetadataMap,
        info: &MethodInfo,
        next: ServerStreamNext<'_>,
    ) -> Result<(), Status> {
        if info.path == BIDI_STREAMING_ECHO {
            self.denied.fetch_add(1, Ordering::SeqCst);
            return Err(Status::permission_denied("denied by policy"));
        }
        self.allowed.fetch_add(1, Ordering::SeqCst);
        next.run().await
    }
}

#[tokio::test]
async fn server_interceptors_allow_unary_and_deny_stream() {
    let allowed = Arc::new(AtomicUsize::new(0));
    let denied = Arc::new(AtomicUsize::new(0));
    let authz = Arc::new(Authz {
        allowed: allowed.clone(),
        denied: denied.clone(),
    });

    let (_server, target) = start_server(
        Server::builder()
            .add_service(echo_service())
            .unary_interceptor(authz.clone())
            .stream_interceptor(authz.clone())
            .build(),
    );
    let channel = connect(&target);

    for _ in 0..2 {
        channel
            .unary(UNARY_ECHO, Request::new("ok".to_string()), TextCodec)
            .await
            .unwrap();
    }

    // The denial arrives as a Trailers-Only response, failing the call
    // at establishment.
    let outbound = futures_util::stream::iter(vec!["x".to_string()]);
    let err = channel
        .streaming(BIDI_STREAMING_ECHO, Request::new(outbound), TextCodec)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    assert_eq!(allowed.load(Ordering::SeqCst), 2);
    assert_eq!(denied.load(Ordering::SeqCst), 1);
}

// Policy-driven retries: the first two attempts fail UNAVAILABLE, the
// third succeeds.
#[tokio::test]
async fn retry_policy_retries_unavailable() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let service = {
        let attempts = attempts.clone();
        roam::Service::new("test.Flaky").unary("Get", TextCodec, move |_req: Request<String>| {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Status::unavailable("try again"))
                } else {
                    Ok(Response::new("finally".to_string()))
                }
            }
        })
    };
    let (_server, target) = start_server(Server::builder().add_service(service).build());

    let mut options = ChannelOptions::default();
    options.default_service_config = Some(
        r#"{"methodConfig": [{
            "name": [{"service": "test.Flaky"}],
            "retryPolicy": {
                "maxAttempts": 3,
                "initialBackoff": "0.01s",
                "maxBackoff": "0.05s",
                "backoffMultiplier": 2.0,
                "retryableStatusCodes": ["UNAVAILABLE"]
            }
        }]}"#
            .to_string(),
    );
    let channel = Channel::new(&target, None, options).unwrap();

    let response = channel
        .unary("/test.Flaky/Get", Request::new("x".to_string()), TextCodec)
        .await
        .unwrap();
    assert_eq!(response.get_ref(), "finally");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
