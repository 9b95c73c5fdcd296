/*
 *
 * Copyright 2026 roam authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The channel: a virtual, persistent connection to a service name.
//!
//! A channel owns a name resolver, an LB policy and the policy's
//! subchannels. Resolver updates, subchannel state changes and policy
//! work requests are all funneled through one work queue and processed by
//! a single task, so the policy never observes its own callbacks
//! concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::load_balancing::{
    pick_first, ChannelController, FailingPicker, LbPolicy, LbPolicyOptions, LbState, Picker,
    QueuingPicker, Subchannel, SubchannelState, WorkScheduler, GLOBAL_LB_REGISTRY,
};
use super::name_resolution::{
    Address, Resolver, ResolverBuilder, ResolverOptions, ResolverState, Target,
    GLOBAL_RESOLVER_REGISTRY,
};
use super::subchannel::{InternalSubchannel, SubchannelHandle};
use super::ConnectivityState;
use crate::codec::{CompressionEncoding, EnabledCompressionEncodings};
use crate::credentials::{InsecureCredentials, TransportCredentials};
use crate::interceptor::{ClientStreamInterceptor, ClientUnaryInterceptor};
use crate::service_config::{RetryThrottler, RetryThrottlingConfig, ServiceConfig};
use crate::transport::Http2Settings;
use crate::Status;

/// Scheme assumed when the target string has no registered scheme.
const DEFAULT_SCHEME: &str = "dns";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Static configuration of a channel.
pub struct ChannelOptions {
    /// Overrides the `:authority` derived from the target.
    pub authority_override: Option<String>,
    /// Service config JSON applied when the resolver does not supply one
    /// (or when resolver configs are disabled). Validated at channel
    /// creation.
    pub default_service_config: Option<String>,
    /// Ignore service configs from the resolver entirely.
    pub disable_resolver_service_config: bool,
    /// How long the channel may sit without calls before parking itself
    /// in IDLE. `None` disables idling.
    pub idle_timeout: Option<Duration>,
    /// HTTP/2 transport knobs applied to every connection.
    pub http2: Http2Settings,
    /// Compression encodings accepted in responses, announced via
    /// `grpc-accept-encoding`.
    pub accept_compression: EnabledCompressionEncodings,
    /// Compression applied to request messages by default.
    pub send_compression: Option<CompressionEncoding>,
    /// `user-agent` prefix sent on every call.
    pub user_agent: Option<String>,
    /// Cap on decoded response message size.
    pub max_recv_message_size: Option<usize>,
    /// Cap on request message size.
    pub max_send_message_size: Option<usize>,
    /// Interceptors around unary calls, outermost first.
    pub unary_interceptors: Vec<Arc<dyn ClientUnaryInterceptor>>,
    /// Interceptors around streaming call establishment, outermost
    /// first.
    pub stream_interceptors: Vec<Arc<dyn ClientStreamInterceptor>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            authority_override: None,
            default_service_config: None,
            disable_resolver_service_config: false,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            http2: Http2Settings::default(),
            accept_compression: EnabledCompressionEncodings::default(),
            send_compression: None,
            user_agent: None,
            max_recv_message_size: None,
            max_send_message_size: None,
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
        }
    }
}

/// Work processed by the channel's serializer task, in submission order.
pub(crate) enum WorkItem {
    ResolverState(ResolverState, oneshot::Sender<Result<(), String>>),
    ResolverError(Status),
    SubchannelUpdate(u64, SubchannelState),
    /// Run the LB policy's `work` method.
    Work,
    /// Exit idle (or no-op when already active).
    Connect,
    EnterIdle,
    Close,
}

pub(crate) type WorkQueueTx = mpsc::UnboundedSender<WorkItem>;

/// The picker currently routing calls, versioned so queued picks can wait
/// for the next publication.
#[derive(Clone)]
pub(crate) struct PickerSnapshot {
    pub(crate) version: u64,
    pub(crate) state: ConnectivityState,
    pub(crate) picker: Option<Arc<dyn Picker>>,
}

/// The service config governing new calls.
#[derive(Clone, Default)]
pub(crate) struct ConfigSnapshot {
    pub(crate) config: Option<Arc<ServiceConfig>>,
    pub(crate) throttler: Option<Arc<RetryThrottler>>,
}

/// Immutable pieces shared between the channel handle, the serializer and
/// subchannels.
pub(crate) struct ChannelCtx {
    pub(crate) target: Target,
    pub(crate) authority: String,
    pub(crate) options: ChannelOptions,
    pub(crate) credentials: Arc<dyn TransportCredentials>,
    pub(crate) work_tx: WorkQueueTx,
    pub(crate) active_calls: AtomicUsize,
    pub(crate) last_activity: Mutex<Instant>,
    next_subchannel_id: AtomicU64,
}

pub(crate) struct ChannelInner {
    pub(crate) ctx: Arc<ChannelCtx>,
    pub(crate) picker_rx: watch::Receiver<PickerSnapshot>,
    pub(crate) connectivity_rx: watch::Receiver<ConnectivityState>,
    pub(crate) config_rx: watch::Receiver<ConfigSnapshot>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let _ = self.ctx.work_tx.send(WorkItem::Close);
    }
}

/// A virtual connection to the service named by a target string.
///
/// Cheap to clone; all clones share the same connections. Channels start
/// IDLE and connect on the first call (or an explicit [`connect`]).
///
/// [`connect`]: Channel::connect
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    /// Creates a channel for `target`.
    ///
    /// `credentials` defaults to insecure (plaintext) when `None`. Fails
    /// on unparseable targets and invalid default service configs;
    /// connectivity problems surface on calls instead.
    pub fn new(
        target: &str,
        credentials: Option<Arc<dyn TransportCredentials>>,
        options: ChannelOptions,
    ) -> Result<Channel, crate::Error> {
        let (target, resolver_builder) = resolve_target(target)?;

        let credentials =
            credentials.unwrap_or_else(|| Arc::new(InsecureCredentials) as Arc<_>);
        let authority = options
            .authority_override
            .clone()
            .unwrap_or_else(|| resolver_builder.default_authority(&target));

        let default_config = options
            .default_service_config
            .as_deref()
            .map(ServiceConfig::parse)
            .transpose()
            .map_err(|e| format!("invalid default service config: {e}"))?
            .map(Arc::new);

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (picker_tx, picker_rx) = watch::channel(PickerSnapshot {
            version: 0,
            state: ConnectivityState::Idle,
            picker: None,
        });
        let (connectivity_tx, connectivity_rx) = watch::channel(ConnectivityState::Idle);
        let (config_tx, config_rx) = watch::channel(ConfigSnapshot {
            config: default_config.clone(),
            throttler: None,
        });

        let ctx = Arc::new(ChannelCtx {
            target,
            authority,
            options,
            credentials,
            work_tx,
            active_calls: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            next_subchannel_id: AtomicU64::new(1),
        });

        let actor = ChannelActor {
            ctx: ctx.clone(),
            picker_tx,
            connectivity_tx,
            config_tx,
            resolver_builder,
            default_config,
            active: None,
            last_resolver_state: None,
            throttler: None,
            picker_version: 0,
            closed: false,
        };
        tokio::spawn(actor.run(work_rx));

        let inner = Arc::new(ChannelInner {
            ctx: ctx.clone(),
            picker_rx,
            connectivity_rx,
            config_rx,
        });

        if let Some(idle_timeout) = inner.ctx.options.idle_timeout {
            spawn_idle_timer(Arc::downgrade(&ctx), idle_timeout);
        }

        Ok(Channel { inner })
    }

    /// The channel's target.
    pub fn target(&self) -> String {
        self.inner.ctx.target.to_string()
    }

    /// The default `:authority` used for calls on this channel.
    pub fn authority(&self) -> &str {
        &self.inner.ctx.authority
    }

    /// Moves an IDLE channel to CONNECTING: starts resolution and hands
    /// the result to the LB policy. Idempotent.
    pub fn connect(&self) {
        let _ = self.inner.ctx.work_tx.send(WorkItem::Connect);
    }

    /// The current aggregated connectivity state.
    pub fn state(&self) -> ConnectivityState {
        *self.inner.connectivity_rx.borrow()
    }

    /// Suspends until the state differs from `prev` or the timeout fires;
    /// returns whether a change was observed.
    pub async fn wait_for_state_change(
        &self,
        prev: ConnectivityState,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut rx = self.inner.connectivity_rx.clone();
        loop {
            if *rx.borrow_and_update() != prev {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Err(_elapsed) => return false,
                Ok(Err(_closed)) => return false,
                Ok(Ok(())) => {}
            }
        }
    }

    /// Closes the channel: SHUTDOWN is terminal. Pending picks fail with
    /// `Cancelled`; attached calls fail as their transports close.
    pub fn close(&self) {
        let _ = self.inner.ctx.work_tx.send(WorkItem::Close);
    }
}

/// Parses the target, falling back to the default scheme when the
/// scheme is missing or unregistered.
fn resolve_target(target: &str) -> Result<(Target, Arc<dyn ResolverBuilder>), crate::Error> {
    if let Ok(parsed) = Target::parse(target) {
        if let Some(builder) = GLOBAL_RESOLVER_REGISTRY.get(parsed.scheme()) {
            return Ok((parsed, builder));
        }
    }
    let fallback = format!("{DEFAULT_SCHEME}:///{target}");
    let parsed = Target::parse(&fallback)?;
    let builder = GLOBAL_RESOLVER_REGISTRY
        .get(parsed.scheme())
        .ok_or_else(|| format!("no resolver for target {target:?}"))?;
    Ok((parsed, builder))
}

fn spawn_idle_timer(ctx: Weak<ChannelCtx>, idle_timeout: Duration) {
    let check_every = (idle_timeout / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(check_every).await;
            let Some(ctx) = ctx.upgrade() else { return };
            let idle_for = ctx.last_activity.lock().elapsed();
            if ctx.active_calls.load(Ordering::Relaxed) == 0 && idle_for >= idle_timeout {
                let _ = ctx.work_tx.send(WorkItem::EnterIdle);
            }
        }
    });
}

struct ActiveState {
    resolver: Box<dyn Resolver>,
    policy: Option<PolicyState>,
    seen_first_update: bool,
}

struct PolicyState {
    name: String,
    policy: Box<dyn LbPolicy>,
    subchannels: HashMap<u64, Arc<dyn Subchannel>>,
}

struct ChannelActor {
    ctx: Arc<ChannelCtx>,
    picker_tx: watch::Sender<PickerSnapshot>,
    connectivity_tx: watch::Sender<ConnectivityState>,
    config_tx: watch::Sender<ConfigSnapshot>,
    resolver_builder: Arc<dyn ResolverBuilder>,
    default_config: Option<Arc<ServiceConfig>>,
    active: Option<ActiveState>,
    /// Retained across idle cycles so the channel can come back without
    /// waiting for resolution.
    last_resolver_state: Option<ResolverState>,
    throttler: Option<(RetryThrottlingConfig, Arc<RetryThrottler>)>,
    picker_version: u64,
    closed: bool,
}

impl ChannelActor {
    async fn run(mut self, mut work_rx: mpsc::UnboundedReceiver<WorkItem>) {
        while let Some(item) = work_rx.recv().await {
            match item {
                WorkItem::Connect => self.ensure_active(),
                WorkItem::ResolverState(state, ack) => {
                    let result = self.handle_resolver_state(state);
                    let _ = ack.send(result);
                }
                WorkItem::ResolverError(error) => self.handle_resolver_error(error),
                WorkItem::SubchannelUpdate(id, state) => {
                    self.handle_subchannel_update(id, state)
                }
                WorkItem::Work => {
                    self.with_policy(|policy, controller| policy.work(controller));
                }
                WorkItem::EnterIdle => self.enter_idle(),
                WorkItem::Close => {
                    self.close();
                    break;
                }
            }
        }
        trace!("channel serializer for {} exiting", self.ctx.target);
    }

    fn ensure_active(&mut self) {
        if self.closed {
            return;
        }
        if self.active.is_some() {
            self.with_policy(|policy, controller| policy.exit_idle(controller));
            return;
        }

        debug!("channel {} exiting idle", self.ctx.target);
        self.set_connectivity(ConnectivityState::Connecting);
        self.publish_picker(ConnectivityState::Connecting, Arc::new(QueuingPicker));

        let controller = Arc::new(ResolverBridge {
            work_tx: self.ctx.work_tx.clone(),
        });
        let resolver = self.resolver_builder.build(
            &self.ctx.target,
            ResolverOptions {
                authority: self.ctx.authority.clone(),
                controller,
            },
        );
        self.active = Some(ActiveState {
            resolver,
            policy: None,
            seen_first_update: false,
        });

        // Coming back from idle: replay the retained state instead of
        // waiting on the resolver.
        if let Some(state) = self.last_resolver_state.clone() {
            let _ = self.handle_resolver_state(state);
        }
    }

    fn handle_resolver_state(&mut self, state: ResolverState) -> Result<(), String> {
        if self.closed || self.active.is_none() {
            return Err("channel is idle or closed".to_string());
        }

        // Service config selection: resolver config unless disabled,
        // falling back to the channel default.
        let resolver_config = if self.ctx.options.disable_resolver_service_config {
            None
        } else {
            state.service_config.clone()
        };
        let config = match resolver_config {
            Some(Ok(config)) => Some(Arc::new(config)),
            Some(Err(parse_error)) => match &self.default_config {
                Some(default) => Some(default.clone()),
                None => {
                    let message = format!("invalid service config: {parse_error}");
                    warn!("{message}");
                    self.handle_resolver_error(Status::unavailable(message.clone()));
                    return Err(message);
                }
            },
            None => self.default_config.clone(),
        };

        let policy_name = config
            .as_ref()
            .and_then(|c| c.lb_policy.as_ref())
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| pick_first::POLICY_NAME.to_string());

        let builder = GLOBAL_LB_REGISTRY
            .get(&policy_name)
            .ok_or_else(|| format!("no registered LB policy {policy_name:?}"))?;

        let lb_config = match config.as_ref().and_then(|c| c.lb_policy.as_ref()) {
            Some((_, raw)) => builder
                .parse_config(raw)
                .map_err(|e| format!("invalid {policy_name} config: {e}"))?,
            None => None,
        };

        // Swap the policy if the config selected a different one.
        let active = self.active.as_mut().expect("checked above");
        let needs_rebuild = active
            .policy
            .as_ref()
            .map(|p| p.name != policy_name)
            .unwrap_or(true);
        if needs_rebuild {
            if let Some(old) = active.policy.take() {
                debug!("replacing LB policy {} with {}", old.name, policy_name);
                for subchannel in old.subchannels.values() {
                    subchannel.shutdown();
                }
            }
            let policy = builder.build(LbPolicyOptions {
                work_scheduler: Arc::new(QueueWorkScheduler {
                    work_tx: self.ctx.work_tx.clone(),
                }),
            });
            active.policy = Some(PolicyState {
                name: policy_name,
                policy,
                subchannels: HashMap::new(),
            });
        }
        active.seen_first_update = true;

        self.publish_config(config);
        self.last_resolver_state = Some(state.clone());

        match self.with_policy(move |policy, controller| {
            policy.resolver_update(state, lb_config.as_ref(), controller)
        }) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(e.to_string()),
            None => Err("channel has no active LB policy".to_string()),
        }
    }

    fn handle_resolver_error(&mut self, error: Status) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !active.seen_first_update {
            // No usable state yet: the whole channel is failing.
            let status = Status::unavailable(format!("name resolution failed: {}", error.message()));
            self.set_connectivity(ConnectivityState::TransientFailure);
            self.publish_picker(
                ConnectivityState::TransientFailure,
                Arc::new(FailingPicker::new(status)),
            );
        }
        self.with_policy(|policy, controller| policy.resolver_error(error, controller));
    }

    fn handle_subchannel_update(&mut self, id: u64, state: SubchannelState) {
        let handle = self
            .active
            .as_ref()
            .and_then(|a| a.policy.as_ref())
            .and_then(|p| p.subchannels.get(&id))
            .cloned();
        let Some(handle) = handle else { return };

        let is_shutdown = state.connectivity_state == ConnectivityState::Shutdown;
        self.with_policy(|policy, controller| {
            policy.subchannel_update(&handle, &state, controller)
        });
        if is_shutdown {
            if let Some(policy) = self.active.as_mut().and_then(|a| a.policy.as_mut()) {
                policy.subchannels.remove(&id);
            }
        }
    }

    fn enter_idle(&mut self) {
        if self.closed || self.ctx.active_calls.load(Ordering::Relaxed) > 0 {
            return;
        }
        let Some(active) = self.active.take() else { return };
        debug!("channel {} entering idle", self.ctx.target);
        if let Some(policy) = active.policy {
            for subchannel in policy.subchannels.values() {
                subchannel.shutdown();
            }
        }
        drop(active.resolver);
        self.set_connectivity(ConnectivityState::Idle);
        self.picker_version += 1;
        self.picker_tx.send_replace(PickerSnapshot {
            version: self.picker_version,
            state: ConnectivityState::Idle,
            picker: None,
        });
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("channel {} shutting down", self.ctx.target);
        if let Some(active) = self.active.take() {
            if let Some(policy) = active.policy {
                for subchannel in policy.subchannels.values() {
                    // Closing the channel fails attached calls instead of
                    // draining them.
                    match subchannel.as_any().downcast_ref::<SubchannelHandle>() {
                        Some(handle) => handle.inner.shutdown_now(),
                        None => subchannel.shutdown(),
                    }
                }
            }
        }
        self.set_connectivity(ConnectivityState::Shutdown);
        self.picker_version += 1;
        self.picker_tx.send_replace(PickerSnapshot {
            version: self.picker_version,
            state: ConnectivityState::Shutdown,
            picker: None,
        });
    }

    fn publish_config(&mut self, config: Option<Arc<ServiceConfig>>) {
        let throttler = match config.as_ref().and_then(|c| c.retry_throttling) {
            Some(throttling) => match &self.throttler {
                // Keep the bucket (and its token count) while the
                // parameters are unchanged.
                Some((existing, arc)) if *existing == throttling => Some(arc.clone()),
                _ => {
                    let arc = Arc::new(RetryThrottler::new(throttling));
                    self.throttler = Some((throttling, arc.clone()));
                    Some(arc)
                }
            },
            None => {
                self.throttler = None;
                None
            }
        };
        self.config_tx.send_replace(ConfigSnapshot { config, throttler });
    }

    fn set_connectivity(&self, state: ConnectivityState) {
        self.connectivity_tx.send_if_modified(|current| {
            // Shutdown is terminal.
            if *current == state || *current == ConnectivityState::Shutdown {
                return false;
            }
            trace!("channel {} {} -> {}", self.ctx.target, current, state);
            *current = state;
            true
        });
    }

    fn publish_picker(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.picker_version += 1;
        self.picker_tx.send_replace(PickerSnapshot {
            version: self.picker_version,
            state,
            picker: Some(picker),
        });
    }

    fn with_policy<R>(
        &mut self,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn ChannelController) -> R,
    ) -> Option<R> {
        let active = self.active.as_mut()?;
        let mut policy_state = active.policy.take()?;

        let mut controller = ActorController {
            subchannels: &mut policy_state.subchannels,
            ctx: &self.ctx,
            picker_tx: &self.picker_tx,
            connectivity_tx: &self.connectivity_tx,
            picker_version: &mut self.picker_version,
            resolve_now: false,
        };
        let result = f(policy_state.policy.as_mut(), &mut controller);
        let resolve_now = controller.resolve_now;

        active.policy = Some(policy_state);
        if resolve_now {
            active.resolver.resolve_now();
        }
        Some(result)
    }
}

/// The `ChannelController` handed to LB policy callbacks; applies effects
/// directly to the serializer's state.
struct ActorController<'a> {
    subchannels: &'a mut HashMap<u64, Arc<dyn Subchannel>>,
    ctx: &'a Arc<ChannelCtx>,
    picker_tx: &'a watch::Sender<PickerSnapshot>,
    connectivity_tx: &'a watch::Sender<ConnectivityState>,
    picker_version: &'a mut u64,
    resolve_now: bool,
}

impl ChannelController for ActorController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let id = self.ctx.next_subchannel_id.fetch_add(1, Ordering::Relaxed);
        let internal = InternalSubchannel::new(
            id,
            address.clone(),
            &self.ctx.authority,
            self.ctx.credentials.clone(),
            self.ctx.options.http2.clone(),
            self.ctx.work_tx.clone(),
        );
        let handle: Arc<dyn Subchannel> = Arc::new(SubchannelHandle { inner: internal });
        self.subchannels.insert(id, handle.clone());
        handle
    }

    fn update_picker(&mut self, update: LbState) {
        *self.picker_version += 1;
        self.picker_tx.send_replace(PickerSnapshot {
            version: *self.picker_version,
            state: update.connectivity_state,
            picker: Some(update.picker),
        });
        self.connectivity_tx.send_if_modified(|current| {
            if *current == update.connectivity_state || *current == ConnectivityState::Shutdown {
                return false;
            }
            *current = update.connectivity_state;
            true
        });
    }

    fn request_resolution(&mut self) {
        self.resolve_now = true;
    }
}

/// Sends `work` requests from LB policies into the serializer.
struct QueueWorkScheduler {
    work_tx: WorkQueueTx,
}

impl WorkScheduler for QueueWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.work_tx.send(WorkItem::Work);
    }
}

/// The resolver's view of the channel.
struct ResolverBridge {
    work_tx: WorkQueueTx,
}

#[async_trait]
impl super::name_resolution::ChannelController for ResolverBridge {
    async fn update(&self, state: ResolverState) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.work_tx
            .send(WorkItem::ResolverState(state, tx))
            .map_err(|_| "channel closed".to_string())?;
        rx.await.map_err(|_| "channel closed".to_string())?
    }

    fn report_error(&self, error: Status) {
        let _ = self.work_tx.send(WorkItem::ResolverError(error));
    }

    fn parse_service_config(&self, json: &str) -> Result<ServiceConfig, String> {
        ServiceConfig::parse(json)
    }
}
