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

//! Load balancing: converting resolver states into connections and
//! pickers.

pub(crate) mod pick_first;
mod registry;
pub(crate) mod round_robin;

#[cfg(test)]
pub(crate) mod test_utils;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::client::name_resolution::{Address, ResolverState};
use crate::client::ConnectivityState;
use crate::metadata::MetadataMap;
use crate::{Code, Status};

pub use registry::{LbPolicyRegistry, GLOBAL_LB_REGISTRY};

/// Data configured on the channel constructing an LB policy.
pub struct LbPolicyOptions {
    /// Hook into the channel's work serializer, letting the policy
    /// request a `work` call outside any channel-initiated update.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// Requests an asynchronous call into the LB policy's `work` method. If a
/// requested call has not run yet, another request may coalesce with it.
pub trait WorkScheduler: Send + Sync {
    fn schedule_work(&self);
}

/// A factory producing LB policy instances, registered by name.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds a new LB policy instance. Must not fail; configuration
    /// arrives later through `resolver_update`.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// The policy name used in service configs.
    fn name(&self) -> &'static str;

    /// Parses the policy's JSON configuration. Policies without
    /// configuration accept anything.
    fn parse_config(&self, _config: &serde_json::Value) -> Result<Option<LbConfig>, crate::Error> {
        Ok(None)
    }
}

/// An LB policy instance: owns subchannels, publishes pickers.
///
/// All methods are invoked serially on the channel's work serializer; a
/// policy never observes its own callbacks concurrently.
pub trait LbPolicy: Send {
    /// A new resolver state (or service config) arrived. An error return
    /// is surfaced back to the resolver so it can re-resolve.
    fn resolver_update(
        &mut self,
        update: ResolverState,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), crate::Error>;

    /// The resolver failed. A policy with a usable state keeps serving
    /// it.
    fn resolver_error(&mut self, error: Status, channel_controller: &mut dyn ChannelController);

    /// A subchannel created by this policy changed state.
    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Runs work requested via the [`WorkScheduler`].
    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    /// Leave idle, kicking off connection attempts.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);
}

/// Operations an LB policy may perform on its channel. Only usable inside
/// policy callbacks; effects are applied by the serializer.
pub trait ChannelController: Send {
    /// Creates a new subchannel for `address`, in IDLE state. State
    /// changes are delivered to the policy's `subchannel_update`.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Publishes a new connectivity state and picker snapshot.
    fn update_picker(&mut self, update: LbState);

    /// Asks the name resolver to re-resolve, typically after connection
    /// failures.
    fn request_resolution(&mut self);
}

/// A connection-maintenance handle owned by LB policies.
///
/// Subchannels start IDLE; `connect` moves them to CONNECTING and onward
/// to READY or TRANSIENT_FAILURE. After `shutdown`, one final Shutdown
/// update is delivered and nothing more.
pub trait Subchannel: Send + Sync + fmt::Debug {
    /// Begins connecting if IDLE. A no-op in any other state.
    fn connect(&self);

    /// Shuts the subchannel down, closing any transport.
    fn shutdown(&self);

    /// The address this subchannel maintains a connection to.
    fn address(&self) -> Address;

    /// Registers `listener` for server-health updates, replacing (and
    /// silencing) any previous listener. `None` disables health
    /// reporting. While READY, the latest health state is replayed to a
    /// newly registered listener.
    fn register_health_listener(&self, listener: Option<HealthListener>);

    /// Downcast support so the channel can recover its own subchannel
    /// implementation from a picker result.
    fn as_any(&self) -> &dyn Any;
}

/// Callback receiving server-health updates for a subchannel.
pub type HealthListener = Box<dyn Fn(&SubchannelState) + Send + Sync>;

/// A point-in-time state of a subchannel.
#[derive(Clone, Debug)]
pub struct SubchannelState {
    pub connectivity_state: ConnectivityState,
    /// The most recent connection error; set only in TransientFailure.
    pub last_connection_error: Option<Arc<Status>>,
}

impl Default for SubchannelState {
    fn default() -> Self {
        SubchannelState {
            connectivity_state: ConnectivityState::Idle,
            last_connection_error: None,
        }
    }
}

/// An LB policy's parsed configuration object.
#[derive(Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Extracts the typed configuration.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.config.downcast_ref::<T>()
    }
}

/// Information about the RPC being routed, given to pickers.
#[derive(Debug, Clone)]
pub struct PickInfo {
    /// Full method path, `/Service/Method`.
    pub path: String,
    /// Whether the call is willing to wait for the channel to become
    /// ready.
    pub wait_for_ready: bool,
}

/// An immutable routing snapshot. The channel calls `pick` once per
/// attempt; a `Queue` result parks the RPC until a newer picker is
/// published.
pub trait Picker: Send + Sync {
    fn pick(&self, info: &PickInfo) -> PickResult;
}

/// Outcome of a pick.
pub enum PickResult {
    /// Route the RPC to this subchannel.
    Pick(Pick),
    /// No connection available yet; queue until the next picker.
    Queue,
    /// Fail the RPC with this status (unless it is wait-for-ready, in
    /// which case it queues). The code is laundered to the control-plane
    /// set.
    Fail(Status),
    /// Fail the RPC immediately, wait-for-ready or not. The code is
    /// laundered to the control-plane set.
    Drop(Status),
}

/// A successful routing decision.
pub struct Pick {
    pub subchannel: Arc<dyn Subchannel>,
    /// Metadata to add to the outgoing request.
    pub metadata: MetadataMap,
    /// Invoked with the RPC's final status, for policies that track
    /// call completion (e.g. for load reporting).
    pub on_complete: Option<Box<dyn FnOnce(&Status) + Send + Sync>>,
}

/// A connectivity state + picker pair, as published by a policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// The initial state of every channel: Connecting with a queueing
    /// picker.
    pub fn initial() -> Self {
        LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker),
        }
    }
}

/// Always queues. Used while connections are being established.
pub struct QueuingPicker;

impl Picker for QueuingPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with a fixed status; published in TransientFailure.
pub struct FailingPicker {
    error: Status,
}

impl FailingPicker {
    pub fn new(error: Status) -> Self {
        FailingPicker { error }
    }
}

impl Picker for FailingPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Fail(self.error.clone())
    }
}

/// Restricts control-plane-originated statuses to codes the library may
/// legitimately produce; everything else becomes `Internal` with the
/// message preserved.
pub(crate) fn launder_control_plane_status(status: Status) -> Status {
    match status.code() {
        Code::Unavailable
        | Code::Unauthenticated
        | Code::Unimplemented
        | Code::ResourceExhausted
        | Code::Internal
        | Code::Unknown
        | Code::Cancelled
        | Code::DeadlineExceeded => status,
        _ => Status::internal(status.message()),
    }
}

/// The channel-state aggregation rule over a set of subchannel states:
/// any READY wins, else any CONNECTING, else all-TRANSIENT_FAILURE, else
/// IDLE.
pub(crate) fn aggregate_connectivity(states: &[ConnectivityState]) -> ConnectivityState {
    if states.iter().any(|s| *s == ConnectivityState::Ready) {
        return ConnectivityState::Ready;
    }
    if states.iter().any(|s| *s == ConnectivityState::Connecting) {
        return ConnectivityState::Connecting;
    }
    if !states.is_empty()
        && states
            .iter()
            .all(|s| *s == ConnectivityState::TransientFailure)
    {
        return ConnectivityState::TransientFailure;
    }
    ConnectivityState::Idle
}
