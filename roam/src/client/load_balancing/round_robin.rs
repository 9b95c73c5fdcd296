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

//! The `round_robin` policy: connect to every endpoint and rotate picks
//! across the ready ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use super::{
    aggregate_connectivity, ChannelController, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, Pick, PickInfo, PickResult, Picker, QueuingPicker, Subchannel,
    SubchannelState,
};
use crate::client::name_resolution::ResolverState;
use crate::client::ConnectivityState;
use crate::metadata::MetadataMap;
use crate::Status;

pub static POLICY_NAME: &str = "round_robin";

pub(super) struct RoundRobinBuilder;

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            children: Vec::new(),
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct Child {
    endpoint_index: usize,
    subchannel: Arc<dyn Subchannel>,
    state: ConnectivityState,
    last_error: Option<Arc<Status>>,
}

struct RoundRobinPolicy {
    children: Vec<Child>,
}

impl RoundRobinPolicy {
    fn endpoint_states(&self) -> Vec<ConnectivityState> {
        let endpoint_count = self
            .children
            .iter()
            .map(|c| c.endpoint_index + 1)
            .max()
            .unwrap_or(0);
        (0..endpoint_count)
            .map(|endpoint| {
                let states: Vec<ConnectivityState> = self
                    .children
                    .iter()
                    .filter(|c| c.endpoint_index == endpoint)
                    .map(|c| c.state)
                    .collect();
                if states.contains(&ConnectivityState::Ready) {
                    ConnectivityState::Ready
                } else {
                    aggregate_connectivity(&states)
                }
            })
            .collect()
    }

    fn publish(&self, controller: &mut dyn ChannelController) {
        let endpoint_states = self.endpoint_states();
        let aggregate = aggregate_connectivity(&endpoint_states);

        let state = match aggregate {
            ConnectivityState::Ready => {
                // One subchannel per ready endpoint: the first that came
                // up.
                let mut ready = Vec::new();
                for (endpoint, state) in endpoint_states.iter().enumerate() {
                    if *state != ConnectivityState::Ready {
                        continue;
                    }
                    if let Some(child) = self
                        .children
                        .iter()
                        .find(|c| c.endpoint_index == endpoint && c.state == ConnectivityState::Ready)
                    {
                        ready.push(child.subchannel.clone());
                    }
                }
                LbState {
                    connectivity_state: ConnectivityState::Ready,
                    picker: Arc::new(RoundRobinPicker::new(ready)),
                }
            }
            ConnectivityState::TransientFailure => {
                let error = self
                    .children
                    .iter()
                    .rev()
                    .find_map(|c| c.last_error.clone())
                    .map(|e| Status::unavailable(e.message().to_string()))
                    .unwrap_or_else(|| Status::unavailable("all connections failed"));
                LbState {
                    connectivity_state: ConnectivityState::TransientFailure,
                    picker: Arc::new(FailingPicker::new(error)),
                }
            }
            state => LbState {
                connectivity_state: state,
                picker: Arc::new(QueuingPicker),
            },
        };
        controller.update_picker(state);
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverState,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), crate::Error> {
        let endpoints = update.effective_endpoints();
        let addresses_available = endpoints.iter().any(|e| !e.addresses.is_empty());
        if !addresses_available {
            for child in self.children.drain(..) {
                child.subchannel.shutdown();
            }
            let error = Status::unavailable("received empty address list from the name resolver");
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(FailingPicker::new(error.clone())),
            });
            channel_controller.request_resolution();
            return Err(error.message().to_string().into());
        }

        // Reuse subchannels whose address is still present; connect new
        // ones; drop the rest.
        let mut next_children = Vec::new();
        for (endpoint_index, endpoint) in endpoints.iter().enumerate() {
            for address in &endpoint.addresses {
                let existing = self
                    .children
                    .iter()
                    .position(|c| &c.subchannel.address() == address);
                match existing {
                    Some(i) => {
                        let mut child = self.children.swap_remove(i);
                        child.endpoint_index = endpoint_index;
                        next_children.push(child);
                    }
                    None => {
                        let subchannel = channel_controller.new_subchannel(address);
                        subchannel.connect();
                        next_children.push(Child {
                            endpoint_index,
                            subchannel,
                            state: ConnectivityState::Idle,
                            last_error: None,
                        });
                    }
                }
            }
        }
        for removed in self.children.drain(..) {
            trace!("round_robin: dropping subchannel for {}", removed.subchannel.address());
            removed.subchannel.shutdown();
        }
        self.children = next_children;
        self.publish(channel_controller);
        Ok(())
    }

    fn resolver_error(&mut self, error: Status, channel_controller: &mut dyn ChannelController) {
        if self.children.is_empty() {
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(FailingPicker::new(error)),
            });
            channel_controller.request_resolution();
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(child) = self
            .children
            .iter_mut()
            .find(|c| Arc::ptr_eq(&c.subchannel, subchannel))
        else {
            return;
        };

        child.state = state.connectivity_state;
        child.last_error = state.last_connection_error.clone();

        match state.connectivity_state {
            // Keep connections up: reconnect children that fall back to
            // idle after a disconnect or backoff.
            ConnectivityState::Idle => child.subchannel.connect(),
            ConnectivityState::TransientFailure => channel_controller.request_resolution(),
            _ => {}
        }

        self.publish(channel_controller);
    }

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for child in &self.children {
            if child.state == ConnectivityState::Idle {
                child.subchannel.connect();
            }
        }
    }
}

/// Rotates over the ready subchannels, starting at a random offset so
/// load spreads across channels.
struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        let start = if subchannels.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..subchannels.len())
        };
        RoundRobinPicker {
            subchannels,
            next: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        if self.subchannels.is_empty() {
            return PickResult::Queue;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick {
            subchannel: self.subchannels[index].clone(),
            metadata: MetadataMap::new(),
            on_complete: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{self, subchannel_state, TestController};
    use super::*;
    use crate::client::name_resolution::Endpoint;

    fn build_policy() -> Box<dyn LbPolicy> {
        RoundRobinBuilder.build(LbPolicyOptions {
            work_scheduler: test_utils::noop_work_scheduler(),
        })
    }

    fn endpoints(addrs: &[&str]) -> ResolverState {
        ResolverState {
            endpoints: Some(
                addrs
                    .iter()
                    .map(|a| Endpoint {
                        addresses: vec![test_utils::address(a)],
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn connects_to_every_endpoint() {
        let mut controller = TestController::default();
        let mut policy = build_policy();
        policy
            .resolver_update(endpoints(&["a:1", "b:2", "c:3"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        assert_eq!(subchannels.len(), 3);
        for sc in &subchannels {
            assert!(controller.connect_requested(sc));
        }
    }

    #[test]
    fn rotates_across_ready_endpoints() {
        let mut controller = TestController::default();
        let mut policy = build_policy();
        policy
            .resolver_update(endpoints(&["a:1", "b:2"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        policy.subchannel_update(
            &subchannels[0],
            &subchannel_state(ConnectivityState::Ready),
            &mut controller,
        );
        policy.subchannel_update(
            &subchannels[1],
            &subchannel_state(ConnectivityState::Ready),
            &mut controller,
        );

        let update = controller.last_picker().unwrap();
        assert_eq!(update.connectivity_state, ConnectivityState::Ready);

        let mut picked = Vec::new();
        for _ in 0..4 {
            match update.picker.pick(&test_utils::pick_info()) {
                PickResult::Pick(pick) => picked.push(pick.subchannel),
                _ => panic!("expected a pick"),
            }
        }
        assert!(!Arc::ptr_eq(&picked[0], &picked[1]));
        assert!(Arc::ptr_eq(&picked[0], &picked[2]));
        assert!(Arc::ptr_eq(&picked[1], &picked[3]));
    }

    #[test]
    fn failed_endpoint_leaves_the_rotation() {
        let mut controller = TestController::default();
        let mut policy = build_policy();
        policy
            .resolver_update(endpoints(&["a:1", "b:2"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        policy.subchannel_update(
            &subchannels[0],
            &subchannel_state(ConnectivityState::Ready),
            &mut controller,
        );
        policy.subchannel_update(
            &subchannels[1],
            &subchannel_state(ConnectivityState::Ready),
            &mut controller,
        );
        policy.subchannel_update(
            &subchannels[1],
            &subchannel_state(ConnectivityState::TransientFailure),
            &mut controller,
        );

        let update = controller.last_picker().unwrap();
        assert_eq!(update.connectivity_state, ConnectivityState::Ready);
        for _ in 0..4 {
            match update.picker.pick(&test_utils::pick_info()) {
                PickResult::Pick(pick) => {
                    assert!(Arc::ptr_eq(&pick.subchannel, &subchannels[0]))
                }
                _ => panic!("expected a pick"),
            }
        }
    }

    #[test]
    fn all_endpoints_failing_is_transient_failure() {
        let mut controller = TestController::default();
        let mut policy = build_policy();
        policy
            .resolver_update(endpoints(&["a:1", "b:2"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        for sc in &subchannels {
            policy.subchannel_update(
                sc,
                &subchannel_state(ConnectivityState::TransientFailure),
                &mut controller,
            );
        }
        let update = controller.last_picker().unwrap();
        assert_eq!(
            update.connectivity_state,
            ConnectivityState::TransientFailure
        );
    }

    #[test]
    fn empty_update_is_rejected() {
        let mut controller = TestController::default();
        let mut policy = build_policy();
        assert!(policy
            .resolver_update(endpoints(&[]), None, &mut controller)
            .is_err());
    }

    #[test]
    fn reuses_surviving_addresses() {
        let mut controller = TestController::default();
        let mut policy = build_policy();
        policy
            .resolver_update(endpoints(&["a:1", "b:2"]), None, &mut controller)
            .unwrap();
        policy
            .resolver_update(endpoints(&["b:2", "c:3"]), None, &mut controller)
            .unwrap();
        // a:1 and b:2 from the first update, c:3 from the second.
        let subchannels = controller.created_subchannels();
        assert_eq!(subchannels.len(), 3);
        assert!(controller.shutdown_requested(&subchannels[0]));
        assert!(!controller.shutdown_requested(&subchannels[1]));
    }
}
