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

//! The `pick_first` policy: try addresses in order, stick with the first
//! connection that becomes ready.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::trace;

use super::{
    ChannelController, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, Pick, PickInfo, PickResult, Picker, QueuingPicker, Subchannel, SubchannelState,
};
use crate::client::name_resolution::{Address, ResolverState};
use crate::client::ConnectivityState;
use crate::metadata::MetadataMap;
use crate::Status;

/// The name `pick_first` registers under; also the default policy of
/// every channel.
pub static POLICY_NAME: &str = "pick_first";

pub(super) struct PickFirstBuilder;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PickFirstConfig {
    shuffle_address_list: bool,
}

impl LbPolicyBuilder for PickFirstBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            addresses: Vec::new(),
            subchannels: Vec::new(),
            selected: None,
            state: ConnectivityState::Connecting,
            seen_transient_failure: false,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(&self, config: &serde_json::Value) -> Result<Option<LbConfig>, crate::Error> {
        let config: PickFirstConfig = serde_json::from_value(config.clone())
            .map_err(|e| format!("invalid pick_first config: {e}"))?;
        Ok(Some(LbConfig::new(config)))
    }
}

struct PickFirstPolicy {
    addresses: Vec<Address>,
    subchannels: Vec<Arc<dyn Subchannel>>,
    selected: Option<Arc<dyn Subchannel>>,
    state: ConnectivityState,
    /// Set once every address has failed; keeps the policy reporting
    /// TransientFailure until a connection succeeds.
    seen_transient_failure: bool,
}

impl PickFirstPolicy {
    fn publish(&mut self, controller: &mut dyn ChannelController, state: LbState) {
        self.state = state.connectivity_state;
        controller.update_picker(state);
    }

    fn move_to_transient_failure(&mut self, controller: &mut dyn ChannelController, error: Status) {
        self.seen_transient_failure = true;
        self.publish(
            controller,
            LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(FailingPicker::new(error)),
            },
        );
        controller.request_resolution();
    }

    fn index_of(&self, subchannel: &Arc<dyn Subchannel>) -> Option<usize> {
        self.subchannels
            .iter()
            .position(|sc| Arc::ptr_eq(sc, subchannel))
    }
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverState,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), crate::Error> {
        let mut addresses: Vec<Address> = update
            .effective_endpoints()
            .into_iter()
            .flat_map(|endpoint| endpoint.addresses)
            .collect();
        addresses.dedup_by(|a, b| a == b);

        if addresses.is_empty() {
            let error = Status::unavailable("received empty address list from the name resolver");
            // Old subchannels are released either way.
            self.shutdown_all();
            self.move_to_transient_failure(channel_controller, error.clone());
            return Err(error.message().to_string().into());
        }

        if let Some(config) = config.and_then(|c| c.downcast::<PickFirstConfig>()) {
            if config.shuffle_address_list {
                addresses.shuffle(&mut rand::thread_rng());
            }
        }

        // Keep the current connection when the new list still contains
        // its address.
        if let Some(selected) = &self.selected {
            if addresses.contains(&selected.address()) {
                trace!("pick_first: selected address still present; keeping connection");
                self.addresses = addresses;
                return Ok(());
            }
        }

        self.shutdown_all();
        self.selected = None;
        self.seen_transient_failure = false;
        self.subchannels = addresses
            .iter()
            .map(|address| channel_controller.new_subchannel(address))
            .collect();
        self.addresses = addresses;

        // Start the sweep; remaining attempts are driven by failures.
        if let Some(first) = self.subchannels.first() {
            first.connect();
        }
        self.publish(channel_controller, LbState::initial());
        Ok(())
    }

    fn resolver_error(&mut self, error: Status, channel_controller: &mut dyn ChannelController) {
        let usable = self.selected.is_some()
            || (!self.subchannels.is_empty() && self.state != ConnectivityState::TransientFailure);
        if !usable {
            self.move_to_transient_failure(channel_controller, error);
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(selected) = &self.selected {
            if Arc::ptr_eq(selected, subchannel) {
                match state.connectivity_state {
                    ConnectivityState::Ready => {}
                    // The connection died; wait for a call (or exit_idle)
                    // to reconnect.
                    _ => {
                        trace!("pick_first: selected subchannel left READY");
                        self.selected = None;
                        self.subchannels = vec![subchannel.clone()];
                        self.publish(
                            channel_controller,
                            LbState {
                                connectivity_state: ConnectivityState::Idle,
                                picker: Arc::new(QueuingPicker),
                            },
                        );
                        channel_controller.request_resolution();
                    }
                }
                return;
            }
            // Updates for non-selected subchannels are stale.
            return;
        }

        let Some(index) = self.index_of(subchannel) else {
            return;
        };

        match state.connectivity_state {
            ConnectivityState::Ready => {
                let selected = subchannel.clone();
                for (i, sc) in self.subchannels.iter().enumerate() {
                    if i != index {
                        sc.shutdown();
                    }
                }
                self.subchannels.clear();
                self.seen_transient_failure = false;
                self.selected = Some(selected.clone());
                self.publish(
                    channel_controller,
                    LbState {
                        connectivity_state: ConnectivityState::Ready,
                        picker: Arc::new(OneSubchannelPicker { sc: selected }),
                    },
                );
            }
            ConnectivityState::TransientFailure => {
                // Move the sweep along to the next address.
                if let Some(next) = self.subchannels.get(index + 1) {
                    next.connect();
                }
                if index + 1 == self.subchannels.len() {
                    let error = state
                        .last_connection_error
                        .as_ref()
                        .map(|e| Status::unavailable(e.message().to_string()))
                        .unwrap_or_else(|| Status::unavailable("all addresses failed"));
                    self.move_to_transient_failure(channel_controller, error);
                }
            }
            ConnectivityState::Idle => {
                // Backoff expired on a failed subchannel; retry it if the
                // whole list has failed, otherwise let the sweep reach it.
                if self.seen_transient_failure {
                    subchannel.connect();
                }
            }
            ConnectivityState::Connecting => {
                if !self.seen_transient_failure && self.state != ConnectivityState::Connecting {
                    self.publish(channel_controller, LbState::initial());
                }
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(selected) = &self.selected {
            selected.connect();
            return;
        }
        if let Some(first) = self.subchannels.first() {
            first.connect();
            self.publish(channel_controller, LbState::initial());
        }
    }
}

impl PickFirstPolicy {
    fn shutdown_all(&mut self) {
        for sc in &self.subchannels {
            sc.shutdown();
        }
        self.subchannels.clear();
        if let Some(selected) = self.selected.take() {
            selected.shutdown();
        }
    }
}

/// Routes every pick to the one ready subchannel.
struct OneSubchannelPicker {
    sc: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.sc.clone(),
            metadata: MetadataMap::new(),
            on_complete: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{self, TestController, TestEvent};
    use super::*;
    use crate::client::name_resolution::Endpoint;

    fn build_policy() -> Box<dyn LbPolicy> {
        PickFirstBuilder.build(LbPolicyOptions {
            work_scheduler: test_utils::noop_work_scheduler(),
        })
    }

    fn resolver_state(addrs: &[&str]) -> ResolverState {
        ResolverState {
            endpoints: Some(vec![Endpoint {
                addresses: addrs.iter().map(|a| test_utils::address(a)).collect(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn update_state(
        policy: &mut dyn LbPolicy,
        controller: &mut TestController,
        sc: &Arc<dyn Subchannel>,
        state: ConnectivityState,
    ) {
        policy.subchannel_update(
            sc,
            &SubchannelState {
                connectivity_state: state,
                last_connection_error: None,
            },
            controller,
        );
    }

    #[test]
    fn connects_to_first_address_and_selects_it() {
        let mut controller = TestController::default();
        let mut policy = build_policy();

        policy
            .resolver_update(resolver_state(&["a:1", "b:2"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        assert_eq!(subchannels.len(), 2);
        assert!(controller.connect_requested(&subchannels[0]));
        assert!(!controller.connect_requested(&subchannels[1]));

        update_state(
            policy.as_mut(),
            &mut controller,
            &subchannels[0],
            ConnectivityState::Ready,
        );

        let update = controller.last_picker().expect("picker published");
        assert_eq!(update.connectivity_state, ConnectivityState::Ready);
        match update.picker.pick(&test_utils::pick_info()) {
            PickResult::Pick(pick) => assert!(Arc::ptr_eq(&pick.subchannel, &subchannels[0])),
            _ => panic!("expected a pick"),
        }
        // The losing subchannel is shut down.
        assert!(controller.shutdown_requested(&subchannels[1]));
    }

    #[test]
    fn sweeps_to_next_address_on_failure() {
        let mut controller = TestController::default();
        let mut policy = build_policy();

        policy
            .resolver_update(resolver_state(&["a:1", "b:2"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();

        update_state(
            policy.as_mut(),
            &mut controller,
            &subchannels[0],
            ConnectivityState::TransientFailure,
        );
        assert!(controller.connect_requested(&subchannels[1]));

        update_state(
            policy.as_mut(),
            &mut controller,
            &subchannels[1],
            ConnectivityState::Ready,
        );
        let update = controller.last_picker().unwrap();
        assert_eq!(update.connectivity_state, ConnectivityState::Ready);
    }

    #[test]
    fn all_addresses_failing_is_transient_failure() {
        let mut controller = TestController::default();
        let mut policy = build_policy();

        policy
            .resolver_update(resolver_state(&["a:1", "b:2"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        for sc in &subchannels {
            update_state(
                policy.as_mut(),
                &mut controller,
                sc,
                ConnectivityState::TransientFailure,
            );
        }

        let update = controller.last_picker().unwrap();
        assert_eq!(
            update.connectivity_state,
            ConnectivityState::TransientFailure
        );
        match update.picker.pick(&test_utils::pick_info()) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), crate::Code::Unavailable)
            }
            _ => panic!("expected a fail"),
        }
        assert!(controller.events().contains(&TestEvent::RequestResolution));
    }

    #[test]
    fn empty_address_list_is_an_error() {
        let mut controller = TestController::default();
        let mut policy = build_policy();

        let result = policy.resolver_update(resolver_state(&[]), None, &mut controller);
        assert!(result.is_err());
        let update = controller.last_picker().unwrap();
        assert_eq!(
            update.connectivity_state,
            ConnectivityState::TransientFailure
        );
    }

    #[test]
    fn resolver_error_after_ready_is_ignored() {
        let mut controller = TestController::default();
        let mut policy = build_policy();

        policy
            .resolver_update(resolver_state(&["a:1"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        update_state(
            policy.as_mut(),
            &mut controller,
            &subchannels[0],
            ConnectivityState::Ready,
        );
        let before = controller.picker_count();

        policy.resolver_error(Status::unavailable("resolver broke"), &mut controller);
        assert_eq!(controller.picker_count(), before);
    }

    #[test]
    fn selected_address_survives_resolver_update() {
        let mut controller = TestController::default();
        let mut policy = build_policy();

        policy
            .resolver_update(resolver_state(&["a:1"]), None, &mut controller)
            .unwrap();
        let subchannels = controller.created_subchannels();
        update_state(
            policy.as_mut(),
            &mut controller,
            &subchannels[0],
            ConnectivityState::Ready,
        );

        // New list still contains a:1; no new subchannels are created.
        policy
            .resolver_update(resolver_state(&["a:1", "c:3"]), None, &mut controller)
            .unwrap();
        assert_eq!(controller.created_subchannels().len(), 1);
    }
}
