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

//! Shared fakes for LB policy tests: a recording channel controller and
//! inert subchannels.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    ChannelController, HealthListener, LbState, PickInfo, Subchannel, SubchannelState,
    WorkScheduler,
};
use crate::client::name_resolution::{Address, TCP_ADDRESS_TYPE};
use crate::client::ConnectivityState;

pub(crate) fn address(addr: &str) -> Address {
    Address {
        transport_type: TCP_ADDRESS_TYPE.to_string(),
        addr: addr.to_string(),
        ..Default::default()
    }
}

pub(crate) fn pick_info() -> PickInfo {
    PickInfo {
        path: "/test.Service/Method".to_string(),
        wait_for_ready: false,
    }
}

pub(crate) fn noop_work_scheduler() -> Arc<dyn WorkScheduler> {
    struct Noop;
    impl WorkScheduler for Noop {
        fn schedule_work(&self) {}
    }
    Arc::new(Noop)
}

/// A subchannel that records requests instead of connecting.
#[derive(Debug)]
pub(crate) struct StubSubchannel {
    address: Address,
    connect_requested: Mutex<bool>,
    shutdown_requested: Mutex<bool>,
}

impl StubSubchannel {
    fn new(address: Address) -> Self {
        StubSubchannel {
            address,
            connect_requested: Mutex::new(false),
            shutdown_requested: Mutex::new(false),
        }
    }
}

impl Subchannel for StubSubchannel {
    fn connect(&self) {
        *self.connect_requested.lock() = true;
    }

    fn shutdown(&self) {
        *self.shutdown_requested.lock() = true;
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn register_health_listener(&self, _listener: Option<HealthListener>) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(PartialEq, Debug)]
pub(crate) enum TestEvent {
    NewSubchannel,
    UpdatePicker(ConnectivityState),
    RequestResolution,
}

/// Records everything a policy does to its channel.
#[derive(Default)]
pub(crate) struct TestController {
    subchannels: Vec<Arc<dyn Subchannel>>,
    pickers: Vec<LbState>,
    events: Vec<TestEvent>,
}

impl TestController {
    pub(crate) fn created_subchannels(&self) -> Vec<Arc<dyn Subchannel>> {
        self.subchannels.clone()
    }

    pub(crate) fn last_picker(&self) -> Option<LbState> {
        self.pickers.last().cloned()
    }

    pub(crate) fn picker_count(&self) -> usize {
        self.pickers.len()
    }

    pub(crate) fn events(&self) -> &[TestEvent] {
        &self.events
    }

    pub(crate) fn connect_requested(&self, subchannel: &Arc<dyn Subchannel>) -> bool {
        Self::stub(subchannel)
            .map(|s| *s.connect_requested.lock())
            .unwrap_or(false)
    }

    pub(crate) fn shutdown_requested(&self, subchannel: &Arc<dyn Subchannel>) -> bool {
        Self::stub(subchannel)
            .map(|s| *s.shutdown_requested.lock())
            .unwrap_or(false)
    }

    fn stub(subchannel: &Arc<dyn Subchannel>) -> Option<&StubSubchannel> {
        subchannel.as_any().downcast_ref::<StubSubchannel>()
    }
}

impl ChannelController for TestController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> = Arc::new(StubSubchannel::new(address.clone()));
        self.subchannels.push(subchannel.clone());
        self.events.push(TestEvent::NewSubchannel);
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.events
            .push(TestEvent::UpdatePicker(update.connectivity_state));
        self.pickers.push(update);
    }

    fn request_resolution(&mut self) {
        self.events.push(TestEvent::RequestResolution);
    }
}

/// Drives a subchannel state transition through a policy, for tests.
pub(crate) fn subchannel_state(state: ConnectivityState) -> SubchannelState {
    SubchannelState {
        connectivity_state: state,
        last_connection_error: None,
    }
}
