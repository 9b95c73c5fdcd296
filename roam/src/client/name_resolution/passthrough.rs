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

use std::sync::Arc;

use super::{
    encode_authority, Address, ChannelController, Resolver, ResolverBuilder, ResolverOptions,
    ResolverState, Target, TCP_ADDRESS_TYPE,
};

/// The `passthrough` resolver hands the endpoint to the transport
/// unresolved. Its authority is the URL-encoded endpoint.
pub(super) struct PassthroughResolverBuilder;

impl ResolverBuilder for PassthroughResolverBuilder {
    fn scheme(&self) -> &'static str {
        "passthrough"
    }

    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let state = ResolverState {
            addresses: vec![Address {
                transport_type: TCP_ADDRESS_TYPE.to_string(),
                addr: target.endpoint().to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Box::new(OneShotResolver::new(state, options.controller))
    }

    fn default_authority(&self, target: &Target) -> String {
        encode_authority(target.endpoint())
    }
}

/// A resolver for schemes whose state never changes: pushes one update at
/// build time and re-pushes it on `resolve_now`.
pub(crate) struct OneShotResolver {
    state: ResolverState,
    controller: Arc<dyn ChannelController>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl OneShotResolver {
    pub(crate) fn new(state: ResolverState, controller: Arc<dyn ChannelController>) -> Self {
        let mut resolver = OneShotResolver {
            state,
            controller,
            task: None,
        };
        resolver.push();
        resolver
    }

    fn push(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let state = self.state.clone();
        let controller = self.controller.clone();
        self.task = Some(tokio::spawn(async move {
            let _ = controller.update(state).await;
        }));
    }
}

impl Resolver for OneShotResolver {
    fn resolve_now(&mut self) {
        self.push();
    }
}

impl Drop for OneShotResolver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
