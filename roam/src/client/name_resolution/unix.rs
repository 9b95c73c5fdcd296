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

use super::passthrough::OneShotResolver;
use super::{
    Address, Resolver, ResolverBuilder, ResolverOptions, ResolverState, Target, UNIX_ADDRESS_TYPE,
};

/// Resolver for `unix:path`, `unix:///absolute/path` and
/// `unix-abstract:name` targets. Produces a single UNIX-socket address;
/// the authority is always `localhost`.
pub(super) struct UnixResolverBuilder {
    scheme: &'static str,
}

impl UnixResolverBuilder {
    pub(super) fn filesystem() -> Self {
        UnixResolverBuilder { scheme: "unix" }
    }

    pub(super) fn abstract_namespace() -> Self {
        UnixResolverBuilder {
            scheme: "unix-abstract",
        }
    }
}

impl ResolverBuilder for UnixResolverBuilder {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let addr = if self.scheme == "unix-abstract" {
            // Abstract-namespace names are marked with a leading NUL.
            format!("\0{}", target.endpoint())
        } else {
            target.path().to_string()
        };
        let state = ResolverState {
            addresses: vec![Address {
                transport_type: UNIX_ADDRESS_TYPE.to_string(),
                addr,
                ..Default::default()
            }],
            ..Default::default()
        };
        Box::new(OneShotResolver::new(state, options.controller))
    }

    fn default_authority(&self, _target: &Target) -> String {
        "localhost".to_string()
    }
}
