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

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use super::ResolverBuilder;

/// A registry of name resolver builders, indexed by URI scheme.
pub struct ResolverRegistry {
    m: Mutex<HashMap<&'static str, Arc<dyn ResolverBuilder>>>,
}

impl ResolverRegistry {
    fn new() -> Self {
        let registry = ResolverRegistry {
            m: Mutex::new(HashMap::new()),
        };
        registry.add_builder(super::passthrough::PassthroughResolverBuilder);
        registry.add_builder(super::unix::UnixResolverBuilder::filesystem());
        registry.add_builder(super::unix::UnixResolverBuilder::abstract_namespace());
        registry.add_builder(super::dns::DnsResolverBuilder);
        registry
    }

    /// Registers a builder under its scheme, replacing any previous one.
    pub fn add_builder(&self, builder: impl ResolverBuilder + 'static) {
        self.m.lock().insert(builder.scheme(), Arc::new(builder));
    }

    /// Retrieves the builder for `scheme`, if registered.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.m.lock().get(scheme).cloned()
    }
}

/// The process-wide resolver registry consulted at channel construction.
pub static GLOBAL_RESOLVER_REGISTRY: LazyLock<ResolverRegistry> =
    LazyLock::new(ResolverRegistry::new);
