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

use super::LbPolicyBuilder;

/// A registry of LB policy builders, indexed by policy name.
pub struct LbPolicyRegistry {
    m: Mutex<HashMap<&'static str, Arc<dyn LbPolicyBuilder>>>,
}

impl LbPolicyRegistry {
    fn new() -> Self {
        let registry = LbPolicyRegistry {
            m: Mutex::new(HashMap::new()),
        };
        registry.add_builder(super::pick_first::PickFirstBuilder);
        registry.add_builder(super::round_robin::RoundRobinBuilder);
        registry
    }

    /// Registers a policy builder under its name, replacing any previous
    /// one.
    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        self.m.lock().insert(builder.name(), Arc::new(builder));
    }

    /// Retrieves the builder for `name`, if registered.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.m.lock().get(name).cloned()
    }
}

/// The process-wide LB policy registry consulted when applying service
/// configs.
pub static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> = LazyLock::new(LbPolicyRegistry::new);
