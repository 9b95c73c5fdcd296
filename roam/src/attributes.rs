//! Typed, immutable attribute maps attached to addresses, endpoints and
//! resolver states.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An immutable map from string keys to arbitrarily typed values.
///
/// Values are shared; cloning an `Attributes` is cheap. Construction is
/// by-value chaining so resolvers can build maps inline.
#[derive(Clone, Default)]
pub struct Attributes {
    inner: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the map with `value` stored under `key`.
    pub fn with<T: Any + Send + Sync>(mut self, key: &'static str, value: T) -> Self {
        self.inner.insert(key, Arc::new(value));
        self
    }

    /// Looks up `key`, downcasting to the requested type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.inner.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.inner.keys()).finish()
    }
}
