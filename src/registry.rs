//! Handler registry for endpoint re-binding.
//!
//! Link endpoints are bound to handlers by name, which is what a checkpoint
//! records. The registry maps those names back to handler instances when a
//! simulation is restored (and lets the surrounding framework wire up
//! handlers from configuration).
//!
//! # Example
//!
//! ```
//! use lockstep::registry::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("sink", || Box::new(|_scheduler, _event| Ok(())));
//! assert!(registry.contains("sink"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::simulation::LinkHandler;

/// Type alias for handler factory functions.
pub type HandlerFactory = Arc<dyn Fn() -> LinkHandler + Send + Sync>;

/// A registry of named handler factories.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler factory under a name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> LinkHandler + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Creates a handler instance by name.
    ///
    /// Returns `None` if the name is not registered.
    pub fn create(&self, name: &str) -> Option<LinkHandler> {
        self.factories.get(name).map(|f| f())
    }

    /// Returns true if a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if no names are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Iterates over the registered names.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.factories.keys()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
