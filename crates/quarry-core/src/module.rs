//! Engine modules.
//!
//! Modules are folded into the engine at build time, in order. Each one sees
//! every endpoint as it is registered and every cache event after it is
//! committed, and can be looked up again by type with `Engine::module`.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::endpoint::EndpointDefinition;
use crate::store::CacheEvent;

/// A capability plugged into the engine.
pub trait Module: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Called once for every endpoint, including ones injected later.
    fn inject_endpoint(&self, _name: &str, _definition: &EndpointDefinition) {}

    /// Called after every committed cache event.
    fn on_event(&self, _event: &CacheEvent) {}

    /// Called from `Engine::teardown`.
    fn teardown(&self) {}
}

struct Registered {
    module: Arc<dyn Module>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Ordered, typed collection of modules.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Arc<Vec<Registered>>,
}

impl ModuleRegistry {
    pub(crate) fn from_modules(modules: Vec<(Arc<dyn Module>, Arc<dyn Any + Send + Sync>)>) -> Self {
        Self {
            modules: Arc::new(
                modules
                    .into_iter()
                    .map(|(module, any)| Registered { module, any })
                    .collect(),
            ),
        }
    }

    /// First registered module of type `M`.
    pub fn get<M: Module + 'static>(&self) -> Option<Arc<M>> {
        self.modules
            .iter()
            .find_map(|r| Arc::clone(&r.any).downcast::<M>().ok())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|r| r.module.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub(crate) fn inject_endpoint(&self, name: &str, definition: &EndpointDefinition) {
        for r in self.modules.iter() {
            r.module.inject_endpoint(name, definition);
        }
    }

    pub(crate) fn on_event(&self, event: &CacheEvent) {
        for r in self.modules.iter() {
            r.module.on_event(event);
        }
    }

    pub(crate) fn teardown(&self) {
        for r in self.modules.iter() {
            r.module.teardown();
        }
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Logs endpoints and cache events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingModule;

impl Module for TracingModule {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn inject_endpoint(&self, name: &str, definition: &EndpointDefinition) {
        debug!(endpoint = %name, kind = %definition.kind(), "endpoint registered");
    }

    fn on_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::QueryRejected { key, error, .. } => {
                info!(key = %key, error = %error, "query rejected");
            }
            CacheEvent::MutationRejected { request_id, error } => {
                info!(request_id = %request_id, error = %error, "mutation rejected");
            }
            other => debug!(event = other.kind(), "cache event"),
        }
    }
}

/// Counts cache events by kind.
#[derive(Debug, Default)]
pub struct EventCounter {
    counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events of `kind` seen so far.
    pub fn count(&self, kind: &str) -> u64 {
        self.lock().get(kind).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> BTreeMap<&'static str, u64> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<&'static str, u64>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Module for EventCounter {
    fn name(&self) -> &'static str {
        "event-counter"
    }

    fn on_event(&self, event: &CacheEvent) {
        *self.lock().entry(event.kind()).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKey;

    fn registry() -> ModuleRegistry {
        let counter = Arc::new(EventCounter::new());
        let tracing = Arc::new(TracingModule);
        ModuleRegistry::from_modules(vec![
            (tracing.clone() as Arc<dyn Module>, tracing as Arc<dyn Any + Send + Sync>),
            (counter.clone() as Arc<dyn Module>, counter as Arc<dyn Any + Send + Sync>),
        ])
    }

    #[test]
    fn test_typed_lookup() {
        let modules = registry();
        assert_eq!(modules.names(), vec!["tracing", "event-counter"]);
        assert!(modules.get::<EventCounter>().is_some());
        assert!(modules.get::<TracingModule>().is_some());
    }

    #[test]
    fn test_counter_sees_events() {
        let modules = registry();
        modules.on_event(&CacheEvent::Reset);
        modules.on_event(&CacheEvent::QueryRemoved {
            key: CacheKey::new("a"),
        });
        modules.on_event(&CacheEvent::Reset);

        let counter = modules.get::<EventCounter>().unwrap();
        assert_eq!(counter.count("reset"), 2);
        assert_eq!(counter.count("query_removed"), 1);
        assert_eq!(counter.count("query_pending"), 0);
    }
}
