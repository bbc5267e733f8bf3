//! Process-wide lookup of circuit breakers by name.
//!
//! The registry holds weak references only. A breaker removes its own
//! entry when the last strong reference is dropped.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

pub(crate) type Entries = Mutex<HashMap<String, Weak<CircuitBreaker>>>;

/// Drop `name` if its entry no longer points at a live breaker.
pub(crate) fn release(entries: &Entries, name: &str) {
    let mut map = lock(entries);
    if map.get(name).is_some_and(|weak| weak.strong_count() == 0) {
        map.remove(name);
        debug!("Circuit breaker {} unregistered", name);
    }
}

/// Name-keyed registry of circuit breakers.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    entries: Arc<Entries>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a breaker from `config` and register it under its name.
    pub fn create(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::with_config(config));
        self.register(&breaker);
        breaker
    }

    /// Return the live breaker called `config.name`, creating it if needed.
    pub fn get_or_create(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = lock(&self.entries);
        if let Some(existing) = map.get(&config.name).and_then(Weak::upgrade) {
            return existing;
        }

        let breaker = Arc::new(CircuitBreaker::with_config(config));
        breaker.attach_registry(Arc::downgrade(&self.entries));
        map.insert(breaker.name().to_string(), Arc::downgrade(&breaker));
        breaker
    }

    /// Register `breaker` under its name, replacing any previous entry.
    pub fn register(&self, breaker: &Arc<CircuitBreaker>) {
        let name = breaker.name().to_string();
        breaker.attach_registry(Arc::downgrade(&self.entries));

        let previous = lock(&self.entries).insert(name.clone(), Arc::downgrade(breaker));
        if let Some(previous) = previous.and_then(|weak| weak.upgrade()) {
            if !Arc::ptr_eq(&previous, breaker) {
                warn!("Replacing registered circuit breaker {}", name);
            }
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        lock(&self.entries).remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        lock(&self.entries).get(name).and_then(Weak::upgrade)
    }

    /// Names of all live breakers, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live().iter().map(|b| b.name().to_string()).collect();
        names.sort();
        names
    }

    /// Number of breakers currently open.
    pub fn open_count(&self) -> usize {
        self.live().iter().filter(|b| b.is_open()).count()
    }

    /// Move every open breaker to half-open. Returns how many moved.
    pub fn force_all_half_open(&self) -> usize {
        self.live().iter().filter(|b| b.force_half_open()).count()
    }

    /// Close every breaker that is not already closed. Returns how many changed.
    pub fn force_all_closed(&self) -> usize {
        self.live()
            .iter()
            .filter(|b| !b.is_closed())
            .inspect(|b| b.close())
            .count()
    }

    /// Statistics of every live breaker, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> = self.live().iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    // Upgrade outside the lock so a breaker dropped here can release itself.
    fn live(&self) -> Vec<Arc<CircuitBreaker>> {
        let weak: Vec<Weak<CircuitBreaker>> = lock(&self.entries).values().cloned().collect();
        weak.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig::named(name).with_logging(false)
    }

    #[test]
    fn test_get_or_create_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create(config("api.example.com"));
        let b = registry.get_or_create(config("api.example.com"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.registered_names(), vec!["api.example.com"]);
    }

    #[test]
    fn test_breaker_unregisters_on_drop() {
        let registry = CircuitBreakerRegistry::new();
        let breaker = registry.create(config("short-lived"));
        assert!(registry.get("short-lived").is_some());

        drop(breaker);
        assert!(registry.get("short-lived").is_none());
        assert!(lock(&registry.entries).is_empty());
    }

    #[test]
    fn test_replaced_breaker_drop_keeps_new_entry() {
        let registry = CircuitBreakerRegistry::new();
        let old = registry.create(config("svc"));
        let new = registry.create(config("svc"));

        drop(old);
        let current = registry.get("svc").unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[test]
    fn test_unregister() {
        let registry = CircuitBreakerRegistry::new();
        let _breaker = registry.create(config("svc"));
        assert!(registry.unregister("svc"));
        assert!(!registry.unregister("svc"));
        assert!(registry.get("svc").is_none());
    }

    #[test]
    fn test_bulk_controls() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.create(config("a"));
        let b = registry.create(config("b"));
        let c = registry.create(config("c"));

        a.open();
        b.open();
        assert_eq!(registry.open_count(), 2);

        assert_eq!(registry.force_all_half_open(), 2);
        assert!(a.is_half_open());
        assert!(c.is_closed());

        assert_eq!(registry.force_all_closed(), 2);
        assert_eq!(registry.open_count(), 0);

        let names: Vec<String> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
