use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Type-keyed service container used to configure the engine.
///
/// Services are keyed by `TypeId::of::<T>()` where `T` may be unsized, so trait
/// objects register under their trait:
///
/// ```
/// use std::sync::Arc;
/// use courier_core::{AllTransient, TransientErrorDetectionStrategy};
/// use courier_engine::dispatch::ServiceRegistry;
///
/// let registry = ServiceRegistry::new();
/// registry
///     .replace::<dyn TransientErrorDetectionStrategy>(Arc::new(AllTransient))
///     .unwrap();
/// assert!(registry.get::<dyn TransientErrorDetectionStrategy>().is_some());
/// ```
///
/// The registry is read when a `MessageProcessor` is built and is frozen by
/// the first dispatch; later mutations fail with [`ConfigError::Frozen`].
pub struct ServiceRegistry {
    /// `TypeId` of `T` -> boxed `Arc<T>` values in registration order.
    by_type: DashMap<TypeId, Vec<Arc<dyn Any + Send + Sync>>>,
    frozen: AtomicBool,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_type: DashMap::new(),
            frozen: AtomicBool::new(false),
        }
    }

    /// Adds a service alongside any already registered under `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Frozen`] once dispatching has started.
    pub fn add<T>(&self, service: Arc<T>) -> Result<(), ConfigError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        self.by_type
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Arc::new(service));
        Ok(())
    }

    /// Replaces every service registered under `T` with `service`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Frozen`] once dispatching has started.
    pub fn replace<T>(&self, service: Arc<T>) -> Result<(), ConfigError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        let boxed: Arc<dyn Any + Send + Sync> = Arc::new(service);
        self.by_type.insert(TypeId::of::<T>(), vec![boxed]);
        Ok(())
    }

    /// Resolves the most recently registered service for `T`.
    #[must_use]
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().last().and_then(downcast::<T>))
    }

    /// Resolves every service registered for `T`, in registration order.
    #[must_use]
    pub fn get_all<T>(&self) -> Vec<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|entry| entry.value().iter().filter_map(downcast::<T>).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    /// Rejects all further mutations. Idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    fn ensure_mutable(&self) -> Result<(), ConfigError> {
        if self.is_frozen() {
            Err(ConfigError::Frozen)
        } else {
            Ok(())
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("types", &self.by_type.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

fn downcast<T>(boxed: &Arc<dyn Any + Send + Sync>) -> Option<Arc<T>>
where
    T: ?Sized + Send + Sync + 'static,
{
    boxed.downcast_ref::<Arc<T>>().cloned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    struct French;
    impl Greeter for French {
        fn greet(&self) -> String {
            "bonjour".to_string()
        }
    }

    #[derive(Debug, PartialEq)]
    struct Settings {
        retries: u32,
    }

    #[test]
    fn add_and_get_concrete_type() {
        let registry = ServiceRegistry::new();
        registry.add(Arc::new(Settings { retries: 2 })).unwrap();
        assert_eq!(registry.get::<Settings>().unwrap().retries, 2);
        assert!(registry.contains::<Settings>());
    }

    #[test]
    fn trait_objects_are_keyed_by_trait() {
        let registry = ServiceRegistry::new();
        registry.add::<dyn Greeter>(Arc::new(English)).unwrap();
        registry.add::<dyn Greeter>(Arc::new(French)).unwrap();

        let all: Vec<String> = registry
            .get_all::<dyn Greeter>()
            .iter()
            .map(|g| g.greet())
            .collect();
        assert_eq!(all, vec!["hello", "bonjour"]);

        // Single resolution returns the most recent registration.
        assert_eq!(registry.get::<dyn Greeter>().unwrap().greet(), "bonjour");
    }

    #[test]
    fn replace_discards_previous_registrations() {
        let registry = ServiceRegistry::new();
        registry.add::<dyn Greeter>(Arc::new(English)).unwrap();
        registry.add::<dyn Greeter>(Arc::new(English)).unwrap();
        registry.replace::<dyn Greeter>(Arc::new(French)).unwrap();

        let all = registry.get_all::<dyn Greeter>();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].greet(), "bonjour");
    }

    #[test]
    fn unregistered_type_resolves_to_nothing() {
        let registry = ServiceRegistry::new();
        assert!(registry.get::<Settings>().is_none());
        assert!(registry.get_all::<dyn Greeter>().is_empty());
        assert!(!registry.contains::<dyn Greeter>());
    }

    #[test]
    fn frozen_registry_rejects_mutation_but_still_resolves() {
        let registry = ServiceRegistry::new();
        registry.add(Arc::new(Settings { retries: 1 })).unwrap();
        registry.freeze();

        assert!(registry.is_frozen());
        assert_eq!(
            registry.add(Arc::new(Settings { retries: 5 })),
            Err(ConfigError::Frozen)
        );
        assert_eq!(
            registry.replace(Arc::new(Settings { retries: 5 })),
            Err(ConfigError::Frozen)
        );
        assert_eq!(registry.get::<Settings>().unwrap().retries, 1);
    }
}
