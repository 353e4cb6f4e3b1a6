use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::OnceCell;

use crate::error::ResolverError;

type AnyInstance = Arc<dyn Any + Send + Sync>;
type AnyFactory = Arc<dyn Fn(&DependencyResolver) -> AnyInstance + Send + Sync>;

/// Where a resolved instance lives and for how long.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependencyScope {
    /// A fresh instance on every resolve; the caller owns it.
    PerCall,
    /// One instance for the whole resolver tree, constructed at most
    /// once and cached at the root.
    Singleton,
    /// One instance per resolver scope that performs the resolve.
    PerScopeInstance,
    /// One instance per nearest ancestor scope carrying this tag.
    PerNamedScope(String),
}

struct Registration {
    scope: DependencyScope,
    factory: AnyFactory,
}

struct ScopeInner {
    tag: Option<String>,
    parent: Option<Arc<ScopeInner>>,
    registrations: RwLock<HashMap<TypeId, Registration>>,
    // per-type init cells; the brief map lock never spans a factory call.
    cache: Mutex<HashMap<TypeId, Arc<OnceCell<AnyInstance>>>>,
    // creation order of cached instances, for reverse teardown.
    created: Mutex<Vec<AnyInstance>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        // Release the cache references first so teardown order is
        // governed by the creation list alone, popped newest first.
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        if let Ok(mut created) = self.created.lock() {
            while let Some(instance) = created.pop() {
                drop(instance);
            }
        }
    }
}

/// Hierarchical, scope aware instance registry. Each scene (and within
/// a scene, each unit of work that wants isolation) gets its own child
/// scope; unresolved lookups delegate to the parent chain.
#[derive(Clone)]
pub struct DependencyResolver {
    inner: Arc<ScopeInner>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver {
    /// Create a root scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                tag: None,
                parent: None,
                registrations: RwLock::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                created: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child scope, optionally tagged so `PerNamedScope`
    /// registrations can cache here. The child inherits no cached
    /// per-scope instances from the parent.
    pub fn create_child_scope(&self, tag: Option<&str>) -> DependencyResolver {
        DependencyResolver {
            inner: Arc::new(ScopeInner {
                tag: tag.map(|t| t.to_owned()),
                parent: Some(self.inner.clone()),
                registrations: RwLock::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                created: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a factory for `T` in this scope. Registering the same
    /// type twice in one scope is a configuration error; use
    /// [`DependencyResolver::register_override`] to replace on purpose.
    pub fn register<T, F>(&self, scope: DependencyScope, factory: F) -> Result<(), ResolverError>
    where
        T: Send + Sync + 'static,
        F: Fn(&DependencyResolver) -> T + Send + Sync + 'static,
    {
        let mut registrations = self
            .inner
            .registrations
            .write()
            .expect("resolver_registrations_lock_poisoned");

        if registrations.contains_key(&TypeId::of::<T>()) {
            return Err(ResolverError::DuplicateRegistration {
                type_name: std::any::type_name::<T>(),
            });
        }

        registrations.insert(TypeId::of::<T>(), Self::registration_of(scope, factory));
        Ok(())
    }

    /// Register a factory for `T`, replacing any previous registration
    /// in this scope.
    pub fn register_override<T, F>(&self, scope: DependencyScope, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&DependencyResolver) -> T + Send + Sync + 'static,
    {
        self.inner
            .registrations
            .write()
            .expect("resolver_registrations_lock_poisoned")
            .insert(TypeId::of::<T>(), Self::registration_of(scope, factory));
    }

    fn registration_of<T, F>(scope: DependencyScope, factory: F) -> Registration
    where
        T: Send + Sync + 'static,
        F: Fn(&DependencyResolver) -> T + Send + Sync + 'static,
    {
        Registration {
            scope,
            factory: Arc::new(move |resolver| Arc::new(factory(resolver)) as AnyInstance),
        }
    }

    /// Resolve an instance of `T`, honoring the scope rule under which
    /// it was registered. Lookup walks from this scope to the root;
    /// the nearest registration wins.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolverError> {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();

        let (scope, factory) = self
            .find_registration(type_id)
            .ok_or(ResolverError::UnresolvedDependency { type_name })?;

        let instance = match scope {
            DependencyScope::PerCall => factory(self),
            DependencyScope::Singleton => Self::resolve_cached(self.root(), type_id, factory),
            DependencyScope::PerScopeInstance => {
                Self::resolve_cached(self.inner.clone(), type_id, factory)
            }
            DependencyScope::PerNamedScope(name) => {
                let owner =
                    self.find_tagged_scope(&name)
                        .ok_or_else(|| ResolverError::UnknownScope {
                            name: name.clone(),
                            type_name,
                        })?;
                Self::resolve_cached(owner, type_id, factory)
            }
        };

        instance
            .downcast::<T>()
            .map_err(|_| ResolverError::UnresolvedDependency { type_name })
    }

    fn find_registration(&self, type_id: TypeId) -> Option<(DependencyScope, AnyFactory)> {
        let mut current = Some(self.inner.clone());
        while let Some(scope) = current {
            {
                let registrations = scope
                    .registrations
                    .read()
                    .expect("resolver_registrations_lock_poisoned");
                if let Some(registration) = registrations.get(&type_id) {
                    return Some((registration.scope.clone(), registration.factory.clone()));
                }
            }
            current = scope.parent.clone();
        }
        None
    }

    fn find_tagged_scope(&self, name: &str) -> Option<Arc<ScopeInner>> {
        let mut current = Some(self.inner.clone());
        while let Some(scope) = current {
            if scope.tag.as_deref() == Some(name) {
                return Some(scope);
            }
            current = scope.parent.clone();
        }
        None
    }

    fn root(&self) -> Arc<ScopeInner> {
        let mut current = self.inner.clone();
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    // Cache an instance at the owning scope. The per-type cell makes
    // first resolution run the factory at most once even when multiple
    // descendants race; the map lock never spans the factory call.
    fn resolve_cached(
        owner: Arc<ScopeInner>,
        type_id: TypeId,
        factory: AnyFactory,
    ) -> AnyInstance {
        let cell = {
            let mut cache = owner.cache.lock().expect("resolver_cache_lock_poisoned");
            cache
                .entry(type_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let owner_resolver = DependencyResolver {
            inner: owner.clone(),
        };

        cell.get_or_init(|| {
            let instance = factory(&owner_resolver);
            owner
                .created
                .lock()
                .expect("resolver_created_lock_poisoned")
                .push(instance.clone());
            instance
        })
        .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Clock {
        constructed: usize,
    }

    #[test]
    fn per_call_builds_a_fresh_instance_every_resolve() {
        let resolver = DependencyResolver::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_factory = count.clone();
        resolver
            .register::<Clock, _>(DependencyScope::PerCall, move |_| Clock {
                constructed: count_factory.fetch_add(1, Ordering::SeqCst),
            })
            .unwrap();

        let a = resolver.resolve::<Clock>().unwrap();
        let b = resolver.resolve::<Clock>().unwrap();
        assert_ne!(a.constructed, b.constructed);
    }

    #[test]
    fn singleton_constructs_once_across_concurrent_child_scopes() {
        let resolver = DependencyResolver::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_factory = count.clone();
        resolver
            .register::<Clock, _>(DependencyScope::Singleton, move |_| Clock {
                constructed: count_factory.fetch_add(1, Ordering::SeqCst),
            })
            .unwrap();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let child = resolver.create_child_scope(None);
            joins.push(std::thread::spawn(move || {
                child.resolve::<Clock>().unwrap().constructed
            }));
        }

        for join in joins {
            assert_eq!(join.join().unwrap(), 0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_scope_instance_is_not_inherited_by_children() {
        let resolver = DependencyResolver::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_factory = count.clone();
        resolver
            .register::<Clock, _>(DependencyScope::PerScopeInstance, move |_| Clock {
                constructed: count_factory.fetch_add(1, Ordering::SeqCst),
            })
            .unwrap();

        let parent_instance = resolver.resolve::<Clock>().unwrap();
        let child = resolver.create_child_scope(None);
        let child_instance = child.resolve::<Clock>().unwrap();

        assert_ne!(parent_instance.constructed, child_instance.constructed);
        // resolving again from the same scope reuses the cache.
        assert_eq!(
            child.resolve::<Clock>().unwrap().constructed,
            child_instance.constructed
        );
    }

    #[test]
    fn named_scope_caches_at_the_nearest_tagged_ancestor() {
        let resolver = DependencyResolver::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_factory = count.clone();
        resolver
            .register::<Clock, _>(
                DependencyScope::PerNamedScope("scene".to_owned()),
                move |_| Clock {
                    constructed: count_factory.fetch_add(1, Ordering::SeqCst),
                },
            )
            .unwrap();

        let scene = resolver.create_child_scope(Some("scene"));
        let request_a = scene.create_child_scope(None);
        let request_b = scene.create_child_scope(None);

        assert_eq!(request_a.resolve::<Clock>().unwrap().constructed, 0);
        assert_eq!(request_b.resolve::<Clock>().unwrap().constructed, 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // an untagged tree cannot host the registration.
        let detached = resolver.create_child_scope(None);
        assert!(matches!(
            detached.resolve::<Clock>(),
            Err(ResolverError::UnknownScope { .. })
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected_and_override_is_explicit() {
        let resolver = DependencyResolver::new();
        resolver
            .register::<Clock, _>(DependencyScope::Singleton, |_| Clock { constructed: 0 })
            .unwrap();

        assert!(matches!(
            resolver.register::<Clock, _>(DependencyScope::PerCall, |_| Clock { constructed: 1 }),
            Err(ResolverError::DuplicateRegistration { .. })
        ));

        resolver
            .register_override::<Clock, _>(DependencyScope::PerCall, |_| Clock { constructed: 9 });
        assert_eq!(resolver.resolve::<Clock>().unwrap().constructed, 9);
    }

    #[test]
    fn missing_registration_is_an_unresolved_dependency() {
        let resolver = DependencyResolver::new();
        assert!(matches!(
            resolver.resolve::<Clock>(),
            Err(ResolverError::UnresolvedDependency { .. })
        ));
    }

    struct TornDown {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Drop for TornDown {
        fn drop(&mut self) {
            self.order.lock().unwrap().push(self.label);
        }
    }

    struct First(TornDown);
    struct Second(TornDown);

    #[test]
    fn scope_teardown_drops_in_reverse_creation_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let resolver = DependencyResolver::new();

        let order_first = order.clone();
        resolver
            .register::<First, _>(DependencyScope::PerScopeInstance, move |_| {
                First(TornDown {
                    label: "first",
                    order: order_first.clone(),
                })
            })
            .unwrap();
        let order_second = order.clone();
        resolver
            .register::<Second, _>(DependencyScope::PerScopeInstance, move |_| {
                Second(TornDown {
                    label: "second",
                    order: order_second.clone(),
                })
            })
            .unwrap();

        let scope = resolver.create_child_scope(None);
        scope.resolve::<First>().unwrap();
        scope.resolve::<Second>().unwrap();
        drop(scope);

        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn factories_resolve_their_own_inputs() {
        struct Inner;
        struct Outer {
            _inner: Arc<Inner>,
        }

        let resolver = DependencyResolver::new();
        resolver
            .register::<Inner, _>(DependencyScope::Singleton, |_| Inner)
            .unwrap();
        resolver
            .register::<Outer, _>(DependencyScope::Singleton, |r| Outer {
                _inner: r.resolve::<Inner>().expect("inner must be registered"),
            })
            .unwrap();

        assert!(resolver.resolve::<Outer>().is_ok());
    }
}
