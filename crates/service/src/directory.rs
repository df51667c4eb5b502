//! Registry mapping names (and aliases) to running services.
//!
//! Registrations are keyed by primary name plus request type, so the
//! same name can serve differently-typed requests side by side. A
//! returned id of `0` always means the registration was refused.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use stellwerk_runtime::Parallel;

use crate::handler::Handler;
use crate::service::{Service, ServiceStats};

type ServiceKey = (String, TypeId);

struct Registration {
    id: u64,
    handler_type: TypeId,
    service: Arc<dyn Any + Send + Sync>,
    stats_fn: Box<dyn Fn() -> ServiceStats + Send + Sync>,
}

struct DirectoryInner {
    next_id: u64,
    by_key: HashMap<ServiceKey, Registration>,
    by_id: HashMap<u64, ServiceKey>,
    aliases: HashMap<String, ServiceKey>,
}

/// Owns every registered [`Service`] and resolves dispatch targets.
pub struct ServiceDirectory {
    parallel: Arc<Parallel>,
    execution_timeout: Option<Duration>,
    inner: Mutex<DirectoryInner>,
}

impl ServiceDirectory {
    pub fn new(parallel: Arc<Parallel>) -> Self {
        Self::with_execution_timeout(parallel, None)
    }

    /// A directory whose services cancel handler executions that exceed
    /// `execution_timeout`. `None` means executions run unbounded.
    pub fn with_execution_timeout(
        parallel: Arc<Parallel>,
        execution_timeout: Option<Duration>,
    ) -> Self {
        Self {
            parallel,
            execution_timeout,
            inner: Mutex::new(DirectoryInner {
                next_id: 1,
                by_key: HashMap::new(),
                by_id: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    /// Register a handler and return its service id.
    ///
    /// Re-registering the same handler type under the same name is
    /// idempotent and returns the existing id. Any other collision is
    /// refused with id `0`, as is an empty name. Aliases are dropped
    /// individually when they collide with an existing name or alias.
    pub fn register<H: Handler>(&self, handler: Arc<H>) -> u64 {
        let name = handler.name();
        if name.is_empty() {
            warn!("refusing to register a service with an empty name");
            return 0;
        }
        let key: ServiceKey = (name.clone(), TypeId::of::<H::Request>());

        let mut inner = self.lock_inner();
        if let Some(existing) = inner.by_key.get(&key) {
            if existing.handler_type == TypeId::of::<H>() {
                return existing.id;
            }
            warn!(service = %name, "name already taken by a different handler");
            return 0;
        }
        if inner.aliases.contains_key(&name) {
            warn!(service = %name, "name already taken by an alias");
            return 0;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let service = Service::new(
            id,
            Arc::clone(&handler),
            Arc::clone(&self.parallel),
            self.execution_timeout,
        );
        let stats_source = Arc::clone(&service);
        inner.by_key.insert(
            key.clone(),
            Registration {
                id,
                handler_type: TypeId::of::<H>(),
                service,
                stats_fn: Box::new(move || stats_source.stats()),
            },
        );
        inner.by_id.insert(id, key.clone());

        for alias in handler.aliases() {
            if alias.is_empty() {
                continue;
            }
            let taken = inner.aliases.contains_key(&alias)
                || inner.by_key.keys().any(|(n, _)| n == &alias);
            if taken {
                warn!(service = %name, alias = %alias, "alias already taken, dropped");
                continue;
            }
            inner.aliases.insert(alias, key.clone());
        }

        info!(service = %name, id, "service registered");
        id
    }

    /// Resolve a service by primary name or alias.
    pub fn get<H: Handler>(&self, name: &str) -> Option<Arc<Service<H>>> {
        let inner = self.lock_inner();
        let key: ServiceKey = (name.to_string(), TypeId::of::<H::Request>());
        let key = if inner.by_key.contains_key(&key) {
            key
        } else {
            inner.aliases.get(name)?.clone()
        };
        let registration = inner.by_key.get(&key)?;
        Arc::clone(&registration.service)
            .downcast::<Service<H>>()
            .ok()
    }

    /// Resolve a service by its registration id.
    pub fn get_by_id<H: Handler>(&self, id: u64) -> Option<Arc<Service<H>>> {
        let inner = self.lock_inner();
        let key = inner.by_id.get(&id)?;
        let registration = inner.by_key.get(key)?;
        Arc::clone(&registration.service)
            .downcast::<Service<H>>()
            .ok()
    }

    /// Stats for every registered service, ordered by id.
    pub fn snapshot(&self) -> Vec<ServiceStats> {
        let inner = self.lock_inner();
        let mut stats: Vec<ServiceStats> =
            inner.by_key.values().map(|r| (r.stats_fn)()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, DirectoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use stellwerk_runtime::{TunableValues, Tunables};

    use super::*;
    use crate::error::ServiceError;

    struct Greeter {
        aliases: Vec<String>,
    }

    #[async_trait]
    impl Handler for Greeter {
        type Request = String;
        type Response = String;

        fn name(&self) -> String {
            "greeter".into()
        }

        fn aliases(&self) -> Vec<String> {
            self.aliases.clone()
        }

        fn fingerprint(&self, request: &String) -> Result<i64, ServiceError> {
            Ok(request.len() as i64)
        }

        async fn execute(&self, request: String) -> Result<String, ServiceError> {
            Ok(format!("hello {request}"))
        }
    }

    struct Shadow;

    #[async_trait]
    impl Handler for Shadow {
        type Request = String;
        type Response = String;

        fn name(&self) -> String {
            "greeter".into()
        }

        fn fingerprint(&self, _request: &String) -> Result<i64, ServiceError> {
            Ok(0)
        }

        async fn execute(&self, _request: String) -> Result<String, ServiceError> {
            Ok("shadow".into())
        }
    }

    fn directory() -> ServiceDirectory {
        ServiceDirectory::new(Parallel::new(Tunables::fixed(TunableValues::default())))
    }

    #[test]
    fn re_registration_is_idempotent() {
        let directory = directory();
        let first = directory.register(Arc::new(Greeter { aliases: vec![] }));
        let second = directory.register(Arc::new(Greeter { aliases: vec![] }));
        assert_ne!(first, 0);
        assert_eq!(first, second);
        assert_eq!(directory.snapshot().len(), 1);
    }

    #[test]
    fn conflicting_handler_is_refused() {
        let directory = directory();
        assert_ne!(directory.register(Arc::new(Greeter { aliases: vec![] })), 0);
        assert_eq!(directory.register(Arc::new(Shadow)), 0);
    }

    #[test]
    fn aliases_resolve_and_collisions_are_dropped() {
        let directory = directory();
        directory.register(Arc::new(Greeter {
            aliases: vec!["hello".into(), "greeter".into()],
        }));

        assert!(directory.get::<Greeter>("hello").is_some());
        // The self-colliding alias was dropped, the primary name still works.
        assert!(directory.get::<Greeter>("greeter").is_some());
        assert!(directory.get::<Greeter>("nope").is_none());
    }

    #[test]
    fn lookup_by_id_round_trips() {
        let directory = directory();
        let id = directory.register(Arc::new(Greeter { aliases: vec![] }));
        let service = directory.get_by_id::<Greeter>(id).unwrap();
        assert_eq!(service.name(), "greeter");
        assert!(directory.get_by_id::<Greeter>(id + 1).is_none());
    }

    #[test]
    fn lookup_with_wrong_handler_type_misses() {
        let directory = directory();
        directory.register(Arc::new(Greeter { aliases: vec![] }));
        assert!(directory.get::<Shadow>("greeter").is_none());
    }
}
