//! Route uniqueness across entity kinds
//!
//! Each kind enforces unique routes inside its own repository. The
//! [`RouteConsumers`] registry lets a kind ask every other registered kind
//! whether it already owns a route, since the dispatcher serves a path once.

use crate::entity::RoutableEntity;
use crate::repository::EntityRepository;
use crate::ValidationError;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// A kind of entity that consumes routes
#[async_trait]
pub trait RouteConsumer: Send + Sync {
    fn kind(&self) -> &str;

    async fn owns_any(&self, routes: &[String]) -> bool;
}

/// [`RouteConsumer`] answering from an entity repository
pub struct RepositoryConsumer<E, R: ?Sized> {
    repo: Arc<R>,
    _kind: PhantomData<fn() -> E>,
}

impl<E, R> RepositoryConsumer<E, R>
where
    E: RoutableEntity,
    R: EntityRepository<E> + ?Sized,
{
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<E, R> RouteConsumer for RepositoryConsumer<E, R>
where
    E: RoutableEntity,
    R: EntityRepository<E> + ?Sized + 'static,
{
    fn kind(&self) -> &str {
        E::KIND
    }

    async fn owns_any(&self, routes: &[String]) -> bool {
        self.repo.count_routes(routes, None).await > 0
    }
}

/// Registered route consumer kinds, filled once at startup
#[derive(Default)]
pub struct RouteConsumers {
    consumers: RwLock<Vec<Arc<dyn RouteConsumer>>>,
}

impl RouteConsumers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer, replacing any previous one of the same kind
    pub fn register(&self, consumer: Arc<dyn RouteConsumer>) {
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        consumers.retain(|c| c.kind() != consumer.kind());
        info!(kind = consumer.kind(), "Registered route consumer");
        consumers.push(consumer);
    }

    pub fn register_repository<E, R>(&self, repo: Arc<R>)
    where
        E: RoutableEntity,
        R: EntityRepository<E> + ?Sized + 'static,
    {
        self.register(Arc::new(RepositoryConsumer::<E, R>::new(repo)));
    }

    pub fn kinds(&self) -> Vec<String> {
        self.current().iter().map(|c| c.kind().to_string()).collect()
    }

    /// Drop every registration, e.g. when the set of kinds changes
    pub fn clear(&self) {
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        debug!(count = consumers.len(), "Route consumers cleared");
        consumers.clear();
    }

    /// Fail if a kind other than `kind` owns any of `routes`
    pub async fn check_unique(&self, kind: &str, routes: &[String]) -> Result<(), ValidationError> {
        let mut clashing = Vec::new();
        for consumer in self.current() {
            if consumer.kind() != kind && consumer.owns_any(routes).await {
                clashing.push(consumer.kind().to_string());
            }
        }

        if clashing.is_empty() {
            return Ok(());
        }
        Err(ValidationError::NonUniqueRoute {
            routes: routes.join(", "),
            kinds: clashing.join(", "),
        })
    }

    fn current(&self) -> Vec<Arc<dyn RouteConsumer>> {
        self.consumers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EndpointRoute;
    use crate::repository::InMemoryEntityRepository;
    use endpoint_api::RequestMethod;

    struct FixedConsumer {
        kind: &'static str,
        routes: Vec<String>,
    }

    #[async_trait]
    impl RouteConsumer for FixedConsumer {
        fn kind(&self) -> &str {
            self.kind
        }

        async fn owns_any(&self, routes: &[String]) -> bool {
            routes.iter().any(|r| self.routes.contains(r))
        }
    }

    fn fixed(kind: &'static str, routes: &[&str]) -> Arc<dyn RouteConsumer> {
        Arc::new(FixedConsumer {
            kind,
            routes: routes.iter().map(|r| r.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_clash_names_other_kinds() {
        let consumers = RouteConsumers::new();
        consumers.register(fixed("one", &["/a"]));
        consumers.register(fixed("two", &["/a", "/b"]));

        let routes = vec!["/a".to_string()];
        // own kind is skipped
        let err = consumers.check_unique("one", &routes).await.unwrap_err();
        assert_eq!(
            err,
            ValidationError::NonUniqueRoute {
                routes: "/a".to_string(),
                kinds: "two".to_string()
            }
        );
        assert!(consumers.check_unique("one", &["/c".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_replaces_and_clear() {
        let consumers = RouteConsumers::new();
        consumers.register(fixed("one", &["/a"]));
        consumers.register(fixed("one", &["/b"]));
        assert_eq!(consumers.kinds(), vec!["one".to_string()]);
        assert!(consumers.check_unique("other", &["/a".to_string()]).await.is_ok());

        consumers.clear();
        assert!(consumers.kinds().is_empty());
        assert!(consumers.check_unique("other", &["/b".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn test_poisoned_lock_keeps_registrations() {
        let consumers = Arc::new(RouteConsumers::new());
        let poisoner = consumers.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.consumers.write().unwrap();
            panic!("poison the consumer list");
        })
        .join();
        assert!(consumers.consumers.is_poisoned());

        consumers.register(fixed("one", &["/a"]));
        assert_eq!(consumers.kinds(), vec!["one".to_string()]);
        assert!(consumers.check_unique("other", &["/a".to_string()]).await.is_err());

        consumers.clear();
        assert!(consumers.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_repository_consumer() {
        let repo = InMemoryEntityRepository::<EndpointRoute>::shared();
        let mut e = EndpointRoute::new("a", "/a", RequestMethod::Get);
        e.id = repo.reserve_id().await;
        repo.put(e).await.unwrap();

        let consumers = RouteConsumers::new();
        consumers.register_repository::<EndpointRoute, _>(repo);
        assert_eq!(consumers.kinds(), vec!["endpoint.route".to_string()]);
        assert!(consumers.check_unique("webhook", &["/a".to_string()]).await.is_err());
        assert!(consumers.check_unique("endpoint.route", &["/a".to_string()]).await.is_ok());
    }
}
