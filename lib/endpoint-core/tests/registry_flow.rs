//! End to end flows: entity lifecycle, store, and two independent caches

use endpoint_api::{content_hash, HandlerDescriptor, RegistryVersion, RequestMethod, Rule, RoutingMetadata};
use endpoint_core::builtin::{builtin_handlers, ECHO_CONTROLLER};
use endpoint_core::{
    EndpointPatch, EndpointRequest, EndpointRoute, EntityRepository, InMemoryEntityRepository, InMemoryRuleStore,
    LocalRegistryCache, Resolution, RoutableEntity, RouteConsumers, RuleResolver, RuleStore, StoreError, SyncCoordinator,
    Transaction,
};
use serde_json::Value;
use std::sync::Arc;

struct Process {
    cache: LocalRegistryCache,
    resolver: RuleResolver,
}

impl Process {
    fn new(name: &str, store: Arc<InMemoryRuleStore>) -> Self {
        Self {
            cache: LocalRegistryCache::new(name, store),
            resolver: RuleResolver::new(Arc::new(builtin_handlers().unwrap())),
        }
    }

    fn resolve(&self, path: &str, method: &str) -> Resolution {
        self.resolver.resolve(&self.cache.snapshot(), path, method).unwrap()
    }
}

struct World {
    store: Arc<InMemoryRuleStore>,
    repo: Arc<InMemoryEntityRepository<EndpointRoute>>,
    sync: SyncCoordinator<EndpointRoute>,
    one: Process,
    two: Process,
}

fn world() -> World {
    let store = Arc::new(InMemoryRuleStore::new());
    let repo = InMemoryEntityRepository::<EndpointRoute>::shared();
    let consumers = Arc::new(RouteConsumers::new());
    consumers.register_repository::<EndpointRoute, _>(repo.clone());

    World {
        sync: SyncCoordinator::new(repo.clone(), store.clone(), consumers),
        one: Process::new("one", store.clone()),
        two: Process::new("two", store.clone()),
        store,
        repo,
    }
}

async fn create_synced(w: &World, route: &str) -> EndpointRoute {
    let endpoint = EndpointRoute::new("demo", route, RequestMethod::Get)
        .with_handler(HandlerDescriptor::new(ECHO_CONTROLLER, "echo").with_arg("demo"));

    let mut tx = Transaction::new();
    let endpoint = w.sync.create(&mut tx, endpoint).await.unwrap();
    tx.commit().await.unwrap();

    sync_now(w, endpoint.id).await;
    endpoint
}

async fn sync_now(w: &World, id: u64) {
    let mut tx = Transaction::new();
    w.sync.request_sync(&mut tx, id).await.unwrap();
    tx.commit().await.unwrap();
}

fn is_matched(resolution: &Resolution) -> bool {
    matches!(resolution, Resolution::Matched(_))
}

#[tokio::test]
async fn test_create_and_resolve() {
    let w = world();
    let endpoint = create_synced(&w, "/a").await;

    let rules = w.store.list(None).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].route, "/a");
    assert_eq!(rules[0].key, format!("endpoint.route:{}", endpoint.id));

    w.one.cache.ensure_fresh().await.unwrap();
    let Resolution::Matched(bound) = w.one.resolve("/a", "GET") else {
        panic!("GET /a should resolve");
    };
    let response = bound.invoke(EndpointRequest::default()).await.unwrap();
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["args"][0], "demo");

    assert!(matches!(
        w.one.resolve("/a", "POST"),
        Resolution::MethodNotAllowed { allowed } if allowed == vec![RequestMethod::Get]
    ));
    assert!(matches!(w.one.resolve("/b", "GET"), Resolution::NotFound));
}

#[tokio::test]
async fn test_route_change_bounded_staleness() {
    let w = world();
    let endpoint = create_synced(&w, "/a").await;
    w.one.cache.ensure_fresh().await.unwrap();
    w.two.cache.ensure_fresh().await.unwrap();

    let mut tx = Transaction::new();
    w.sync
        .write(&mut tx, endpoint.id, EndpointPatch::default().route("/a/new"))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    sync_now(&w, endpoint.id).await;

    // process one checks, process two has not yet
    w.one.cache.ensure_fresh().await.unwrap();
    assert!(matches!(w.one.resolve("/a", "GET"), Resolution::NotFound));
    assert!(is_matched(&w.one.resolve("/a/new", "GET")));
    assert!(is_matched(&w.two.resolve("/a", "GET")));

    w.two.cache.ensure_fresh().await.unwrap();
    assert!(matches!(w.two.resolve("/a", "GET"), Resolution::NotFound));
    assert!(is_matched(&w.two.resolve("/a/new", "GET")));
}

#[tokio::test]
async fn test_deactivate_removes_route() {
    let w = world();
    let endpoint = create_synced(&w, "/a").await;
    w.one.cache.ensure_fresh().await.unwrap();

    let mut tx = Transaction::new();
    w.sync
        .write(&mut tx, endpoint.id, EndpointPatch::default().active(false))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    sync_now(&w, endpoint.id).await;

    assert!(w.store.list(None).await.unwrap().is_empty());
    assert!(is_matched(&w.one.resolve("/a", "GET")));
    w.one.cache.ensure_fresh().await.unwrap();
    assert!(matches!(w.one.resolve("/a", "GET"), Resolution::NotFound));
}

#[tokio::test]
async fn test_rollback_never_touches_store() {
    let w = world();
    let mut tx = Transaction::new();
    let endpoint = w
        .sync
        .create(&mut tx, EndpointRoute::new("demo", "/a", RequestMethod::Get))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    let version = w.store.current_version().await.unwrap();

    let mut tx = Transaction::new();
    w.sync.request_sync(&mut tx, endpoint.id).await.unwrap();
    tx.rollback();

    assert_eq!(w.store.current_version().await.unwrap(), version);
    assert!(w.store.list(None).await.unwrap().is_empty());
    assert!(!w.repo.get(endpoint.id).await.unwrap().in_sync);
}

#[tokio::test]
async fn test_unlink_removes_route_everywhere() {
    let w = world();
    let endpoint = create_synced(&w, "/a").await;
    w.one.cache.ensure_fresh().await.unwrap();
    w.two.cache.ensure_fresh().await.unwrap();

    let mut tx = Transaction::new();
    w.sync.unlink(&mut tx, endpoint.id).await.unwrap();
    tx.commit().await.unwrap();

    for process in [&w.one, &w.two] {
        assert!(process.cache.ensure_fresh().await.unwrap().is_some());
        assert!(matches!(process.resolve("/a", "GET"), Resolution::NotFound));
    }
}

#[tokio::test]
async fn test_version_strictly_increases() {
    let store = InMemoryRuleStore::new();
    let rule = |key: &str, route: &str| {
        Rule::new(
            key,
            route,
            HandlerDescriptor::new(ECHO_CONTROLLER, "echo"),
            RoutingMetadata::default(),
            content_hash([route]),
        )
    };

    let mut last = store.current_version().await.unwrap();
    assert_eq!(last, RegistryVersion::ZERO);

    let mut steps = Vec::new();
    steps.push(store.create(vec![rule("a", "/a")]).await.unwrap());
    steps.push(store.update(vec![rule("a", "/a2")]).await.unwrap());
    steps.push(store.delete(&["missing".to_string()]).await.unwrap());
    steps.push(store.upsert(vec![rule("a", "/a3"), rule("b", "/b")]).await.unwrap());
    steps.push(store.delete(&["a".to_string()]).await.unwrap());
    steps.push(store.wipe().await.unwrap());

    for version in steps {
        assert!(version > last);
        last = version;
    }
    assert_eq!(store.current_version().await.unwrap(), last);
}

#[tokio::test]
async fn test_duplicate_fingerprint_fails() {
    let store = InMemoryRuleStore::new();
    let routing = RoutingMetadata::default();
    let handler = HandlerDescriptor::new(ECHO_CONTROLLER, "echo");
    let hash = content_hash(["/a", "public", "GET"]);

    store
        .create(vec![Rule::new("one", "/a", handler.clone(), routing.clone(), hash.clone())])
        .await
        .unwrap();
    let err = store
        .create(vec![Rule::new("two", "/other", handler, routing, hash)])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateFingerprint { owner, .. } if owner == "one"));
}

#[tokio::test]
async fn test_rule_round_trip() {
    let w = world();
    let endpoint = create_synced(&w, "/orders/<int:id>").await;
    let expected = endpoint.prepare_rules().remove(0);

    let stored = w.store.get(&expected.key).await.unwrap().unwrap();
    assert_eq!(stored.route, expected.route);
    assert_eq!(stored.handler, expected.handler);
    assert_eq!(stored.routing, expected.routing);
    assert!(stored.updated_at.is_some());

    w.two.cache.ensure_fresh().await.unwrap();
    let Resolution::Matched(bound) = w.two.resolve("/orders/12", "GET") else {
        panic!("typed route should resolve");
    };
    assert_eq!(bound.key(), expected.key);
}

#[tokio::test]
async fn test_equivalent_routes_rejected_at_write_time() {
    let w = world();
    let a = create_synced(&w, "/a").await;
    let x = create_synced(&w, "/x/<id>").await;

    for route in ["/a/", "//a", "/x/<name>", "/x/<string:slug>/"] {
        let mut tx = Transaction::new();
        let endpoint = EndpointRoute::new("shadow", route, RequestMethod::Get);
        assert!(
            w.sync.create(&mut tx, endpoint).await.is_err(),
            "{} should clash with an existing route",
            route
        );
        tx.rollback();
    }
    assert_eq!(w.store.list(None).await.unwrap().len(), 2);

    // a rule pushed past the entity layer is still caught by the store
    let mut shadow = a.prepare_rules().remove(0);
    shadow.key = "endpoint.route:999".to_string();
    shadow.route = "/x/<other>".to_string();
    shadow.routing.routes = vec![shadow.route.clone()];
    shadow.content_hash = content_hash(["/x/<other>"]);
    let err = w.store.create(vec![shadow]).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::DuplicateRoute { owner, .. } if owner == format!("endpoint.route:{}", x.id)
    ));

    w.one.cache.ensure_fresh().await.unwrap();
    let Resolution::Matched(bound) = w.one.resolve("/x/1", "GET") else {
        panic!("GET /x/1 should resolve");
    };
    assert_eq!(bound.key(), format!("endpoint.route:{}", x.id));
}
