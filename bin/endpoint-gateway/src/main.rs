use anyhow::{Context, Result};
use endpoint_core::builtin::builtin_handlers;
use endpoint_core::signal::spawn_poller;
use endpoint_core::{
    EndpointRoute, EndpointRouter, InMemoryEntityRepository, InMemoryRuleStore, InvalidationMonitor,
    LocalRegistryCache, ResponseCache, RouteConsumers, RuleResolver, RuleStore, StoreVersionSignal,
    SyncCoordinator, Transaction,
};
use endpoint_http::{
    Dispatcher, LoggingMiddleware, MetricsCollector, MetricsMiddleware, MiddlewareChain, RequestTracingMiddleware,
};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod router;

use config::{GatewayConfig, LogFormat};
use router::Router;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

/// Register the configured endpoints through the regular commit path
async fn seed_endpoints(sync: &SyncCoordinator<EndpointRoute>, endpoints: Vec<EndpointRoute>) -> Result<()> {
    for endpoint in endpoints {
        let name = endpoint.name.clone();

        let mut tx = Transaction::new();
        let created = sync
            .create(&mut tx, endpoint)
            .await
            .with_context(|| format!("Failed to create endpoint {}", name))?;
        tx.commit().await?;

        let mut tx = Transaction::new();
        sync.request_sync(&mut tx, created.id).await?;
        tx.commit().await?;
        info!("  - {} -> {}", name, created.route);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load()?;
    init_tracing(config.log_format);

    info!("Starting endpoint-gateway...");

    // Create rule store
    let store = Arc::new(InMemoryRuleStore::new());
    info!("Rule store initialized");

    // Create handler registry
    let responses = Arc::new(ResponseCache::new());
    let resolver = RuleResolver::new(Arc::new(builtin_handlers()?)).with_response_cache(responses.clone());
    info!("Handler registry initialized with {} handlers", resolver.handlers().len());

    let api_keys = Arc::new(config.api_key_registry());
    info!("API keys loaded: {:?}", api_keys);

    // Create entity repository and route consumers
    let repo = InMemoryEntityRepository::<EndpointRoute>::shared();
    let consumers = Arc::new(RouteConsumers::new());
    consumers.register_repository::<EndpointRoute, _>(repo.clone());
    info!("Route consumers initialized: {:?}", consumers.kinds());

    let mut sync = SyncCoordinator::new(repo, store.clone(), consumers);
    if let Some(prefix) = &config.route_prefix {
        sync = sync.with_route_prefix(prefix.clone());
        info!("Route prefix: {}", prefix);
    }

    // Register configured endpoints
    info!("Registering {} configured endpoints", config.endpoints.len());
    seed_endpoints(&sync, config.endpoints.clone()).await?;
    for rule in store.list(None).await? {
        if let Err(e) = resolver.check(&rule) {
            warn!("Rule {} will not be served: {}", rule.key, e);
        }
    }

    // Initialize registry cache and invalidation monitor
    let cache = Arc::new(LocalRegistryCache::new("endpoint-gateway", store.clone()));
    let version = cache.reload().await?;
    let monitor = Arc::new(InvalidationMonitor::new(
        cache,
        Arc::new(StoreVersionSignal::new(store)),
        config.monitor_config(),
    ));
    info!("Registry cache initialized at {}", version);

    // Initialize metrics collector
    let metrics = MetricsCollector::new()?;
    metrics.record_freshness(endpoint_core::Freshness::Current, version);
    info!("Metrics collector initialized");

    let endpoints = Arc::new(EndpointRouter::new(monitor.clone(), resolver));
    let dispatcher = Dispatcher::new(endpoints)
        .with_metrics(metrics.clone())
        .with_api_keys(api_keys);

    if let Some(every) = config.poll_interval() {
        let collector = metrics.clone();
        let poll_cache = monitor.cache().clone();
        spawn_poller(monitor, every, move |freshness| {
            collector.record_freshness(freshness, poll_cache.cached_version());
        });
        info!("Version poller started every {:?}", every);
    } else {
        warn!("Version poller disabled, idle processes refresh on their next request");
    }

    if let Some(every) = config.response_cache_gc_interval() {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = responses.gc();
                if removed > 0 {
                    info!("Response cache GC removed {} entries", removed);
                }
            }
        });
    }

    // Initialize middleware chain
    let middleware = MiddlewareChain::new()
        .add(RequestTracingMiddleware::new())
        .add(LoggingMiddleware)
        .add(MetricsMiddleware::new(metrics.clone()));
    info!("Middleware chain initialized with tracing, logging, and metrics");

    let router = Arc::new(Router::new(dispatcher, middleware, metrics));

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("HTTP server listening on {}", config.listen);

    // Accept HTTP connections in a loop
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let router = router.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { Ok::<_, Infallible>(router.handle(req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}
