//! Request handling: operational endpoints first, everything else is dispatched

use endpoint_core::{EndpointRouter, RegistrySnapshot};
use endpoint_http::response::{self, Body};
use endpoint_http::{endpoint_request, Dispatcher, MetricsCollector, MiddlewareChain, MiddlewareContext};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const HEALTH_PATH: &str = "/healthz";
pub const METRICS_PATH: &str = "/metrics";
pub const REGISTRY_PATH: &str = "/_registry";

/// Routes gateway requests
pub struct Router {
    dispatcher: Dispatcher,
    middleware: MiddlewareChain,
    metrics: MetricsCollector,
}

impl Router {
    pub fn new(dispatcher: Dispatcher, middleware: MiddlewareChain, metrics: MetricsCollector) -> Self {
        Self {
            dispatcher,
            middleware,
            metrics,
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointRouter> {
        self.dispatcher.router()
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: hyper::body::Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let context = MiddlewareContext::from_request(&req);
        if let Err(e) = self.middleware.on_request(&context).await {
            debug!("Middleware on_request error: {}", e);
        }

        let path = req.uri().path().to_string();
        let is_get = req.method() == Method::GET;
        let (response, error) = if path == HEALTH_PATH {
            (response::text(StatusCode::OK, "OK\n"), None)
        } else if is_get && path == METRICS_PATH {
            (self.metrics_response(), None)
        } else if is_get && path == REGISTRY_PATH {
            (self.registry_response().await, None)
        } else {
            match endpoint_request(req).await {
                Ok(request) => {
                    let dispatched = self.dispatcher.dispatch(request).await;
                    (dispatched.response, dispatched.error)
                }
                Err(e) => (
                    response::text(StatusCode::BAD_REQUEST, "Bad Request\n"),
                    Some(format!("Failed to read request: {}", e)),
                ),
            }
        };

        if let Some(error) = error {
            if let Err(e) = self.middleware.on_error(&context, &error).await {
                debug!("Middleware on_error error: {}", e);
            }
        }
        if let Err(e) = self.middleware.on_response(&context, response.status().as_u16()).await {
            debug!("Middleware on_response error: {}", e);
        }
        response
    }

    fn metrics_response(&self) -> Response<Body> {
        match self.metrics.gather() {
            Ok(text) => response::with_header(
                response::text(StatusCode::OK, text),
                hyper::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            ),
            Err(_) => response::text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n"),
        }
    }

    async fn registry_response(&self) -> Response<Body> {
        let router = self.endpoints();
        router.monitor().check().await;
        response::json(StatusCode::OK, &registry_listing(&router.cache().snapshot()))
    }
}

/// Summary of a snapshot for operators
pub fn registry_listing(snapshot: &RegistrySnapshot) -> Value {
    let rules: Vec<Value> = snapshot
        .rules()
        .map(|rule| {
            json!({
                "key": rule.key,
                "route": rule.route,
                "group": rule.group,
                "methods": rule.routing.methods,
                "auth": rule.routing.auth,
                "type": rule.routing.route_type,
                "handler": format!("{}.{}", rule.handler.controller, rule.handler.method),
            })
        })
        .collect();

    json!({
        "version": snapshot.version(),
        "count": rules.len(),
        "rules": rules,
    })
}
