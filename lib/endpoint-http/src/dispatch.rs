//! Turns a routing outcome into an HTTP response

use crate::metrics::MetricsCollector;
use crate::response::{self, Body};
use anyhow::Result;
use endpoint_api::{AuthMode, RequestMethod, RouteType};
use endpoint_core::{ApiKeyError, ApiKeyRegistry, BoundHandler, EndpointRequest, EndpointRouter, Resolution, API_KEY_HEADER};
use http_body_util::BodyExt;
use hyper::header::{ALLOW, WWW_AUTHENTICATE};
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

/// Response of a dispatch plus the error to report to middleware, if any
pub struct Dispatched {
    pub response: Response<Body>,
    pub error: Option<String>,
}

impl Dispatched {
    fn ok(response: Response<Body>) -> Self {
        Self { response, error: None }
    }

    fn failed(response: Response<Body>, error: impl Into<String>) -> Self {
        Self {
            response,
            error: Some(error.into()),
        }
    }

    pub fn status(&self) -> u16 {
        self.response.status().as_u16()
    }
}

/// Read a full request into the form handlers receive
pub async fn endpoint_request<B>(req: Request<B>) -> Result<EndpointRequest>
where
    B: hyper::body::Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    Ok(EndpointRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        body: body.to_vec(),
    })
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Serves dynamic routes through an [`EndpointRouter`]
pub struct Dispatcher {
    router: Arc<EndpointRouter>,
    metrics: Option<MetricsCollector>,
    api_keys: Option<Arc<ApiKeyRegistry>>,
}

impl Dispatcher {
    pub fn new(router: Arc<EndpointRouter>) -> Self {
        Self {
            router,
            metrics: None,
            api_keys: None,
        }
    }

    /// Keys accepted on `api_key` routes; without them those routes always answer 403
    pub fn with_api_keys(mut self, api_keys: Arc<ApiKeyRegistry>) -> Self {
        self.api_keys = Some(api_keys);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn router(&self) -> &Arc<EndpointRouter> {
        &self.router
    }

    pub async fn dispatch(&self, request: EndpointRequest) -> Dispatched {
        let routed = self.router.route(&request.path, &request.method).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_freshness(routed.freshness, routed.version);
        }

        match routed.resolution {
            Ok(Resolution::Matched(bound)) => self.invoke(bound, request).await,
            Ok(Resolution::NotFound) => Dispatched::ok(response::text(StatusCode::NOT_FOUND, "Not Found\n")),
            Ok(Resolution::MethodNotAllowed { allowed }) => {
                let allow = allowed
                    .iter()
                    .map(RequestMethod::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                let response = response::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
                Dispatched::ok(response::with_header(response, ALLOW, &allow))
            }
            Err(e) => {
                // a configuration problem, but the client only sees a missing route
                if let Some(metrics) = &self.metrics {
                    metrics.handler_resolution_errors_total.inc();
                }
                Dispatched::failed(response::text(StatusCode::NOT_FOUND, "Not Found\n"), e.to_string())
            }
        }
    }

    async fn invoke(&self, bound: BoundHandler, request: EndpointRequest) -> Dispatched {
        let routing = bound.routing();
        let route_type = routing.route_type;

        if routing.auth == AuthMode::UserEndpoint && !request.headers.contains_key("authorization") {
            debug!(key = bound.key(), "Missing credentials for user endpoint");
            let response = response::error(route_type, StatusCode::UNAUTHORIZED, "Unauthorized");
            return Dispatched::ok(response::with_header(response, WWW_AUTHENTICATE, "Bearer"));
        }

        if routing.auth == AuthMode::ApiKey {
            let presented = request.headers.get(API_KEY_HEADER).map(String::as_str);
            let authorized = match &self.api_keys {
                Some(keys) => keys.authorize(presented, &routing.api_keys).map(|_| ()),
                None => Err(ApiKeyError::Unknown),
            };
            if let Err(e) = authorized {
                debug!(key = bound.key(), error = %e, "API key rejected");
                return Dispatched::ok(response::error(route_type, StatusCode::FORBIDDEN, "Forbidden"));
            }
        }

        if let Some(expected) = &routing.content_type {
            let carries_body = request
                .method
                .parse::<RequestMethod>()
                .map(|m| m.carries_body())
                .unwrap_or(false);
            let actual = request.headers.get("content-type").map(|ct| media_type(ct));
            if carries_body && actual.as_deref() != Some(media_type(expected).as_str()) {
                debug!(key = bound.key(), expected = %expected, actual = ?actual, "Unsupported content type");
                return Dispatched::ok(response::error(
                    route_type,
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "Unsupported Media Type",
                ));
            }
        }

        match bound.invoke(request).await {
            Ok(response) => Dispatched::ok(response::from_endpoint(response)),
            Err(e) => {
                warn!(key = bound.key(), error = %e, "Handler failed");
                let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let response = match route_type {
                    RouteType::Json => response::error(route_type, status, &e.to_string()),
                    RouteType::Http => response::text(status, format!("{}\n", status.canonical_reason().unwrap_or("Error"))),
                };
                Dispatched::failed(response, e.to_string())
            }
        }
    }
}
