//! Request correlation: every request carries a request id through the logs

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use tracing::{error, info};
use uuid::Uuid;

/// Header carrying the request id in and out
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Metadata key under which the request id is stored
pub const REQUEST_ID_KEY: &str = "request_id";

/// Tags requests with an id, reusing an incoming `x-request-id`
pub struct RequestTracingMiddleware {
    pub service_name: String,
}

impl RequestTracingMiddleware {
    pub fn new() -> Self {
        Self {
            service_name: "endpoint-gateway".to_string(),
        }
    }

    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Incoming id if it is a sane token, a fresh one otherwise
    pub fn request_id(context: &MiddlewareContext) -> String {
        context
            .header(REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty() && id.len() <= 128 && id.chars().all(|c| c.is_ascii_graphic()))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

impl Default for RequestTracingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Middleware for RequestTracingMiddleware {
    fn name(&self) -> &'static str {
        "RequestTracingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        let request_id = Self::request_id(context);
        context.set_metadata(REQUEST_ID_KEY, request_id.clone());

        info!(
            service = %self.service_name,
            request_id = %request_id,
            method = %context.method,
            path = %context.path,
            "Request started"
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        let request_id = context.get_metadata(REQUEST_ID_KEY).unwrap_or_default();
        info!(
            request_id = %request_id,
            status = status,
            method = %context.method,
            path = %context.path,
            "Request completed"
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        let request_id = context.get_metadata(REQUEST_ID_KEY).unwrap_or_default();
        error!(
            request_id = %request_id,
            error = %error,
            method = %context.method,
            path = %context.path,
            "Request error"
        );
        Ok(())
    }
}
