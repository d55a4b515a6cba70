//! Handlers shipped with the registry

use crate::handler::{EndpointHandler, EndpointResponse, HandlerCall, HandlerError, HandlerRegistry};
use crate::HandlerResolutionError;
use async_trait::async_trait;
use endpoint_api::HandlerDescriptor;
use serde_json::{json, Value};
use tracing::error;

pub const NOT_FOUND_CONTROLLER: &str = "endpoint.controllers.main.EndpointNotFoundController";
pub const STATIC_CONTROLLER: &str = "endpoint.controllers.main.StaticResponseController";
pub const ECHO_CONTROLLER: &str = "endpoint.controllers.main.EchoController";

/// Descriptor used for endpoints that declare no handler of their own
pub fn fallback_handler(route: &str) -> HandlerDescriptor {
    HandlerDescriptor::new(NOT_FOUND_CONTROLLER, "auto_not_found").with_arg(route)
}

/// Registry holding every builtin handler
pub fn builtin_handlers() -> Result<HandlerRegistry, HandlerResolutionError> {
    let mut registry = HandlerRegistry::new();
    registry.register(NOT_FOUND_CONTROLLER, "auto_not_found", AutoNotFound)?;
    registry.register(STATIC_CONTROLLER, "reply", StaticReply)?;
    registry.register(ECHO_CONTROLLER, "echo", Echo)?;
    Ok(registry)
}

/// Serves routes whose entity has no real handler configured
pub struct AutoNotFound;

#[async_trait]
impl EndpointHandler for AutoNotFound {
    async fn call(&self, call: HandlerCall) -> Result<EndpointResponse, HandlerError> {
        let route = call.arg(0).and_then(Value::as_str).unwrap_or(call.request.path.as_str());
        error!("Non registered endpoint for {}", route);
        Ok(EndpointResponse::not_found())
    }
}

/// Replies with the `body`, `content_type` and `status` keyword arguments
pub struct StaticReply;

#[async_trait]
impl EndpointHandler for StaticReply {
    async fn call(&self, call: HandlerCall) -> Result<EndpointResponse, HandlerError> {
        let status = match call.kwarg("status") {
            None => 200,
            Some(value) => value
                .as_u64()
                .and_then(|s| u16::try_from(s).ok())
                .filter(|s| (100..600).contains(s))
                .ok_or_else(|| HandlerError::Internal(format!("invalid status {}", value)))?,
        };

        let response = match call.kwarg("body") {
            Some(Value::String(body)) => EndpointResponse::text(status, body.clone()),
            Some(other) => EndpointResponse::json(status, other),
            None => EndpointResponse::text(status, ""),
        };

        match call.kwarg("content_type").and_then(Value::as_str) {
            Some(content_type) => Ok(EndpointResponse {
                content_type: content_type.to_string(),
                ..response
            }),
            None => Ok(response),
        }
    }
}

/// Replies with a JSON description of the call
pub struct Echo;

#[async_trait]
impl EndpointHandler for Echo {
    async fn call(&self, call: HandlerCall) -> Result<EndpointResponse, HandlerError> {
        let body = String::from_utf8_lossy(&call.request.body);
        Ok(EndpointResponse::json(
            200,
            &json!({
                "method": call.request.method,
                "path": call.request.path,
                "query": call.request.query,
                "args": call.args,
                "kwargs": call.kwargs,
                "body": body,
            }),
        ))
    }
}
