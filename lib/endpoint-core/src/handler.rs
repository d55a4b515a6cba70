//! Handler lookup: descriptors resolve to registered callables, never to
//! reflection at request time

use crate::HandlerResolutionError;
use async_trait::async_trait;
use endpoint_api::HandlerDescriptor;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Request data handed to a handler
#[derive(Clone, Debug, Default)]
pub struct EndpointRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Arguments of one handler invocation.
///
/// `args` are the rule's default positional arguments. `kwargs` holds the
/// rule's default keyword arguments overlaid with the path captures.
#[derive(Clone, Debug, Default)]
pub struct HandlerCall {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub request: EndpointRequest,
}

impl HandlerCall {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl EndpointResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: body.into().into_bytes(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: value.to_string().into_bytes(),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found\n")
    }
}

/// Failure raised by a handler while serving a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Handler failed: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> u16 {
        match self {
            HandlerError::BadRequest(_) => 400,
            HandlerError::NotFound(_) => 404,
            HandlerError::Internal(_) => 500,
        }
    }
}

/// Code serving a dynamic endpoint
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    async fn call(&self, call: HandlerCall) -> Result<EndpointResponse, HandlerError>;
}

/// Adapter turning an async closure into an [`EndpointHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EndpointHandler for FnHandler<F>
where
    F: Fn(HandlerCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<EndpointResponse, HandlerError>> + Send + 'static,
{
    async fn call(&self, call: HandlerCall) -> Result<EndpointResponse, HandlerError> {
        (self.0)(call).await
    }
}

type Controller = HashMap<String, Arc<dyn EndpointHandler>>;

/// Lookup table from `module.Controller` + method to handler.
///
/// Populated at startup and read-only afterwards; share it behind an `Arc`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    modules: HashMap<String, HashMap<String, Controller>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `method` of the controller at `controller_path`
    pub fn register<H>(
        &mut self,
        controller_path: &str,
        method: &str,
        handler: H,
    ) -> Result<(), HandlerResolutionError>
    where
        H: EndpointHandler + 'static,
    {
        let descriptor = HandlerDescriptor::new(controller_path, method);
        let (module, controller) = descriptor
            .module_and_controller()
            .ok_or_else(|| HandlerResolutionError::InvalidDescriptor(controller_path.to_string()))?;

        self.modules
            .entry(module.to_string())
            .or_default()
            .entry(controller.to_string())
            .or_default()
            .insert(method.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Register an async closure, see [`FnHandler`]
    pub fn register_fn<F, Fut>(
        &mut self,
        controller_path: &str,
        method: &str,
        f: F,
    ) -> Result<(), HandlerResolutionError>
    where
        F: Fn(HandlerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EndpointResponse, HandlerError>> + Send + 'static,
    {
        self.register(controller_path, method, FnHandler(f))
    }

    /// Resolve a descriptor: module, then controller, then method
    pub fn lookup(
        &self,
        descriptor: &HandlerDescriptor,
    ) -> Result<Arc<dyn EndpointHandler>, HandlerResolutionError> {
        let (module, controller) = descriptor
            .module_and_controller()
            .ok_or_else(|| HandlerResolutionError::InvalidDescriptor(descriptor.controller.clone()))?;

        let controllers = self
            .modules
            .get(module)
            .ok_or_else(|| HandlerResolutionError::ModuleNotFound(module.to_string()))?;
        let methods = controllers
            .get(controller)
            .ok_or_else(|| HandlerResolutionError::ClassNotFound(controller.to_string()))?;
        methods
            .get(&descriptor.method)
            .cloned()
            .ok_or_else(|| HandlerResolutionError::MethodNotFound(descriptor.method.clone()))
    }

    /// Number of registered handler methods
    pub fn len(&self) -> usize {
        self.modules
            .values()
            .flat_map(|controllers| controllers.values())
            .map(|methods| methods.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
