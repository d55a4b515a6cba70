//! Response builders shared by the dispatcher and the gateway

use endpoint_api::RouteType;
use endpoint_core::EndpointResponse;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde_json::{json, Value};

pub type Body = Full<Bytes>;

fn build(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    with_header(response, CONTENT_TYPE, content_type)
}

/// Set a header, skipping values that are not valid header text
pub fn with_header(mut response: Response<Body>, name: HeaderName, value: &str) -> Response<Body> {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
    response
}

pub fn text(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    build(status, "text/plain; charset=utf-8", body.into())
}

pub fn json(status: StatusCode, value: &Value) -> Response<Body> {
    build(status, "application/json", value.to_string())
}

/// Error reply shaped after the route type
pub fn error(route_type: RouteType, status: StatusCode, message: &str) -> Response<Body> {
    match route_type {
        RouteType::Json => json(status, &json!({ "error": message })),
        RouteType::Http => text(status, format!("{}\n", message)),
    }
}

/// Convert a handler response; an out of range status becomes a 500
pub fn from_endpoint(response: EndpointResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    build(status, &response.content_type, response.body)
}
