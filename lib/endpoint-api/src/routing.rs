//! Routing metadata consumed by the HTTP front door

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How the HTTP layer treats a route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// Plain HTTP request/response
    #[default]
    Http,
    /// Structured JSON payloads
    Json,
}

/// Authentication mode required to reach a route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// No credentials required
    Public,
    /// Caller must present credentials; missing ones yield 401, never a redirect
    #[default]
    UserEndpoint,
    /// Caller must present an allowed key in the `API-KEY` header, else 403
    ApiKey,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Public => "public",
            AuthMode::UserEndpoint => "user_endpoint",
            AuthMode::ApiKey => "api_key",
        }
    }
}

/// How long a cached response stays valid: until the end of the current
/// calendar day, ISO week or month (UTC)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    #[default]
    Day,
    Week,
    Month,
}

impl CachePolicy {
    /// Half-open `[start, end)` window of the period containing `now`
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = now.date_naive();
        let (first, next) = match self {
            CachePolicy::Day => (today, today + Duration::days(1)),
            CachePolicy::Week => {
                let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                (monday, monday + Duration::days(7))
            }
            CachePolicy::Month => {
                let first = today.with_day(1).unwrap_or(today);
                let (year, month) = match today.month() {
                    12 => (today.year() + 1, 1),
                    m => (today.year(), m + 1),
                };
                let next = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today + Duration::days(31));
                (first, next)
            }
        };
        (
            first.and_time(NaiveTime::MIN).and_utc(),
            next.and_time(NaiveTime::MIN).and_utc(),
        )
    }

    pub fn contains(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let (start, end) = self.window(now);
        start <= created && created < end
    }
}

/// HTTP methods an endpoint can be bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Delete => "DELETE",
        }
    }

    /// Methods carrying a request body must declare a content type
    pub fn carries_body(&self) -> bool {
        matches!(self, RequestMethod::Post | RequestMethod::Put)
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported request method: {0}")]
pub struct ParseMethodError(pub String);

impl FromStr for RequestMethod {
    type Err = ParseMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(RequestMethod::Get),
            "POST" => Ok(RequestMethod::Post),
            "PUT" => Ok(RequestMethod::Put),
            "DELETE" => Ok(RequestMethod::Delete),
            _ => Err(ParseMethodError(s.to_string())),
        }
    }
}

/// Data the HTTP layer needs to serve a rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    #[serde(rename = "type", default)]
    pub route_type: RouteType,

    #[serde(default)]
    pub auth: AuthMode,

    /// Allowed methods; empty allows every method
    #[serde(default)]
    pub methods: Vec<RequestMethod>,

    /// All URL patterns served by the rule
    #[serde(default)]
    pub routes: Vec<String>,

    #[serde(default)]
    pub csrf: bool,

    /// Expected request content type, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Names of the API keys accepted by `api_key` routes; empty accepts any known key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<String>,

    /// Serve GET responses from the response cache for this period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_policy: Option<CachePolicy>,
}

impl RoutingMetadata {
    /// Match an HTTP method against the allowed methods
    pub fn allows(&self, method: &str) -> bool {
        if self.methods.is_empty() {
            return true;
        }

        self.methods
            .iter()
            .any(|m| m.as_str().eq_ignore_ascii_case(method))
    }
}

/// Normalize a user supplied route.
///
/// Trims whitespace, forces a leading `/`, drops empty segments (so `//` and
/// a trailing `/` disappear) and prepends `prefix` when the route is not
/// already under it.
pub fn normalize_route(route: &str, prefix: Option<&str>) -> String {
    let route = canonical(route);
    let Some(prefix) = prefix.map(canonical).filter(|p| p != "/") else {
        return route;
    };

    if route == prefix || route.starts_with(&format!("{}/", prefix)) {
        route
    } else if route == "/" {
        prefix
    } else {
        format!("{}{}", prefix, route)
    }
}

fn canonical(route: &str) -> String {
    let segments: Vec<&str> = route.trim().split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<RequestMethod>().unwrap(), RequestMethod::Get);
        assert_eq!("PUT".parse::<RequestMethod>().unwrap(), RequestMethod::Put);
        assert!("PATCH".parse::<RequestMethod>().is_err());
    }

    #[test]
    fn test_allows_method() {
        let routing = RoutingMetadata {
            methods: vec![RequestMethod::Get, RequestMethod::Post],
            ..Default::default()
        };
        assert!(routing.allows("GET"));
        assert!(routing.allows("post"));
        assert!(!routing.allows("DELETE"));
    }

    #[test]
    fn test_allows_any_when_empty() {
        let routing = RoutingMetadata::default();
        assert!(routing.allows("GET"));
        assert!(routing.allows("DELETE"));
    }

    #[test]
    fn test_normalize_route() {
        assert_eq!(normalize_route("  my/route ", None), "/my/route");
        assert_eq!(normalize_route("/my/route", Some("/api")), "/api/my/route");
        assert_eq!(normalize_route("/api/my/route", Some("/api")), "/api/my/route");
        assert_eq!(normalize_route("", None), "/");
    }

    #[test]
    fn test_normalize_route_canonical() {
        assert_eq!(normalize_route("/a/", None), "/a");
        assert_eq!(normalize_route("//a//b/", None), "/a/b");
        assert_eq!(normalize_route("/", None), "/");
        assert_eq!(normalize_route("/x", Some("/api/")), "/api/x");
        assert_eq!(normalize_route("/apix", Some("/api")), "/api/apix");
        assert_eq!(normalize_route("/api", Some("/api")), "/api");
    }

    #[test]
    fn test_routing_serde_shape() {
        let routing = RoutingMetadata {
            route_type: RouteType::Json,
            auth: AuthMode::Public,
            methods: vec![RequestMethod::Get],
            routes: vec!["/a".to_string()],
            csrf: false,
            content_type: None,
            api_keys: Vec::new(),
            cache_policy: Some(CachePolicy::Week),
        };
        let value = serde_json::to_value(&routing).unwrap();
        assert_eq!(value["type"], "json");
        assert_eq!(value["auth"], "public");
        assert_eq!(value["methods"][0], "GET");
        assert_eq!(value["cache_policy"], "week");
        assert!(value.get("content_type").is_none());
        assert!(value.get("api_keys").is_none());

        let api_key: AuthMode = serde_json::from_value(serde_json::json!("api_key")).unwrap();
        assert_eq!(api_key, AuthMode::ApiKey);
    }

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    #[test]
    fn test_cache_policy_windows() {
        // a Wednesday
        let now = at("2024-07-10T15:30:00Z");
        assert_eq!(
            CachePolicy::Day.window(now),
            (at("2024-07-10T00:00:00Z"), at("2024-07-11T00:00:00Z"))
        );
        assert_eq!(
            CachePolicy::Week.window(now),
            (at("2024-07-08T00:00:00Z"), at("2024-07-15T00:00:00Z"))
        );
        assert_eq!(
            CachePolicy::Month.window(at("2024-12-31T23:59:59Z")),
            (at("2024-12-01T00:00:00Z"), at("2025-01-01T00:00:00Z"))
        );

        assert!(CachePolicy::Day.contains(at("2024-07-10T00:00:00Z"), now));
        assert!(!CachePolicy::Day.contains(at("2024-07-09T23:59:59Z"), now));
        assert!(CachePolicy::Week.contains(at("2024-07-08T08:00:00Z"), now));
        assert!(CachePolicy::Month.contains(at("2024-07-01T00:00:00Z"), now));
        assert!(!CachePolicy::Month.contains(at("2024-06-30T23:00:00Z"), now));
    }
}
