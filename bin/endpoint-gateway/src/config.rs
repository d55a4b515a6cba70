//! Gateway configuration: YAML file plus environment overrides

use endpoint_core::{ApiKeyRegistry, EndpointRoute, MonitorConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Path of the configuration file
pub const CONFIG_ENV: &str = "ENDPOINT_GATEWAY_CONFIG";

/// Overrides `listen`
pub const LISTEN_ENV: &str = "ENDPOINT_GATEWAY_LISTEN";

pub const DEFAULT_CONFIG_PATH: &str = "endpoint-gateway.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Key accepted on `api_key` endpoints listing `name`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: SocketAddr,

    /// Prefix forced onto every endpoint route
    pub route_prefix: Option<String>,

    /// Background version poll, 0 disables
    pub poll_interval_ms: u64,

    /// Throttle for the per-request freshness check
    pub min_check_interval_ms: u64,

    /// Signal failures answered with a forced reload before serving the last snapshot
    pub max_stale_failures: u32,

    pub log_format: LogFormat,

    pub api_keys: Vec<ApiKeyConfig>,

    /// Sweep of expired cached responses, 0 disables
    pub response_cache_gc_secs: u64,

    /// Endpoints registered at boot
    pub endpoints: Vec<EndpointRoute>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            route_prefix: None,
            poll_interval_ms: 1000,
            min_check_interval_ms: 0,
            max_stale_failures: 3,
            log_format: LogFormat::Text,
            api_keys: Vec::new(),
            response_cache_gc_secs: 3600,
            endpoints: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from the file named by `ENDPOINT_GATEWAY_CONFIG`, then apply
    /// environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_path(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Read a YAML file; a missing file yields the defaults
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!("Configuration loaded from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(LISTEN_ENV) {
            self.listen = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: LISTEN_ENV,
                value,
            })?;
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            min_check_interval: Duration::from_millis(self.min_check_interval_ms),
            max_stale_failures: self.max_stale_failures,
        }
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn response_cache_gc_interval(&self) -> Option<Duration> {
        (self.response_cache_gc_secs > 0).then(|| Duration::from_secs(self.response_cache_gc_secs))
    }

    pub fn api_key_registry(&self) -> ApiKeyRegistry {
        self.api_keys
            .iter()
            .fold(ApiKeyRegistry::new(), |keys, k| keys.with_key(&k.name, &k.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_api::{AuthMode, RequestMethod};

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.max_stale_failures, 3);
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.response_cache_gc_interval(), Some(Duration::from_secs(3600)));
        assert!(config.api_key_registry().is_empty());
        assert_eq!(config.monitor_config().min_check_interval, Duration::ZERO);
        assert_eq!(GatewayConfig::from_yaml("").unwrap(), config);
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
listen: 127.0.0.1:9000
route_prefix: /api
poll_interval_ms: 0
min_check_interval_ms: 250
log_format: json
endpoints:
  - name: Ping
    route: /ping
    request_method: GET
    auth_type: public
    handler:
      controller: endpoint.controllers.main.StaticResponseController
      method: reply
      default_kwargs:
        body: pong
  - name: Orders
    route: orders/<int:id>
    request_method: POST
    request_content_type: application/json
"#;
        let config = GatewayConfig::from_yaml(raw).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.route_prefix.as_deref(), Some("/api"));
        assert_eq!(config.poll_interval(), None);
        assert_eq!(config.monitor_config().min_check_interval, Duration::from_millis(250));
        assert_eq!(config.log_format, LogFormat::Json);

        assert_eq!(config.endpoints.len(), 2);
        let ping = &config.endpoints[0];
        assert_eq!(ping.auth_type, AuthMode::Public);
        assert_eq!(ping.handler.as_ref().unwrap().method, "reply");
        let orders = &config.endpoints[1];
        assert_eq!(orders.request_method, RequestMethod::Post);
        assert!(orders.handler.is_none());
        assert!(orders.active);
    }

    #[test]
    fn test_api_keys() {
        let raw = r#"
response_cache_gc_secs: 0
api_keys:
  - name: demo
    key: secret-1
endpoints:
  - name: Report
    route: /report
    request_method: GET
    auth_type: api_key
    api_keys: [demo]
    cache_policy: week
"#;
        let config = GatewayConfig::from_yaml(raw).unwrap();
        assert_eq!(config.response_cache_gc_interval(), None);

        let keys = config.api_key_registry();
        assert_eq!(keys.len(), 1);
        let report = &config.endpoints[0];
        assert_eq!(report.auth_type, AuthMode::ApiKey);
        assert_eq!(report.cache_policy, Some(endpoint_api::CachePolicy::Week));
        assert_eq!(keys.authorize(Some("secret-1"), &report.api_keys), Ok("demo"));

        assert!(GatewayConfig::from_yaml("api_keys:\n  - name: demo\n").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(GatewayConfig::from_yaml("listen_addr: 0.0.0.0:1\n").is_err());
    }

    #[test]
    fn test_env_override() {
        let mut config = GatewayConfig::default();
        config
            .apply_env(|name| (name == LISTEN_ENV).then(|| "127.0.0.1:7000".to_string()))
            .unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());

        let err = config
            .apply_env(|_| Some("not an address".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: LISTEN_ENV, .. }));
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let config = GatewayConfig::from_path("/nonexistent/endpoint-gateway.yaml").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }
}
