//! Configuration management for the limiter service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{validate_route_policies, RoutePolicy};

/// Prefix for environment overrides, e.g. `COLLOPI_SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "COLLOPI";

/// Main configuration for the limiter service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// How often expired entries are swept from the store, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Policies for protected routes
    #[serde(default)]
    pub policies: Vec<RoutePolicy>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            policies: Vec::new(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    3600
}

impl RateLimitingConfig {
    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AppConfig {
    /// Load configuration from an optional YAML file layered with
    /// `COLLOPI_*` environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: AppConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service must not start with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(LimiterError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        validate_route_policies(&self.rate_limiting.policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};
    use tokio_test::{assert_err, assert_ok};

    /// Environment variables are process wide, so tests that call `load`
    /// take this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(3600));
        assert!(config.rate_limiting.policies.is_empty());
        assert_ok!(config.validate());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:8080
rate_limiting:
  sweep_interval_secs: 600
  policies:
    - route: /ai-search
      policy:
        window_ms: 3600000
        max: 10
        authenticated_max: 50
    - route: /ideas
      policy:
        window_ms: 60000
        max: 30
        message: Too many ideas at once
"#;
        let config = assert_ok!(AppConfig::from_yaml(yaml));

        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.rate_limiting.sweep_interval_secs, 600);
        assert_eq!(config.rate_limiting.policies.len(), 2);

        let search = &config.rate_limiting.policies[0];
        assert_eq!(search.route, "/ai-search");
        assert_eq!(search.policy.authenticated_max, Some(50));
        assert!(search.policy.is_authentication_aware());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = assert_ok!(AppConfig::from_yaml(include_str!("../config.example.yaml")));
        assert_eq!(config.rate_limiting.policies.len(), 3);
    }

    #[test]
    fn test_from_yaml_uses_defaults_for_missing_sections() {
        let config = assert_ok!(AppConfig::from_yaml("rate_limiting:\n  policies: []\n"));
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.rate_limiting.sweep_interval_secs, 3600);
    }

    #[test]
    fn test_invalid_policy_fails_fast() {
        let yaml = r#"
rate_limiting:
  policies:
    - route: /ai-search
      policy:
        window_ms: 0
        max: 10
"#;
        assert_err!(AppConfig::from_yaml(yaml));
    }

    #[test]
    fn test_policy_missing_max_fails() {
        let yaml = r#"
rate_limiting:
  policies:
    - route: /ai-search
      policy:
        window_ms: 60000
"#;
        assert_err!(AppConfig::from_yaml(yaml));
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let yaml = r#"
rate_limiting:
  policies:
    - route: /ai-search
      policy: { window_ms: 60000, max: 10 }
    - route: /ai-search
      policy: { window_ms: 60000, max: 20 }
"#;
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than one policy"));
    }

    #[test]
    fn test_unnamed_wildcard_route_rejected() {
        let yaml = r#"
rate_limiting:
  policies:
    - route: /files/*
      policy: { window_ms: 60000, max: 10 }
"#;
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("/files/*"));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let yaml = "rate_limiting:\n  sweep_interval_secs: 0\n";
        assert_err!(AppConfig::from_yaml(yaml));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let _env = env_lock();
        assert_ok!(AppConfig::load(None));
    }

    #[test]
    fn test_load_from_file() {
        let _env = env_lock();
        let path = std::env::temp_dir().join(format!(
            "collopi-limiter-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"
rate_limiting:
  policies:
    - route: /ai-search
      policy:
        window_ms: 3600000
        max: 10
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(path.as_path()));
        std::fs::remove_file(&path).unwrap();

        let config = assert_ok!(config);
        assert_eq!(config.rate_limiting.policies.len(), 1);
        assert_eq!(config.rate_limiting.policies[0].policy.max, 10);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let _env = env_lock();
        let path = std::env::temp_dir().join("collopi-limiter-does-not-exist.yaml");
        assert_err!(AppConfig::load(Some(path.as_path())));
    }

    #[test]
    fn test_environment_overrides_file_and_defaults() {
        let _env = env_lock();
        let path = std::env::temp_dir().join(format!(
            "collopi-limiter-env-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "server:\n  listen_addr: 0.0.0.0:8080\nrate_limiting:\n  sweep_interval_secs: 600\n",
        )
        .unwrap();

        std::env::set_var("COLLOPI_SERVER__LISTEN_ADDR", "0.0.0.0:9999");
        std::env::set_var("COLLOPI_RATE_LIMITING__SWEEP_INTERVAL_SECS", "42");

        let from_file = AppConfig::load(Some(path.as_path()));
        let from_env_only = AppConfig::load(None);

        std::env::remove_var("COLLOPI_SERVER__LISTEN_ADDR");
        std::env::remove_var("COLLOPI_RATE_LIMITING__SWEEP_INTERVAL_SECS");
        std::fs::remove_file(&path).unwrap();

        let config = assert_ok!(from_file);
        assert_eq!(config.server.listen_addr, "0.0.0.0:9999".parse::<SocketAddr>().unwrap());
        assert_eq!(config.rate_limiting.sweep_interval_secs, 42);

        let config = assert_ok!(from_env_only);
        assert_eq!(config.server.listen_addr.port(), 9999);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(42));
    }
}
