//! Configuration management for Formgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FormgateError, Result};
use crate::ratelimit::{Window, DEFAULT_RECLAIM_INTERVAL, DEFAULT_WINDOW_SECS};

/// Prefix of environment variables overriding configuration values,
/// e.g. `FORMGATE__RATE_LIMITING__DEFAULT_WINDOW_SECS=30`.
const ENV_PREFIX: &str = "FORMGATE";

/// Legacy variable holding the default window in seconds.
const LEGACY_WINDOW_VAR: &str = "RATELIMIT";

/// Main configuration for the Formgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormgateConfig {
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
    /// HTTP server address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Window applied to protected routes without an override, in seconds
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,

    /// Interval between sweeps of expired client records, in seconds
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,

    /// Form field or query parameter carrying the token
    #[serde(default = "default_token_field")]
    pub token_field: String,

    /// Secret used to sign tokens; generated at startup when absent
    #[serde(default)]
    pub token_secret: Option<String>,

    /// File the client records are saved to on shutdown and loaded from on start
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// Per-route window overrides, from request path to window in seconds
    #[serde(default)]
    pub routes: HashMap<String, u64>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_window_secs: default_window_secs(),
            reclaim_interval_secs: default_reclaim_interval(),
            token_field: default_token_field(),
            token_secret: None,
            snapshot_path: None,
            routes: HashMap::new(),
        }
    }
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_reclaim_interval() -> u64 {
    DEFAULT_RECLAIM_INTERVAL.as_secs()
}

fn default_token_field() -> String {
    "_ratelimit".to_string()
}

impl RateLimitingConfig {
    /// The default window.
    pub fn default_window(&self) -> Window {
        Window::from_secs(self.default_window_secs)
    }

    /// The window for `path`: its override, or the default.
    pub fn window_for(&self, path: &str) -> Window {
        self.routes
            .get(path)
            .map(|secs| Window::from_secs(*secs))
            .unwrap_or_else(|| self.default_window())
    }

    /// Interval between reclaim sweeps.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

impl FormgateConfig {
    /// Load configuration from an optional YAML file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option(
                "rate_limiting.default_window_secs",
                std::env::var(LEGACY_WINDOW_VAR).ok(),
            )?;

        let config: FormgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FormgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FormgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;

        if rl.default_window_secs == 0 {
            return Err(FormgateError::Config(
                "rate_limiting.default_window_secs must be greater than zero".to_string(),
            ));
        }
        if rl.reclaim_interval_secs == 0 {
            return Err(FormgateError::Config(
                "rate_limiting.reclaim_interval_secs must be greater than zero".to_string(),
            ));
        }
        if rl.token_field.is_empty() {
            return Err(FormgateError::Config(
                "rate_limiting.token_field must not be empty".to_string(),
            ));
        }
        if let Some(secret) = &rl.token_secret {
            if secret.is_empty() {
                return Err(FormgateError::Config(
                    "rate_limiting.token_secret must not be empty when set".to_string(),
                ));
            }
        }
        if let Some((path, _)) = rl.routes.iter().find(|(_, secs)| **secs == 0) {
            return Err(FormgateError::Config(format!(
                "window for route {} must be greater than zero",
                path
            )));
        }
        Ok(())
    }
}
